//! Append-only execution trace.
//!
//! Entries are appended in the order nodes start (or are skipped), which the executor keeps
//! equal to declaration order within each layer. An entry is finalized exactly once; later
//! attempts are rejected so a recorded outcome can never be rewritten.

use std::collections::HashMap;

use chainfury_types::{NodeStatus, TraceEntry, TraceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::error::NodeError;

/// Misuse of the recorder.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TraceRecordError {
    #[error("node '{node_id}' already has a trace entry")]
    AlreadyRecorded { node_id: String },

    #[error("node '{node_id}' has no trace entry to finalize")]
    NotStarted { node_id: String },

    #[error("trace entry for node '{node_id}' is already finalized")]
    AlreadyFinalized { node_id: String },
}

/// Builds an [`ExecutionTrace`] while a run progresses.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    entries: Vec<TraceEntry>,
    positions: HashMap<String, usize>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a `running` entry for a node.
    pub fn begin(
        &mut self,
        node_id: &str,
        action_type: &str,
        layer: usize,
        inputs: Option<JsonMap<String, JsonValue>>,
    ) -> Result<(), TraceRecordError> {
        self.push(TraceEntry {
            node_id: node_id.to_string(),
            action_type: action_type.to_string(),
            layer,
            status: NodeStatus::Running,
            inputs,
            outputs: None,
            error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_ms: 0,
        })
    }

    /// Finalize a running entry as succeeded (with outputs) or failed (with the error).
    pub fn finish(&mut self, node_id: &str, outcome: Result<JsonMap<String, JsonValue>, &NodeError>) -> Result<(), TraceRecordError> {
        self.finish_at(node_id, outcome, Utc::now())
    }

    /// [`Self::finish`] with the time the node actually completed.
    pub fn finish_at(
        &mut self,
        node_id: &str,
        outcome: Result<JsonMap<String, JsonValue>, &NodeError>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), TraceRecordError> {
        let position = *self.positions.get(node_id).ok_or_else(|| TraceRecordError::NotStarted {
            node_id: node_id.to_string(),
        })?;
        let entry = &mut self.entries[position];
        if entry.status.is_terminal() {
            return Err(TraceRecordError::AlreadyFinalized {
                node_id: node_id.to_string(),
            });
        }

        entry.duration_ms = entry
            .started_at
            .map(|started_at| u64::try_from((finished_at - started_at).num_milliseconds()).unwrap_or(0))
            .unwrap_or(0);
        entry.finished_at = Some(finished_at);
        match outcome {
            Ok(outputs) => {
                entry.status = NodeStatus::Succeeded;
                entry.outputs = Some(outputs);
            }
            Err(error) => {
                entry.status = NodeStatus::Failed;
                entry.error = Some(trace_error(error));
            }
        }
        Ok(())
    }

    /// Record a node that will never run.
    pub fn skip(&mut self, node_id: &str, action_type: &str, layer: usize, reason: &NodeError) -> Result<(), TraceRecordError> {
        self.push(TraceEntry {
            node_id: node_id.to_string(),
            action_type: action_type.to_string(),
            layer,
            status: NodeStatus::Skipped,
            inputs: None,
            outputs: None,
            error: Some(trace_error(reason)),
            started_at: None,
            finished_at: None,
            duration_ms: 0,
        })
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.positions.get(node_id).map(|position| self.entries[*position].status)
    }

    pub fn into_trace(self) -> ExecutionTrace {
        ExecutionTrace { entries: self.entries }
    }

    fn push(&mut self, entry: TraceEntry) -> Result<(), TraceRecordError> {
        if self.positions.contains_key(&entry.node_id) {
            return Err(TraceRecordError::AlreadyRecorded { node_id: entry.node_id });
        }
        self.positions.insert(entry.node_id.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }
}

fn trace_error(error: &NodeError) -> TraceError {
    TraceError {
        kind: error.kind().to_string(),
        message: error.to_string(),
    }
}

/// Immutable, ordered record of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionTrace {
    entries: Vec<TraceEntry>,
}

impl ExecutionTrace {
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn get(&self, node_id: &str) -> Option<&TraceEntry> {
        self.entries.iter().find(|entry| entry.node_id == node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.get(node_id).map(|entry| entry.status)
    }

    /// Number of entries with the given status.
    pub fn count(&self, status: NodeStatus) -> usize {
        self.entries.iter().filter(|entry| entry.status == status).count()
    }

    /// Node identifiers in trace order.
    pub fn node_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.node_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<TraceEntry> {
        self.entries
    }
}
