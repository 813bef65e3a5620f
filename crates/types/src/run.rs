//! Run responses and execution trace records returned to callers and persisted for audit.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Per-node lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Succeeded, failed, and skipped are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

/// Chain-level outcome reported to the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every reachable node reached a terminal state; outputs may be partial.
    Completed,
    /// The run stopped early (graph error, node failure under `abort`, or cancellation).
    Aborted,
}

/// Error detail attached to a failed or skipped trace entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceError {
    /// Stable error category, for example `resolution`, `action`, `dependency_failed`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

/// One node's record in the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub node_id: String,
    pub action_type: String,
    /// Dependency layer the node belongs to.
    pub layer: usize,
    pub status: NodeStatus,
    /// Snapshot of the resolved inputs, with secret fields redacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<JsonMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<JsonMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TraceError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Non-fatal notice attached to a completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunWarning {
    /// Final output name the warning is about.
    pub output: String,
    /// Node the output was mapped from.
    pub node_id: String,
    pub message: String,
}

/// Complete answer to a run request. Always carries the trace, even when the run aborted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub run_id: String,
    pub chain_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub final_outputs: JsonMap<String, JsonValue>,
    /// Outputs of every node that succeeded, keyed by node id.
    #[serde(default)]
    pub node_outputs: IndexMap<String, JsonMap<String, JsonValue>>,
    #[serde(default)]
    pub warnings: Vec<RunWarning>,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
    /// Summary of the fatal cause when the run aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResponse {
    /// Returns the trace entry for a node, if it was recorded.
    pub fn entry(&self, node_id: &str) -> Option<&TraceEntry> {
        self.trace.iter().find(|entry| entry.node_id == node_id)
    }
}
