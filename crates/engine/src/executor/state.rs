//! Mutable bookkeeping for a single run.
//!
//! Only the orchestrating loop touches this state. Node tasks receive owned snapshots of
//! their inputs and hand results back through their join handles.

use std::collections::HashSet;

use chainfury_types::NodeDefinition;
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    error::{AbortCause, ActionFailure, NodeError},
    graph::ExecutionPlan,
    resolve::{ChainInputs, NodeOutputs},
    trace::{ExecutionTrace, TraceRecorder},
};

/// Why dispatching stopped.
enum Halt {
    NodeFailed {
        node_id: String,
        error: NodeError,
        dependents: HashSet<String>,
    },
    Cancelled,
}

pub(crate) struct RunState {
    pub(crate) chain_inputs: ChainInputs,
    pub(crate) outputs: NodeOutputs,
    recorder: TraceRecorder,
    unsuccessful: HashSet<String>,
    halt: Option<Halt>,
}

impl RunState {
    pub(crate) fn new(chain_inputs: ChainInputs) -> Self {
        Self {
            chain_inputs,
            outputs: NodeOutputs::new(),
            recorder: TraceRecorder::new(),
            unsuccessful: HashSet::new(),
            halt: None,
        }
    }

    /// Decide whether a node must be skipped instead of dispatched.
    ///
    /// Cancellation wins. After an abort, dependents of the failed node are reported as
    /// `dependency_failed` and every other node as `aborted`. Otherwise a node is skipped when
    /// one of its dependencies did not succeed.
    pub(crate) fn skip_reason(&self, node_id: &str, plan: &ExecutionPlan, cancellation: &CancellationToken) -> Option<NodeError> {
        if cancellation.is_cancelled() || matches!(self.halt, Some(Halt::Cancelled)) {
            return Some(NodeError::Cancelled {
                node_id: node_id.to_string(),
            });
        }

        let failed_dependency = plan.dependencies(node_id).iter().find(|dependency| self.unsuccessful.contains(*dependency));
        if let Some(Halt::NodeFailed {
            node_id: failed_node,
            dependents,
            ..
        }) = &self.halt
        {
            if dependents.contains(node_id) {
                return Some(NodeError::DependencyFailed {
                    node_id: node_id.to_string(),
                    upstream: failed_dependency.cloned().unwrap_or_else(|| failed_node.clone()),
                });
            }
            return Some(NodeError::Aborted {
                node_id: node_id.to_string(),
                failed_node: failed_node.clone(),
            });
        }

        failed_dependency.map(|upstream| NodeError::DependencyFailed {
            node_id: node_id.to_string(),
            upstream: upstream.clone(),
        })
    }

    pub(crate) fn begin(&mut self, node: &NodeDefinition, layer: usize, inputs: Option<JsonMap<String, JsonValue>>) {
        if let Err(error) = self.recorder.begin(&node.id, &node.action_type, layer, inputs) {
            warn!(node_id = %node.id, %error, "trace entry rejected");
        }
    }

    pub(crate) fn skip(&mut self, node: &NodeDefinition, layer: usize, reason: NodeError) {
        if matches!(reason, NodeError::Cancelled { .. }) && self.halt.is_none() {
            self.halt = Some(Halt::Cancelled);
        }
        if let Err(error) = self.recorder.skip(&node.id, &node.action_type, layer, &reason) {
            warn!(node_id = %node.id, %error, "trace entry rejected");
        }
        self.unsuccessful.insert(node.id.clone());
    }

    pub(crate) fn succeed(&mut self, node_id: &str, outputs: JsonMap<String, JsonValue>, finished_at: DateTime<Utc>) {
        if let Err(error) = self.recorder.finish_at(node_id, Ok(outputs.clone()), finished_at) {
            warn!(node_id = %node_id, %error, "trace entry rejected");
        }
        self.outputs.insert(node_id.to_string(), outputs);
    }

    /// Record a failed node and, under the abort policy, stop further dispatching.
    pub(crate) fn fail(
        &mut self,
        node_id: &str,
        error: NodeError,
        finished_at: DateTime<Utc>,
        abort_on_failure: bool,
        plan: &ExecutionPlan,
        cancellation: &CancellationToken,
    ) {
        warn!(node_id = %node_id, kind = error.kind(), %error, "node failed");
        if let Err(record_error) = self.recorder.finish_at(node_id, Err(&error), finished_at) {
            warn!(node_id = %node_id, error = %record_error, "trace entry rejected");
        }
        self.unsuccessful.insert(node_id.to_string());

        if self.halt.is_some() {
            return;
        }
        let cancelled_invocation = matches!(
            &error,
            NodeError::Action(action_error) if matches!(action_error.cause, ActionFailure::Cancelled)
        );
        if cancelled_invocation && cancellation.is_cancelled() {
            self.halt = Some(Halt::Cancelled);
        } else if abort_on_failure {
            let dependents = plan.transitive_dependents(node_id).into_iter().map(str::to_string).collect();
            self.halt = Some(Halt::NodeFailed {
                node_id: node_id.to_string(),
                error,
                dependents,
            });
        }
    }

    /// Mark the run cancelled when the token fired and nothing else stopped it first.
    pub(crate) fn observe_cancellation(&mut self, cancellation: &CancellationToken) {
        if self.halt.is_none() && cancellation.is_cancelled() {
            self.halt = Some(Halt::Cancelled);
        }
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    /// Trace, successful outputs, and the abort cause if the run stopped early.
    pub(crate) fn finish(self) -> (ExecutionTrace, NodeOutputs, Option<AbortCause>) {
        let cause = self.halt.map(|halt| match halt {
            Halt::NodeFailed { node_id, error, .. } => AbortCause::NodeFailed { node_id, error },
            Halt::Cancelled => AbortCause::Cancelled,
        });
        (self.recorder.into_trace(), self.outputs, cause)
    }
}
