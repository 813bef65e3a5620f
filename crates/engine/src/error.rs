//! Error types raised while building, resolving, and executing chains.
//!
//! Graph errors are fatal before any node runs. Resolution and action errors are scoped to a
//! single node and are routed through the run's failure policy. Everything that ends a run
//! early surfaces as a [`ChainExecutionError`] carrying the partial run.

use chainfury_types::FieldType;
use thiserror::Error;

use crate::executor::ChainRun;

/// Structural problems found while validating a chain definition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("chain contains a node with an empty identifier")]
    EmptyNodeId,

    #[error("duplicate node identifier detected: '{node_id}'")]
    DuplicateNode { node_id: String },

    #[error("node '{node_id}' input '{input}' references unknown node '{referenced}'")]
    UnknownNode {
        node_id: String,
        input: String,
        referenced: String,
    },

    #[error("node '{node_id}' input '{input}' references its own output")]
    SelfReference { node_id: String, input: String },

    #[error("node '{node_id}' input '{input}' references undeclared chain input '{chain_input}'")]
    UndeclaredChainInput {
        node_id: String,
        input: String,
        chain_input: String,
    },

    /// A back-edge was found. `path` lists the cycle in "depends on" order and ends with the
    /// node it starts from.
    #[error("cycle detected at node '{node_id}': {}", path.join(" -> "))]
    Cyclic { node_id: String, path: Vec<String> },

    #[error("final output '{output}' maps to unknown node '{node_id}'")]
    UnknownOutputNode { output: String, node_id: String },

    #[error("node '{node_id}' uses unregistered action type '{action_type}'")]
    UnknownActionType { node_id: String, action_type: String },

    #[error("node '{node_id}' binds input '{input}' which action '{action_type}' does not declare")]
    UndeclaredInput {
        node_id: String,
        action_type: String,
        input: String,
    },

    #[error("node '{node_id}' has no binding, default, or chain input for required input '{input}' of action '{action_type}'")]
    MissingRequiredBinding {
        node_id: String,
        action_type: String,
        input: String,
    },
}

/// Failures while turning a node's bindings into concrete input values.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolutionError {
    #[error("node '{node_id}' input '{input}' requires chain input '{chain_input}', which was not supplied")]
    MissingChainInput {
        node_id: String,
        input: String,
        chain_input: String,
    },

    #[error("node '{node_id}' input '{input}' is required but has no value")]
    MissingRequiredInput { node_id: String, input: String },

    #[error("node '{node_id}' input '{input}' expects '{field}' from node '{source_node}', which was not produced")]
    UpstreamOutputMissing {
        node_id: String,
        input: String,
        source_node: String,
        field: String,
    },

    #[error("node '{node_id}' input '{input}' expects {expected}, found {found}")]
    TypeMismatch {
        node_id: String,
        input: String,
        expected: FieldType,
        found: String,
    },

    #[error("node '{node_id}' input '{input}' failed validation: {message}")]
    ValidationFailed {
        node_id: String,
        input: String,
        message: String,
    },
}

impl ResolutionError {
    pub fn node_id(&self) -> &str {
        match self {
            ResolutionError::MissingChainInput { node_id, .. }
            | ResolutionError::MissingRequiredInput { node_id, .. }
            | ResolutionError::UpstreamOutputMissing { node_id, .. }
            | ResolutionError::TypeMismatch { node_id, .. }
            | ResolutionError::ValidationFailed { node_id, .. } => node_id,
        }
    }
}

/// Why an action invocation failed.
#[derive(Debug, Error)]
pub enum ActionFailure {
    /// The implementation returned an error.
    #[error("{0:#}")]
    Implementation(anyhow::Error),

    #[error("invocation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("invocation panicked: {0}")]
    Panicked(String),

    /// Inputs no longer satisfy the action schema at invocation time.
    #[error("invalid input '{input}': {message}")]
    InvalidInput { input: String, message: String },

    #[error("invocation was cancelled")]
    Cancelled,
}

/// An action invocation failed. Never escapes the executor unwrapped.
#[derive(Debug, Error)]
#[error("action '{action_type}' failed on node '{node_id}': {cause}")]
pub struct ActionExecutionError {
    pub action_type: String,
    pub node_id: String,
    pub cause: ActionFailure,
}

impl ActionExecutionError {
    pub fn new(action_type: impl Into<String>, node_id: impl Into<String>, cause: ActionFailure) -> Self {
        Self {
            action_type: action_type.into(),
            node_id: node_id.into(),
            cause,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, ActionFailure::Timeout { .. })
    }
}

/// Node-scoped failure or skip reason recorded in the trace.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Action(#[from] ActionExecutionError),

    #[error("node '{node_id}' skipped because dependency '{upstream}' did not succeed")]
    DependencyFailed { node_id: String, upstream: String },

    #[error("node '{node_id}' skipped because the run was cancelled")]
    Cancelled { node_id: String },

    #[error("node '{node_id}' skipped because the run aborted after node '{failed_node}' failed")]
    Aborted { node_id: String, failed_node: String },
}

impl NodeError {
    /// Stable category written to trace entries.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Resolution(_) => "resolution",
            NodeError::Action(error) if error.is_timeout() => "timeout",
            NodeError::Action(error) if matches!(error.cause, ActionFailure::Cancelled) => "cancelled",
            NodeError::Action(_) => "action",
            NodeError::DependencyFailed { .. } => "dependency_failed",
            NodeError::Cancelled { .. } => "cancelled",
            NodeError::Aborted { .. } => "aborted",
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            NodeError::Resolution(error) => error.node_id(),
            NodeError::Action(error) => &error.node_id,
            NodeError::DependencyFailed { node_id, .. } | NodeError::Cancelled { node_id } | NodeError::Aborted { node_id, .. } => node_id,
        }
    }
}

/// Problems registering an action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("action type '{action_type}' is already registered")]
    DuplicateActionType { action_type: String },

    #[error("action type must not be empty")]
    EmptyActionType,
}

/// Fatal reason a run stopped before completing.
#[derive(Debug, Error)]
pub enum AbortCause {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("node '{node_id}' failed: {error}")]
    NodeFailed { node_id: String, error: NodeError },

    #[error("run was cancelled")]
    Cancelled,
}

/// Top-level failure of a run. Always carries the partial run and its trace.
#[derive(Debug, Error)]
#[error("chain '{chain_id}' aborted: {cause}")]
pub struct ChainExecutionError {
    pub chain_id: String,
    pub cause: AbortCause,
    pub run: Box<ChainRun>,
}

impl ChainExecutionError {
    /// Identifier of the node whose failure aborted the run, if any.
    pub fn failed_node(&self) -> Option<&str> {
        match &self.cause {
            AbortCause::NodeFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}
