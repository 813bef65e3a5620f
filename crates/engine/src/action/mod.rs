//! Action contract and the registry that binds action types to implementations.
//!
//! - [`Action`] is the single capability every node executes through
//! - [`FnAction`] adapts plain closures, mostly for tests and small programmatic steps
//! - [`registry::ActionRegistry`] validates nodes against schemas and wraps invocations with
//!   timeouts, input checks, and panic capture
//! - [`builtin`] ships the actions available to every engine instance

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio_util::sync::CancellationToken;

pub mod builtin;
pub mod registry;

pub use registry::{ActionDescriptor, ActionRegistry, InvokeOptions};

/// Per-invocation metadata handed to an action.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Node being executed.
    pub node_id: String,
    /// Registered type of the action.
    pub action_type: String,
    /// Child of the run's cancellation token. Long-running actions should observe it.
    pub cancellation: CancellationToken,
}

/// A callable capability executed by chain nodes.
///
/// Implementations must be safe to invoke concurrently from several nodes of the same run.
#[async_trait]
pub trait Action: Send + Sync {
    /// Execute with the node's static `config` and its resolved `inputs`.
    async fn invoke(&self, config: &JsonMap<String, JsonValue>, inputs: &JsonMap<String, JsonValue>, ctx: &ActionContext) -> anyhow::Result<JsonValue>;
}

type ActionFn = dyn Fn(&JsonMap<String, JsonValue>, &JsonMap<String, JsonValue>) -> anyhow::Result<JsonValue> + Send + Sync;

/// Adapts a synchronous closure to the [`Action`] contract.
pub struct FnAction {
    function: Box<ActionFn>,
}

impl FnAction {
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(&JsonMap<String, JsonValue>, &JsonMap<String, JsonValue>) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        Self {
            function: Box::new(function),
        }
    }
}

impl std::fmt::Debug for FnAction {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("FnAction").finish_non_exhaustive()
    }
}

#[async_trait]
impl Action for FnAction {
    async fn invoke(&self, config: &JsonMap<String, JsonValue>, inputs: &JsonMap<String, JsonValue>, _ctx: &ActionContext) -> anyhow::Result<JsonValue> {
        (self.function)(config, inputs)
    }
}
