//! Closed registry of action types.
//!
//! Registration happens before execution through `&mut self`; afterwards the registry is
//! shared read-only behind an `Arc`, so no action can be added or replaced while a run is in
//! flight.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chainfury_types::{ActionSchema, ChainDefinition, NodeDefinition, validate_candidate_value};
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Action, ActionContext};
use crate::{
    error::{ActionExecutionError, ActionFailure, GraphError, RegistryError},
    resolve::json_type_name,
};

struct RegisteredAction {
    schema: ActionSchema,
    action: Arc<dyn Action>,
}

/// Catalogue entry returned by [`ActionRegistry::describe`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    pub action_type: String,
    pub schema: ActionSchema,
}

/// Per-invocation settings supplied by the executor.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Node-level timeout; wins over the schema and engine defaults.
    pub timeout_ms: Option<u64>,
    /// Engine-wide fallback timeout.
    pub default_timeout_ms: Option<u64>,
    /// Token the action's child token is derived from.
    pub cancellation: CancellationToken,
}

/// Maps action type names to their schema and implementation.
#[derive(Default)]
pub struct ActionRegistry {
    actions: IndexMap<String, RegisteredAction>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ActionRegistry").field("actions", &self.actions.keys().collect::<Vec<_>>()).finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation under `action_type`.
    pub fn register(&mut self, action_type: impl Into<String>, schema: ActionSchema, action: impl Action + 'static) -> Result<(), RegistryError> {
        self.register_shared(action_type, schema, Arc::new(action))
    }

    /// Register an implementation that is already shared.
    pub fn register_shared(&mut self, action_type: impl Into<String>, schema: ActionSchema, action: Arc<dyn Action>) -> Result<(), RegistryError> {
        let action_type = action_type.into();
        if action_type.trim().is_empty() {
            return Err(RegistryError::EmptyActionType);
        }
        if self.actions.contains_key(&action_type) {
            return Err(RegistryError::DuplicateActionType { action_type });
        }
        debug!(action_type = %action_type, inputs = schema.inputs.len(), "registered action");
        self.actions.insert(action_type, RegisteredAction { schema, action });
        Ok(())
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.actions.contains_key(action_type)
    }

    pub fn schema(&self, action_type: &str) -> Option<&ActionSchema> {
        self.actions.get(action_type).map(|entry| &entry.schema)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Catalogue of registered actions in registration order.
    pub fn describe(&self) -> Vec<ActionDescriptor> {
        self.actions
            .iter()
            .map(|(action_type, entry)| ActionDescriptor {
                action_type: action_type.clone(),
                schema: entry.schema.clone(),
            })
            .collect()
    }

    /// Check a node's bindings against its action schema.
    ///
    /// A required input is satisfied by a binding, a schema default, or a chain input of the
    /// same name declared by `chain`.
    pub fn validate_node(&self, node: &NodeDefinition, chain: &ChainDefinition) -> Result<(), GraphError> {
        let schema = self.schema(&node.action_type).ok_or_else(|| GraphError::UnknownActionType {
            node_id: node.id.clone(),
            action_type: node.action_type.clone(),
        })?;

        if !schema.additional_inputs
            && let Some(input) = node.input_bindings.keys().find(|input| !schema.inputs.contains_key(*input))
        {
            return Err(GraphError::UndeclaredInput {
                node_id: node.id.clone(),
                action_type: node.action_type.clone(),
                input: input.clone(),
            });
        }

        for (input, spec) in schema.required_inputs() {
            let satisfied = node.input_bindings.contains_key(input) || spec.default.is_some() || chain.inputs.contains_key(input);
            if !satisfied {
                return Err(GraphError::MissingRequiredBinding {
                    node_id: node.id.clone(),
                    action_type: node.action_type.clone(),
                    input: input.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validate every node of a chain, stopping at the first problem.
    pub fn validate_chain(&self, chain: &ChainDefinition) -> Result<(), GraphError> {
        chain.nodes.iter().try_for_each(|node| self.validate_node(node, chain))
    }

    /// Invoke the action registered as `action_type` on behalf of `node_id`.
    ///
    /// Inputs are re-checked against the schema. The effective timeout is the node override,
    /// then the schema default, then the engine default. Errors, timeouts, panics, and
    /// cancellation all come back as [`ActionExecutionError`].
    pub async fn invoke(
        &self,
        action_type: &str,
        node_id: &str,
        config: &JsonMap<String, JsonValue>,
        inputs: &JsonMap<String, JsonValue>,
        options: InvokeOptions,
    ) -> Result<JsonValue, ActionExecutionError> {
        let fail = |cause: ActionFailure| ActionExecutionError::new(action_type, node_id, cause);

        let entry = self.actions.get(action_type).ok_or_else(|| {
            fail(ActionFailure::Implementation(anyhow::anyhow!("action type '{}' is not registered", action_type)))
        })?;
        check_inputs(&entry.schema, inputs).map_err(&fail)?;

        let ctx = ActionContext {
            node_id: node_id.to_string(),
            action_type: action_type.to_string(),
            cancellation: options.cancellation.child_token(),
        };
        if ctx.cancellation.is_cancelled() {
            return Err(fail(ActionFailure::Cancelled));
        }

        let timeout_ms = options.timeout_ms.or(entry.schema.timeout_ms).or(options.default_timeout_ms);
        let call = AssertUnwindSafe(entry.action.invoke(config, inputs, &ctx)).catch_unwind();
        let outcome = match timeout_ms {
            Some(timeout_ms) => match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    ctx.cancellation.cancel();
                    return Err(fail(ActionFailure::Timeout { timeout_ms }));
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) if ctx.cancellation.is_cancelled() => Err(fail(ActionFailure::Cancelled)),
            Ok(Err(error)) => Err(fail(ActionFailure::Implementation(error))),
            Err(payload) => Err(fail(ActionFailure::Panicked(panic_message(payload.as_ref())))),
        }
    }
}

fn check_inputs(schema: &ActionSchema, inputs: &JsonMap<String, JsonValue>) -> Result<(), ActionFailure> {
    let invalid = |input: &str, message: String| ActionFailure::InvalidInput {
        input: input.to_string(),
        message,
    };

    for (name, spec) in &schema.inputs {
        match inputs.get(name) {
            None if spec.required => return Err(invalid(name, "required input is missing".to_string())),
            None => {}
            Some(value) => {
                if !spec.field_type.matches(value) {
                    return Err(invalid(name, format!("expected {}, found {}", spec.field_type, json_type_name(value))));
                }
                if let Some(validation) = &spec.validate {
                    validate_candidate_value(value, validation).map_err(|message| invalid(name, message))?;
                }
            }
        }
    }

    if !schema.additional_inputs
        && let Some(extra) = inputs.keys().find(|name| !schema.inputs.contains_key(*name))
    {
        return Err(invalid(extra, "input is not declared by the action".to_string()));
    }
    Ok(())
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic payload was not a string".to_string()
    }
}
