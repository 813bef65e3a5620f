//! Chain execution: walks the plan layer by layer, resolving inputs, invoking actions, and
//! recording every node in the trace.
//!
//! - Layers run strictly in sequence; nodes within a layer run as concurrent tokio tasks,
//!   bounded by `max_concurrency`
//! - Trace entries are opened once a node holds a concurrency slot, so trace order is
//!   declaration order within a layer regardless of which task finishes first
//! - The failure policy decides whether a failed node stops the run (`abort`) or only its
//!   dependents (`continue`)

use std::{collections::HashMap, sync::Arc};

use chainfury_types::{ChainDefinition, FailurePolicy, NodeDefinition, RunResponse, RunStatus, RunWarning};
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    action::{ActionRegistry, InvokeOptions},
    config::EngineConfig,
    error::{AbortCause, ActionExecutionError, ActionFailure, ChainExecutionError, GraphError, NodeError},
    graph::{self, ExecutionPlan},
    resolve::{ChainInputs, NodeOutputs, resolve},
    trace::ExecutionTrace,
};

pub mod output;
mod state;

pub use output::{assemble_final_outputs, shape_outputs};
use state::RunState;

/// An invocation result and the time it completed.
type NodeOutcome = (Result<JsonValue, ActionExecutionError>, DateTime<Utc>);

/// Per-run knobs supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the chain's and the engine's failure policy.
    pub failure_policy: Option<FailurePolicy>,
    /// Cancelling this token stops dispatching; in-flight nodes finish.
    pub cancellation: CancellationToken,
    /// Identifier to use instead of a generated one.
    pub run_id: Option<String>,
}

/// Outcome of a run, complete or partial.
#[derive(Debug, Clone)]
pub struct ChainRun {
    pub run_id: String,
    pub chain_id: String,
    pub status: RunStatus,
    pub failure_policy: FailurePolicy,
    pub final_outputs: JsonMap<String, JsonValue>,
    /// Outputs of every node that succeeded.
    pub node_outputs: NodeOutputs,
    pub warnings: Vec<RunWarning>,
    pub trace: ExecutionTrace,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ChainRun {
    fn empty(run_id: String, chain_id: &str, failure_policy: FailurePolicy, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            chain_id: chain_id.to_string(),
            status: RunStatus::Aborted,
            failure_policy,
            final_outputs: JsonMap::new(),
            node_outputs: NodeOutputs::new(),
            warnings: Vec::new(),
            trace: ExecutionTrace::default(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn into_response(self, error: Option<String>) -> RunResponse {
        RunResponse {
            run_id: self.run_id,
            chain_id: self.chain_id,
            status: self.status,
            final_outputs: self.final_outputs,
            node_outputs: self.node_outputs,
            warnings: self.warnings,
            trace: self.trace.into_entries(),
            error,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

impl From<ChainRun> for RunResponse {
    fn from(run: ChainRun) -> Self {
        run.into_response(None)
    }
}

impl From<ChainExecutionError> for RunResponse {
    fn from(error: ChainExecutionError) -> Self {
        let message = error.cause.to_string();
        error.run.into_response(Some(message))
    }
}

/// Build the caller-facing response for either outcome of [`ChainExecutor::run`].
pub fn run_response(result: Result<ChainRun, ChainExecutionError>) -> RunResponse {
    match result {
        Ok(run) => run.into(),
        Err(error) => error.into(),
    }
}

/// Executes chains against a shared, immutable action registry.
#[derive(Debug, Clone)]
pub struct ChainExecutor {
    registry: Arc<ActionRegistry>,
    config: EngineConfig,
}

impl ChainExecutor {
    pub fn new(registry: Arc<ActionRegistry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate the chain's structure and every node's schema, returning the execution plan.
    pub fn plan(&self, chain: &ChainDefinition) -> Result<ExecutionPlan, GraphError> {
        let plan = graph::build(chain)?;
        self.registry.validate_chain(chain)?;
        Ok(plan)
    }

    /// Run a chain with the caller's inputs.
    ///
    /// Returns the completed run, or a [`ChainExecutionError`] carrying the partial run when
    /// the chain is invalid, a node fails under `abort`, or the run is cancelled.
    pub async fn run(&self, chain: &ChainDefinition, inputs: JsonMap<String, JsonValue>, options: RunOptions) -> Result<ChainRun, ChainExecutionError> {
        let started_at = Utc::now();
        let run_id = options.run_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let policy = options
            .failure_policy
            .or(chain.failure_policy)
            .unwrap_or(self.config.default_failure_policy);
        info!(run_id = %run_id, chain_id = %chain.id, policy = %policy, nodes = chain.nodes.len(), "starting chain run");

        let plan = match self.plan(chain) {
            Ok(plan) => plan,
            Err(error) => {
                warn!(run_id = %run_id, chain_id = %chain.id, %error, "chain rejected before execution");
                return Err(ChainExecutionError {
                    chain_id: chain.id.clone(),
                    cause: AbortCause::Graph(error),
                    run: Box::new(ChainRun::empty(run_id, &chain.id, policy, started_at)),
                });
            }
        };

        let nodes: HashMap<&str, &NodeDefinition> = chain.nodes.iter().map(|node| (node.id.as_str(), node)).collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let chain_inputs = ChainInputs::new(chain, inputs);
        let missing = chain_inputs.missing_required();
        if !missing.is_empty() {
            warn!(run_id = %run_id, chain_id = %chain.id, missing = ?missing, "required chain inputs were not supplied");
        }
        let mut state = RunState::new(chain_inputs);

        for (layer_index, layer) in plan.layers().iter().enumerate() {
            let mut in_flight: Vec<(&NodeDefinition, JoinHandle<NodeOutcome>)> = Vec::new();

            for node_id in layer {
                let Some(node) = nodes.get(node_id.as_str()).copied() else {
                    continue;
                };
                // The slot is held before the entry opens; `started_at` is when the node runs.
                let permit = Arc::clone(&semaphore).acquire_owned().await.ok();
                if let Some(reason) = state.skip_reason(&node.id, &plan, &options.cancellation) {
                    debug!(run_id = %run_id, node_id = %node.id, kind = reason.kind(), "skipping node");
                    state.skip(node, layer_index, reason);
                    continue;
                }

                let schema = self.registry.schema(&node.action_type).cloned().unwrap_or_default();
                let resolved = match resolve(node, &schema, &state.chain_inputs, &state.outputs) {
                    Ok(resolved) => resolved,
                    Err(error) => {
                        state.begin(node, layer_index, None);
                        state.fail(
                            &node.id,
                            NodeError::from(error),
                            Utc::now(),
                            policy == FailurePolicy::Abort,
                            &plan,
                            &options.cancellation,
                        );
                        continue;
                    }
                };

                state.begin(node, layer_index, Some(resolved.snapshot()));
                debug!(run_id = %run_id, node_id = %node.id, action_type = %node.action_type, layer = layer_index, "dispatching node");
                in_flight.push((node, self.dispatch(node, resolved.into_values(), permit, &options.cancellation)));
            }

            for (node, handle) in in_flight {
                let (result, finished_at) = handle.await.unwrap_or_else(|join_error| {
                    let error = ActionExecutionError::new(&node.action_type, &node.id, ActionFailure::Panicked(join_error.to_string()));
                    (Err(error), Utc::now())
                });
                match result {
                    Ok(raw) => {
                        let schema = self.registry.schema(&node.action_type).cloned().unwrap_or_default();
                        let outputs = shape_outputs(node, &schema, raw);
                        debug!(run_id = %run_id, node_id = %node.id, outputs = outputs.len(), "node succeeded");
                        state.succeed(&node.id, outputs, finished_at);
                    }
                    Err(error) => {
                        state.fail(
                            &node.id,
                            NodeError::from(error),
                            finished_at,
                            policy == FailurePolicy::Abort,
                            &plan,
                            &options.cancellation,
                        );
                    }
                }
            }

            state.observe_cancellation(&options.cancellation);
            if state.is_halted() {
                debug!(run_id = %run_id, layer = layer_index, "dispatching halted");
            }
        }
        state.observe_cancellation(&options.cancellation);

        let (trace, node_outputs, cause) = state.finish();
        let (final_outputs, warnings) = assemble_final_outputs(chain, &node_outputs, &trace);
        let status = if cause.is_some() { RunStatus::Aborted } else { RunStatus::Completed };
        let run = ChainRun {
            run_id,
            chain_id: chain.id.clone(),
            status,
            failure_policy: policy,
            final_outputs,
            node_outputs,
            warnings,
            trace,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            run_id = %run.run_id,
            chain_id = %run.chain_id,
            status = ?run.status,
            succeeded = run.node_outputs.len(),
            warnings = run.warnings.len(),
            "chain run finished"
        );

        match cause {
            None => Ok(run),
            Some(cause) => Err(ChainExecutionError {
                chain_id: chain.id.clone(),
                cause,
                run: Box::new(run),
            }),
        }
    }

    fn dispatch(
        &self,
        node: &NodeDefinition,
        inputs: JsonMap<String, JsonValue>,
        permit: Option<OwnedSemaphorePermit>,
        cancellation: &CancellationToken,
    ) -> JoinHandle<NodeOutcome> {
        let registry = Arc::clone(&self.registry);
        let action_type = node.action_type.clone();
        let node_id = node.id.clone();
        let config = node.config.clone();
        let options = InvokeOptions {
            timeout_ms: node.timeout_ms,
            default_timeout_ms: self.config.default_timeout_ms,
            cancellation: cancellation.clone(),
        };

        tokio::spawn(async move {
            let _permit = permit;
            let result = registry.invoke(&action_type, &node_id, &config, &inputs, options).await;
            (result, Utc::now())
        })
    }
}
