//! # ChainFury Engine
//!
//! The ChainFury engine validates and executes chains: directed graphs of actions whose
//! outputs feed downstream actions. Given a chain definition and caller inputs it derives a
//! dependency-respecting execution order, runs each node with resolved inputs, applies the
//! failure policy, and returns final outputs together with an auditable trace.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use chainfury_engine::{ActionRegistry, ChainExecutor, EngineConfig, RunOptions, builtin, parse_chain_str};
//!
//! # tokio::runtime::Runtime::new()?.block_on(async {
//! let chain = parse_chain_str(r#"
//! id: greet
//! nodes:
//!   - id: render
//!     actionType: template
//!     config: { template: "Hello {{ name }}" }
//!     inputBindings:
//!       name: { input: name }
//! outputMapping:
//!   greeting: { node: render, field: text }
//! "#)?;
//!
//! let mut registry = ActionRegistry::new();
//! builtin::register_builtin_actions(&mut registry)?;
//! let executor = ChainExecutor::new(Arc::new(registry), EngineConfig::default());
//!
//! let inputs = serde_json::json!({ "name": "Ada" }).as_object().cloned().unwrap_or_default();
//! let run = executor.run(&chain, inputs, RunOptions::default()).await?;
//! assert_eq!(run.final_outputs["greeting"], "Hello Ada");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`graph`**: validation, cycle detection, and layered ordering
//! - **`resolve`**: binding resolution, type coercion, and value validation
//! - **`action`**: the action contract, registry, and built-in actions
//! - **`executor`**: layer-by-layer execution, failure policies, and output shaping
//! - **`trace`**: append-only execution trace
//! - **`config`**: engine configuration file

use std::{fs, path::Path};

use anyhow::{Context, Result};
use chainfury_types::ChainDefinition;

pub mod action;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod resolve;
pub mod trace;

pub use action::{Action, ActionContext, ActionDescriptor, ActionRegistry, FnAction, InvokeOptions, builtin};
pub use config::{ConfigError, EngineConfig};
pub use error::{AbortCause, ActionExecutionError, ActionFailure, ChainExecutionError, GraphError, NodeError, RegistryError, ResolutionError};
pub use executor::{ChainExecutor, ChainRun, RunOptions, run_response};
pub use graph::{ChainGraph, ExecutionPlan};
pub use resolve::{ChainInputs, NodeOutputs, ResolvedInputs};
pub use trace::{ExecutionTrace, TraceRecorder};

/// Loads a chain definition from a JSON or YAML file.
///
/// Files ending in `.json` are parsed as JSON; anything else as YAML. When the document has
/// no `id`, the file stem is used.
pub fn parse_chain_file(file_path: impl AsRef<Path>) -> Result<ChainDefinition> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read chain file: {}", file_path.display()))?;

    let is_json = file_path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    let mut chain: ChainDefinition = if is_json {
        serde_json::from_str(&content).with_context(|| format!("Invalid chain JSON in {}", file_path.display()))?
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Invalid chain YAML in {}", file_path.display()))?
    };

    if chain.id.trim().is_empty()
        && let Some(stem) = file_path.file_stem().and_then(|stem| stem.to_str())
    {
        chain.id = stem.to_string();
    }
    Ok(chain)
}

/// Parses a chain definition from YAML or JSON text.
pub fn parse_chain_str(content: &str) -> Result<ChainDefinition> {
    serde_yaml::from_str(content).context("Invalid chain document")
}
