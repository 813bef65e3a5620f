//! Shared type definitions for ChainFury.
//!
//! The engine, the persistence helpers, and the CLI all speak in terms of the
//! documents defined here:
//!
//! - [`chain`]: chain definitions as authored (nodes, bindings, output mapping)
//! - [`schema`]: typed field descriptors used by actions and chain inputs
//! - [`run`]: run responses and execution trace entries returned to callers

pub mod chain;
pub mod run;
pub mod schema;

pub use chain::{ChainDefinition, FailurePolicy, InputBinding, NodeDefinition, OutputTarget};
pub use run::{NodeStatus, RunResponse, RunStatus, RunWarning, TraceEntry, TraceError};
pub use schema::{ActionSchema, FieldSpec, FieldType, FieldValidation, validate_candidate_value};
