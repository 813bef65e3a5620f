//! Helpers shared by the ChainFury engine and CLI: path handling, secret redaction,
//! and the run store.

pub mod path_processing;
pub mod run_store;
pub mod text_processing;

pub use path_processing::expand_tilde;
pub use run_store::{InMemoryRunStore, JsonRunStore, RunStore, RunStoreError, StoredRun};
pub use text_processing::{REDACTED, is_secret, is_sensitive_key, redact_json, redact_sensitive};
