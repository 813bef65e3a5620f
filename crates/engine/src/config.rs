//! Engine configuration loaded from a JSON file.
//!
//! The file lives at `CHAINFURY_CONFIG_PATH` when set, otherwise at
//! `<config_dir>/chainfury/engine.json`. A missing file yields the defaults.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chainfury_types::FailurePolicy;
use chainfury_util::{
    expand_tilde,
    path_processing::{chainfury_config_dir, path_from_env},
    run_store::{DEFAULT_RUN_HISTORY_LIMIT, default_run_store_path},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides the configuration file location.
pub const CONFIG_PATH_ENV: &str = "CHAINFURY_CONFIG_PATH";

const DEFAULT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_MAX_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read engine config {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("failed to parse engine config {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },

    #[error("invalid engine config: {0}")]
    Invalid(String),
}

/// Tunables shared by every run an executor performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Policy used when neither the chain nor the run options choose one.
    pub default_failure_policy: FailurePolicy,
    /// Fallback invocation timeout. `null` disables the engine-wide limit.
    pub default_timeout_ms: Option<u64>,
    /// Upper bound on concurrently running nodes within a layer.
    pub max_concurrency: usize,
    /// Whether the CLI stores run responses.
    pub persist_runs: bool,
    /// Location of the run store; defaults next to the config file.
    pub run_store_path: Option<PathBuf>,
    /// Number of runs kept in the store.
    pub run_history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_failure_policy: FailurePolicy::Abort,
            default_timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            persist_runs: false,
            run_store_path: None,
            run_history_limit: DEFAULT_RUN_HISTORY_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(&default_config_path())
    }

    /// Load from a specific file. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: EngineConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(run_store_path) = &config.run_store_path {
            config.run_store_path = Some(expand_tilde(&run_store_path.to_string_lossy()));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".to_string()));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("default_timeout_ms must be positive; use null to disable it".to_string()));
        }
        if self.run_history_limit == 0 {
            return Err(ConfigError::Invalid("run_history_limit must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Run store location. Without an explicit path, `CHAINFURY_RUN_STORE_PATH` and then
    /// `<config_dir>/chainfury/runs.json`.
    pub fn run_store_path(&self) -> PathBuf {
        self.run_store_path.clone().unwrap_or_else(default_run_store_path)
    }
}

/// Returns the configuration file path, honouring `CHAINFURY_CONFIG_PATH`.
pub fn default_config_path() -> PathBuf {
    path_from_env(CONFIG_PATH_ENV).unwrap_or_else(|| chainfury_config_dir().join("engine.json"))
}
