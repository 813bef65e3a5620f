//! Persistence for completed chain runs.
//!
//! Runs are stored newest first in a single JSON file, bounded by a retention limit. Every
//! response is redacted before it is written: trace inputs and outputs, node outputs, and
//! final outputs pass through [`redact_json_map`], so credentials never reach disk.

use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chainfury_types::{RunResponse, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    path_processing::{chainfury_config_dir, path_from_env},
    text_processing::redact_json_map,
};

/// Environment variable controlling the run store location.
pub const RUN_STORE_PATH_ENV: &str = "CHAINFURY_RUN_STORE_PATH";

/// Default filename for the persisted run store.
pub const RUN_STORE_FILE_NAME: &str = "runs.json";

/// Number of runs retained when no limit is configured.
pub const DEFAULT_RUN_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("run store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("run store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A persisted run with the metadata used for listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRun {
    pub run_id: String,
    pub chain_id: String,
    pub status: RunStatus,
    pub stored_at: DateTime<Utc>,
    pub response: RunResponse,
}

impl StoredRun {
    fn from_response(response: &RunResponse) -> Self {
        Self {
            run_id: response.run_id.clone(),
            chain_id: response.chain_id.clone(),
            status: response.status,
            stored_at: Utc::now(),
            response: redact_response(response),
        }
    }
}

/// Storage backend for run responses.
pub trait RunStore: Send + Sync {
    /// Store a run, replacing any earlier run with the same id.
    fn save(&self, response: &RunResponse) -> Result<(), RunStoreError>;

    fn get(&self, run_id: &str) -> Result<Option<StoredRun>, RunStoreError>;

    /// Stored runs, newest first, optionally filtered by chain.
    fn list(&self, chain_id: Option<&str>) -> Result<Vec<StoredRun>, RunStoreError>;

    /// Keep at most `max_runs` of the newest runs.
    fn truncate(&self, max_runs: usize) -> Result<(), RunStoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunFile {
    #[serde(default)]
    runs: VecDeque<StoredRun>,
}

impl RunFile {
    fn upsert(&mut self, run: StoredRun, limit: usize) {
        self.runs.retain(|existing| existing.run_id != run.run_id);
        self.runs.push_front(run);
        self.runs.truncate(limit);
    }

    fn get(&self, run_id: &str) -> Option<StoredRun> {
        self.runs.iter().find(|run| run.run_id == run_id).cloned()
    }

    fn list(&self, chain_id: Option<&str>) -> Vec<StoredRun> {
        self.runs
            .iter()
            .filter(|run| chain_id.is_none_or(|chain_id| run.chain_id == chain_id))
            .cloned()
            .collect()
    }
}

/// JSON file backed run store.
#[derive(Debug)]
pub struct JsonRunStore {
    path: PathBuf,
    file: Mutex<RunFile>,
    max_runs: usize,
}

impl JsonRunStore {
    /// Open the store at `path`, or at the default location when `None`.
    pub fn new<P: Into<Option<PathBuf>>>(path: P, max_runs: usize) -> Result<Self, RunStoreError> {
        let path = path.into().unwrap_or_else(default_run_store_path);
        let mut file = load_run_file(&path)?;
        file.runs.truncate(max_runs);
        Ok(Self {
            path,
            file: Mutex::new(file),
            max_runs,
        })
    }

    pub fn with_defaults() -> Result<Self, RunStoreError> {
        Self::new(None, DEFAULT_RUN_HISTORY_LIMIT)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, RunFile> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save_locked(&self, file: &RunFile) -> Result<(), RunStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(file)?;
        fs::write(&self.path, content)?;
        debug!(path = %self.path.display(), runs = file.runs.len(), "run store saved");
        Ok(())
    }
}

impl RunStore for JsonRunStore {
    fn save(&self, response: &RunResponse) -> Result<(), RunStoreError> {
        let mut file = self.lock();
        file.upsert(StoredRun::from_response(response), self.max_runs);
        self.save_locked(&file)
    }

    fn get(&self, run_id: &str) -> Result<Option<StoredRun>, RunStoreError> {
        Ok(self.lock().get(run_id))
    }

    fn list(&self, chain_id: Option<&str>) -> Result<Vec<StoredRun>, RunStoreError> {
        Ok(self.lock().list(chain_id))
    }

    fn truncate(&self, max_runs: usize) -> Result<(), RunStoreError> {
        let mut file = self.lock();
        file.runs.truncate(max_runs);
        self.save_locked(&file)
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug)]
pub struct InMemoryRunStore {
    file: Mutex<RunFile>,
    max_runs: usize,
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new(DEFAULT_RUN_HISTORY_LIMIT)
    }
}

impl InMemoryRunStore {
    pub fn new(max_runs: usize) -> Self {
        Self {
            file: Mutex::new(RunFile::default()),
            max_runs,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunFile> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunStore for InMemoryRunStore {
    fn save(&self, response: &RunResponse) -> Result<(), RunStoreError> {
        self.lock().upsert(StoredRun::from_response(response), self.max_runs);
        Ok(())
    }

    fn get(&self, run_id: &str) -> Result<Option<StoredRun>, RunStoreError> {
        Ok(self.lock().get(run_id))
    }

    fn list(&self, chain_id: Option<&str>) -> Result<Vec<StoredRun>, RunStoreError> {
        Ok(self.lock().list(chain_id))
    }

    fn truncate(&self, max_runs: usize) -> Result<(), RunStoreError> {
        self.lock().runs.truncate(max_runs);
        Ok(())
    }
}

/// `CHAINFURY_RUN_STORE_PATH` when set, otherwise `<config_dir>/chainfury/runs.json`.
pub fn default_run_store_path() -> PathBuf {
    path_from_env(RUN_STORE_PATH_ENV).unwrap_or_else(|| chainfury_config_dir().join(RUN_STORE_FILE_NAME))
}

/// Copy of a response with every recorded value redacted.
pub fn redact_response(response: &RunResponse) -> RunResponse {
    let mut redacted = response.clone();
    redacted.final_outputs = redact_json_map(&response.final_outputs);
    for outputs in redacted.node_outputs.values_mut() {
        *outputs = redact_json_map(outputs);
    }
    for entry in &mut redacted.trace {
        entry.inputs = entry.inputs.as_ref().map(redact_json_map);
        entry.outputs = entry.outputs.as_ref().map(redact_json_map);
    }
    redacted
}

fn load_run_file(path: &Path) -> Result<RunFile, RunStoreError> {
    if !path.exists() {
        return Ok(RunFile::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(RunFile::default());
    }
    match serde_json::from_str(&content) {
        Ok(file) => Ok(file),
        Err(error) => {
            warn!(path = %path.display(), %error, "run store is unreadable; starting empty");
            Ok(RunFile::default())
        }
    }
}
