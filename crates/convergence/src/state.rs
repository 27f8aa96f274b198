//! Persisted convergence state
//!
//! The state records how far the pipeline got, so a pass that ends in a
//! reboot resumes at the following step. It is written after every step.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.toml";
const COMPLETED_FILE: &str = "completed.toml";

/// Progress of one run of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceState {
    /// Pipeline (role) the state belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Last step that completed, was skipped, or had its failure ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_step: Option<String>,

    /// A reboot was requested and the next pass is a re-entry
    #[serde(default)]
    pub pending_reboot: bool,

    /// Step that asked for a reboot at the next checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_reboot: Option<String>,

    /// Reboots requested during this run
    #[serde(default)]
    pub reboots: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Attempts spent on each executed step
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,

    /// Ignored failures, by step
    #[serde(default)]
    pub failures: BTreeMap<String, String>,
}

impl ConvergenceState {
    /// Fresh state for a pipeline
    pub fn new(role: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Record that a step is done with
    pub fn mark_completed(&mut self, step: &str) {
        self.last_completed_step = Some(step.to_string());
    }

    /// Accumulate attempts for a step
    pub fn record_attempts(&mut self, step: &str, attempts: u32) {
        *self.attempts.entry(step.to_string()).or_default() += attempts;
    }

    /// Record an ignored failure
    pub fn record_failure(&mut self, step: &str, reason: &str) {
        self.failures.insert(step.to_string(), reason.to_string());
    }

    /// Update the last-modified timestamp
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

/// Storage for [`ConvergenceState`]
pub trait StateStore {
    /// Load the in-progress state, if any
    fn load(&self) -> Result<Option<ConvergenceState>>;

    /// Persist the in-progress state durably
    fn save(&self, state: &ConvergenceState) -> Result<()>;

    /// Move the state aside once the pipeline has completed
    fn archive(&self, state: &ConvergenceState) -> Result<()>;

    /// Most recently archived state
    fn load_completed(&self) -> Result<Option<ConvergenceState>>;

    /// Remove all state
    fn clear(&self) -> Result<()>;
}

/// TOML files in a state directory
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the in-progress state file
    pub fn state_file(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Path of the archived state file
    pub fn completed_file(&self) -> PathBuf {
        self.dir.join(COMPLETED_FILE)
    }

    fn read(path: &Path) -> Result<Option<ConvergenceState>> {
        if !path.exists() {
            log::debug!("State file {} does not exist", path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|e| state_error(path, "read", &e))?;
        let state = toml::from_str(&content).map_err(|e| state_error(path, "parse", &e))?;

        log::debug!("Loaded state from {}", path.display());
        Ok(Some(state))
    }

    fn write(&self, path: &Path, state: &ConvergenceState) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| state_error(&self.dir, "create", &e))?;

        let content = toml::to_string_pretty(state).map_err(|e| state_error(path, "serialize", &e))?;

        // Write-then-rename so a reboot mid-write never leaves a torn file
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, content).map_err(|e| state_error(&tmp, "write", &e))?;
        fs::rename(&tmp, path).map_err(|e| state_error(path, "replace", &e))?;

        log::debug!("Saved state to {}", path.display());
        Ok(())
    }
}

fn state_error(path: &Path, action: &str, err: &dyn std::fmt::Display) -> Error {
    Error::State {
        path: path.to_path_buf(),
        message: format!("failed to {action}: {err}"),
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<ConvergenceState>> {
        Self::read(&self.state_file())
    }

    fn save(&self, state: &ConvergenceState) -> Result<()> {
        self.write(&self.state_file(), state)
    }

    fn archive(&self, state: &ConvergenceState) -> Result<()> {
        self.write(&self.completed_file(), state)?;
        let path = self.state_file();
        if path.exists() {
            fs::remove_file(&path).map_err(|e| state_error(&path, "remove", &e))?;
        }
        Ok(())
    }

    fn load_completed(&self) -> Result<Option<ConvergenceState>> {
        Self::read(&self.completed_file())
    }

    fn clear(&self) -> Result<()> {
        for path in [self.state_file(), self.completed_file()] {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| state_error(&path, "remove", &e))?;
                log::debug!("Removed {}", path.display());
            }
        }
        Ok(())
    }
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    current: RefCell<Option<ConvergenceState>>,
    completed: RefCell<Option<ConvergenceState>>,
    saves: RefCell<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls so far
    pub fn saves(&self) -> usize {
        *self.saves.borrow()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<ConvergenceState>> {
        Ok(self.current.borrow().clone())
    }

    fn save(&self, state: &ConvergenceState) -> Result<()> {
        *self.current.borrow_mut() = Some(state.clone());
        *self.saves.borrow_mut() += 1;
        Ok(())
    }

    fn archive(&self, state: &ConvergenceState) -> Result<()> {
        *self.completed.borrow_mut() = Some(state.clone());
        *self.current.borrow_mut() = None;
        Ok(())
    }

    fn load_completed(&self) -> Result<Option<ConvergenceState>> {
        Ok(self.completed.borrow().clone())
    }

    fn clear(&self) -> Result<()> {
        *self.current.borrow_mut() = None;
        *self.completed.borrow_mut() = None;
        Ok(())
    }
}
