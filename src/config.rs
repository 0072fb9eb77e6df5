//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Execution behaviour recognised at the runtime boundary.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Wall-clock cap for a single execution; 0 means unbounded.
    #[serde(default)]
    pub run_timeout_seconds: u64,
    /// Per-observer backlog bound before an `Overflow` notice is delivered.
    #[serde(default = "default_observer_buffer_size")]
    pub observer_buffer_size: usize,
    /// Skip approval suspension and record an approve decision immediately.
    #[serde(default)]
    pub auto_approve: bool,
    /// Start an execution as soon as a decision is recorded for a session
    /// with no live execution, instead of waiting for an explicit `start`.
    #[serde(default)]
    pub resume_on_decision: bool,
    /// Restart resumable sessions found during startup recovery.
    #[serde(default)]
    pub resume_interrupted_on_startup: bool,
    /// Number of events fetched per page during replay.
    #[serde(default = "default_replay_page_size")]
    pub replay_page_size: u32,
}

fn default_observer_buffer_size() -> usize {
    256
}

fn default_replay_page_size() -> u32 {
    256
}

fn default_retention_days() -> u32 {
    30
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_timeout_seconds: 0,
            observer_buffer_size: default_observer_buffer_size(),
            auto_approve: false,
            resume_on_decision: false,
            resume_interrupted_on_startup: false,
            replay_page_size: default_replay_page_size(),
        }
    }
}

impl RuntimeConfig {
    /// Execution wall-clock cap, if one is configured.
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_seconds > 0).then(|| Duration::from_secs(self.run_timeout_seconds))
    }

    fn validate(&self) -> Result<()> {
        if self.observer_buffer_size == 0 {
            return Err(AppError::Config(
                "observer_buffer_size must be greater than zero".into(),
            ));
        }
        if self.replay_page_size == 0 {
            return Err(AppError::Config(
                "replay_page_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Path to the `SQLite` database file.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Use an in-memory database (tests and dry runs).
    #[serde(default)]
    pub in_memory: bool,
    /// Execution behaviour.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Days after a session reaches a terminal status before its data is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration backed by an in-memory database with default runtime settings.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            db_path: None,
            in_memory: true,
            runtime: RuntimeConfig::default(),
            retention_days: default_retention_days(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.in_memory && self.db_path.is_none() {
            return Err(AppError::Config(
                "db_path is required unless in_memory = true".into(),
            ));
        }
        if self.retention_days == 0 {
            return Err(AppError::Config(
                "retention_days must be greater than zero".into(),
            ));
        }
        self.runtime.validate()
    }
}
