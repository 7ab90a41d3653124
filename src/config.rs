//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_idle_timeout_seconds() -> u64 {
    30
}

/// Global configuration parsed from `config.toml`.
///
/// Every field has a default, so an empty file (or no file at all) yields a
/// working configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct GlobalConfig {
    /// Seconds of inactivity before the idle worker is stopped automatically.
    pub idle_timeout_seconds: u64,
    /// Debug mode: mirror all worker output to the diagnostics log, echo
    /// each task before execution, and disable the idle auto-stop.
    pub debug: bool,
    /// Override for the worker executable.
    ///
    /// Defaults to the running process's own binary
    /// (`std::env::current_exe()`); tests point this at the built binary.
    pub worker_program: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout_seconds(),
            debug: false,
            worker_program: None,
        }
    }
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

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Idle-shutdown timeout as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.idle_timeout_seconds == 0 {
            return Err(AppError::Config(
                "idle_timeout_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
