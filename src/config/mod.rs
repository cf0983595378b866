//! Configuration management for stackgate
//!
//! This module provides configuration loading and environment overrides.
//! Configuration is loaded from `~/.stackgate/config.json` with environment
//! variable overrides.

mod types;
pub mod validate;

pub use types::*;

use crate::error::{Result, StackError};
use std::path::{Path, PathBuf};

impl Config {
    /// Returns the stackgate configuration directory path (~/.stackgate)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stackgate")
    }

    /// Returns the path to the config file (~/.stackgate/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    /// Environment variables can override config values using the pattern:
    /// `STACKGATE_SECTION_KEY`
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                StackError::Config(format!("invalid config '{}': {}", path.display(), e))
            })?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: STACKGATE_SECTION_KEY.
    /// Values that fail to parse are ignored.
    fn apply_env_overrides(&mut self) {
        // Logging
        if let Ok(val) = std::env::var("STACKGATE_LOGGING_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("STACKGATE_LOGGING_FORMAT") {
            if let Ok(v) = serde_json::from_value(serde_json::Value::String(val)) {
                self.logging.format = v;
            }
        }

        // Runtime
        if let Ok(val) = std::env::var("STACKGATE_RUNTIME_TYPE") {
            if let Ok(v) = val.parse() {
                self.runtime.runtime_type = v;
            }
        }
        if let Ok(val) = std::env::var("STACKGATE_DOCKER_BINARY") {
            self.runtime.docker.binary = val;
        }

        // Health defaults
        if let Ok(val) = std::env::var("STACKGATE_HEALTH_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.health.interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("STACKGATE_HEALTH_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.health.timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("STACKGATE_HEALTH_RETRIES") {
            if let Ok(v) = val.parse() {
                self.health.retries = v;
            }
        }

        // Launcher
        if let Ok(val) = std::env::var("STACKGATE_LAUNCHER_CHECK_PORTS") {
            if let Ok(v) = val.parse() {
                self.launcher.check_ports = v;
            }
        }
    }
}

impl RuntimeConfig {
    /// Directory used by the native runtime for per-service logs.
    pub fn native_log_dir(&self) -> PathBuf {
        self.native
            .log_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| Config::dir().join("logs"))
    }
}

/// Expand ~ to home directory in a path string
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix);
        }
    }
    PathBuf::from(path)
}
