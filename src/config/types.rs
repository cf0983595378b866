//! Configuration types for stackgate
//!
//! The coordinator config is distinct from the stack manifest: it controls how
//! stackgate itself behaves (logging, runtime backend, probe defaults), not
//! what the stack contains.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Root Configuration
// ============================================================================

/// Main configuration struct for stackgate
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging output format and level
    pub logging: LoggingConfig,
    /// Runtime backend selection
    pub runtime: RuntimeConfig,
    /// Defaults for health checks that omit interval/timeout/retries
    pub health: HealthDefaults,
    /// Launcher pre-flight checks
    pub launcher: LauncherConfig,
}

// ============================================================================
// Logging
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line human readable output
    Pretty,
    /// Compact single-line output with a `component` field
    #[default]
    Component,
    /// JSON lines
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Optional file to append logs to instead of stderr
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            level: "info".to_string(),
            file: None,
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Container runtime type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    /// Docker containers on a dedicated bridge network
    #[default]
    Docker,
    /// Host child processes (no isolation, loopback networking)
    Native,
}

impl std::str::FromStr for RuntimeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(RuntimeType::Docker),
            "native" => Ok(RuntimeType::Native),
            other => Err(format!(
                "unknown runtime '{}'; expected 'docker' or 'native'",
                other
            )),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Type of runtime to use
    pub runtime_type: RuntimeType,
    /// Whether to fall back to the native runtime if docker is unavailable
    pub allow_fallback_to_native: bool,
    /// Docker-specific configuration
    pub docker: DockerConfig,
    /// Native-specific configuration
    pub native: NativeConfig,
}

/// Docker runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker CLI binary (e.g. "docker" or "podman")
    pub binary: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

/// Native runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NativeConfig {
    /// Directory for per-service stdout/stderr logs (default `~/.stackgate/logs`)
    pub log_dir: Option<String>,
}

// ============================================================================
// Health defaults
// ============================================================================

/// Health check defaults, mirroring compose's defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthDefaults {
    /// Delay between probe attempts
    pub interval_ms: u64,
    /// Hard limit for a single attempt
    pub timeout_ms: u64,
    /// Consecutive failures before the service is marked Failed
    pub retries: u32,
    /// Grace period during which failures are not counted
    pub start_period_ms: u64,
}

impl Default for HealthDefaults {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 30_000,
            retries: 3,
            start_period_ms: 0,
        }
    }
}

impl HealthDefaults {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn start_period(&self) -> Duration {
        Duration::from_millis(self.start_period_ms)
    }
}

// ============================================================================
// Launcher
// ============================================================================

/// Launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Bind-test published host ports before launch
    pub check_ports: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self { check_ports: true }
    }
}
