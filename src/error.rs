//! Error types for stackgate
//!
//! This module defines all error types used throughout the coordinator.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use std::time::Duration;
use thiserror::Error;

use crate::instance::ServiceState;

// ============================================================================
// Runtime Error Classification
// ============================================================================

/// Errors reported by a [`ServiceRuntime`](crate::runtime::ServiceRuntime) backend.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The backend binary is missing or its daemon is not running
    #[error("Runtime not available: {0}")]
    NotAvailable(String),

    /// The backend was reachable but the operation failed
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The operation did not complete within its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The handle does not refer to a running service
    #[error("Service is not running: {0}")]
    NotRunning(String),
}

/// Result type for runtime backends.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for stackgate operations.
#[derive(Error, Debug)]
pub enum StackError {
    /// Malformed or structurally invalid manifest or coordinator config
    #[error("Configuration error: {0}")]
    Config(String),

    /// The dependency graph contains a cycle; `cycle` is a closed path
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A service could not be launched (port conflict, missing secret,
    /// unresolved environment reference, runtime failure)
    #[error("Launch error for '{service}': {reason}")]
    Launch { service: String, reason: String },

    /// A single health probe attempt could not be executed
    #[error("Probe error for '{service}': {reason}")]
    Probe { service: String, reason: String },

    /// A dependency reached a terminal non-healthy state
    #[error("Dependency '{dependency}' of '{service}' is {state}")]
    DependencyFailed {
        service: String,
        dependency: String,
        state: ServiceState,
    },

    /// A service address was requested before the service reached Starting
    #[error("Unresolved address: {0}")]
    UnresolvedAddress(String),

    /// A state change outside the lifecycle state machine was attempted
    #[error("Invalid transition for '{service}': {from} -> {to}")]
    InvalidTransition {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },

    /// The named service is not part of the manifest
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// A wait was abandoned because the instance was stopped or failed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Runtime backend errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML manifest parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StackError {
    /// Returns `true` for structural errors that must abort the whole startup
    /// before any service is touched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StackError::Config(_) | StackError::CyclicDependency { .. } | StackError::Yaml(_)
        )
    }

    /// Shorthand for a launch error.
    pub fn launch(service: &str, reason: impl Into<String>) -> Self {
        StackError::Launch {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a probe error.
    pub fn probe(service: &str, reason: impl Into<String>) -> Self {
        StackError::Probe {
            service: service.to_string(),
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for stackgate operations.
pub type Result<T> = std::result::Result<T, StackError>;
