//! Runtime factory for creating service runtimes from configuration

use std::sync::Arc;
use tracing::warn;

use crate::config::{RuntimeConfig, RuntimeType};
use crate::error::{RuntimeError, RuntimeResult};

use super::docker::DockerRuntime;
use super::native::NativeRuntime;
use super::types::ServiceRuntime;

fn native_runtime(config: &RuntimeConfig) -> NativeRuntime {
    NativeRuntime::new(config.native_log_dir())
}

/// Create a service runtime from configuration
pub async fn create_runtime(config: &RuntimeConfig) -> RuntimeResult<Arc<dyn ServiceRuntime>> {
    match config.runtime_type {
        RuntimeType::Native => Ok(Arc::new(native_runtime(config))),
        RuntimeType::Docker => {
            let runtime = DockerRuntime::new(&config.docker.binary);
            if runtime.is_available().await {
                return Ok(Arc::new(runtime));
            }

            if config.allow_fallback_to_native {
                warn!(
                    binary = %config.docker.binary,
                    "Docker is not available, falling back to native runtime"
                );
                return Ok(Arc::new(native_runtime(config)));
            }

            Err(RuntimeError::NotAvailable(format!(
                "'{}' is not installed or the daemon is not running",
                config.docker.binary
            )))
        }
    }
}

/// Check which runtimes are available on this system
pub async fn available_runtimes(config: &RuntimeConfig) -> Vec<&'static str> {
    let mut available = vec!["native"]; // Always available

    if DockerRuntime::new(&config.docker.binary).is_available().await {
        available.push("docker");
    }

    available
}
