//! Service runtimes
//!
//! The coordinator never talks to a container engine directly; it goes
//! through [`ServiceRuntime`]. Two backends exist:
//! - Docker: one container per service on a user-defined network
//! - Native: host child processes on loopback, for hosts without Docker

pub mod docker;
pub mod factory;
#[cfg(test)]
pub mod mock;
pub mod native;
pub mod types;

pub use docker::DockerRuntime;
pub use factory::{available_runtimes, create_runtime};
pub use native::NativeRuntime;
pub use types::{CommandOutput, LaunchSpec, MountSpec, RuntimeHandle, ServiceRuntime};
