//! stackgate - health-gated startup coordinator for single-host service stacks
//!
//! A manifest declares services, their dependencies and health checks.
//! The [`Coordinator`] launches every service as soon as all of its
//! dependencies are Healthy, probes it until it is Healthy itself, and fails
//! everything downstream the moment something cannot get there.

pub mod config;
pub mod error;
pub mod gate;
pub mod health;
pub mod instance;
pub mod launcher;
pub mod manifest;
pub mod network;
pub mod orchestrator;
pub mod runtime;
pub mod utils;

pub use config::Config;
pub use error::{Result, RuntimeError, StackError};
pub use health::{CommandProber, HealthVerdict, ProbeOutcome, Prober};
pub use instance::{InstanceTable, LifecycleEvent, ServiceState, Transition};
pub use manifest::{LoadOptions, Manifest, ServiceDescriptor};
pub use orchestrator::{Coordinator, CoordinatorOptions, StatusReport};
pub use runtime::{create_runtime, ServiceRuntime};
