//! Runtime seam types: what the launcher hands to a backend and what it
//! gets back.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::RuntimeResult;
use crate::manifest::PortMapping;

/// A host path bound into the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl MountSpec {
    /// `host:container[:ro]` as the docker CLI expects it.
    pub fn to_volume_arg(&self) -> String {
        if self.read_only {
            format!(
                "{}:{}:ro",
                self.host_path.display(),
                self.container_path
            )
        } else {
            format!("{}:{}", self.host_path.display(), self.container_path)
        }
    }
}

/// Everything a backend needs to start one service. Templates are already
/// resolved and mounts already checked.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub service: String,
    /// Unique name for the running unit (container name, log file stem)
    pub instance_name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<MountSpec>,
    pub ports: Vec<PortMapping>,
    pub network: String,
    /// DNS names the service answers to on the network
    pub aliases: Vec<String>,
    pub labels: Vec<(String, String)>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    pub fn new(service: &str, instance_name: &str, image: &str) -> Self {
        Self {
            service: service.to_string(),
            instance_name: instance_name.to_string(),
            image: image.to_string(),
            command: None,
            env: Vec::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            network: String::new(),
            aliases: Vec::new(),
            labels: Vec::new(),
            working_dir: PathBuf::from("."),
        }
    }
}

/// Opaque reference to a started service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeHandle {
    pub service: String,
    /// Container id for docker, pid for native
    pub id: String,
}

impl RuntimeHandle {
    pub fn new(service: &str, id: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            id: id.into(),
        }
    }
}

/// Output from a command run through [`ServiceRuntime::exec`].
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn new(stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout and stderr joined, stderr last.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Backend that actually runs services.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    /// Create the isolated network segment. Idempotent.
    async fn create_network(&self, name: &str, labels: &HashMap<String, String>)
        -> RuntimeResult<()>;

    async fn remove_network(&self, name: &str) -> RuntimeResult<()>;

    /// Start a service and return once the backend reports it running.
    async fn start(&self, spec: &LaunchSpec) -> RuntimeResult<RuntimeHandle>;

    async fn is_running(&self, handle: &RuntimeHandle) -> RuntimeResult<bool>;

    /// Run `argv` inside the service's environment.
    async fn exec(
        &self,
        handle: &RuntimeHandle,
        argv: &[String],
        timeout: Duration,
    ) -> RuntimeResult<CommandOutput>;

    /// Stop and remove the service, waiting up to `grace` before killing it.
    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> RuntimeResult<()>;
}
