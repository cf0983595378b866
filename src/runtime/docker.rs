//! Docker runtime implementation
//!
//! Drives the `docker` CLI: one detached container per service on a shared
//! user-defined network, with the service name as its network alias.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};
use crate::utils::string::output_summary;

use super::types::{CommandOutput, LaunchSpec, RuntimeHandle, ServiceRuntime};

/// Upper bound for short bookkeeping calls (`inspect`, `network create`).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
/// Image pulls can be slow; `run -d` gets longer.
const RUN_TIMEOUT: Duration = Duration::from_secs(600);

/// Docker runtime that runs each service as a detached container
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    /// Docker CLI binary (e.g. "docker", "podman")
    binary: String,
}

impl DockerRuntime {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    /// Arguments for `docker run` that start `spec` detached.
    pub fn run_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.instance_name.clone(),
        ];

        if !spec.network.is_empty() {
            args.push("--network".to_string());
            args.push(spec.network.clone());
            for alias in &spec.aliases {
                args.push("--network-alias".to_string());
                args.push(alias.clone());
            }
        }

        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(port.to_publish_arg());
        }

        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.to_volume_arg());
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        if let Some(ref command) = spec.command {
            args.extend(command.iter().cloned());
        }
        args
    }

    async fn run(&self, args: &[String], timeout: Duration) -> RuntimeResult<CommandOutput> {
        debug!(binary = %self.binary, args = ?args, "docker call");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::NotAvailable(format!("'{}' not found in PATH", self.binary))
                } else {
                    RuntimeError::ExecutionFailed(e.to_string())
                }
            })?;

        Ok(CommandOutput::new(
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code(),
        ))
    }

    /// Like [`run`](Self::run) but a non-zero exit is an error.
    async fn run_checked(&self, args: &[String], timeout: Duration) -> RuntimeResult<String> {
        let output = self.run(args, timeout).await?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(RuntimeError::ExecutionFailed(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or(""),
                output_summary(&output.stderr, 200)
            )))
        }
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ServiceRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        // Check if docker is installed and the daemon answers
        Command::new(&self.binary)
            .args(["info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> RuntimeResult<()> {
        let inspect = vec!["network".to_string(), "inspect".to_string(), name.to_string()];
        if self.run(&inspect, CONTROL_TIMEOUT).await?.success() {
            debug!(network = name, "Network already exists");
            return Ok(());
        }

        let mut args = vec!["network".to_string(), "create".to_string()];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        self.run_checked(&args, CONTROL_TIMEOUT).await.map(|_| ())
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        let args = vec!["network".to_string(), "rm".to_string(), name.to_string()];
        self.run_checked(&args, CONTROL_TIMEOUT).await.map(|_| ())
    }

    async fn start(&self, spec: &LaunchSpec) -> RuntimeResult<RuntimeHandle> {
        // A leftover container with the same name would make `run` fail.
        let rm = vec!["rm".to_string(), "-f".to_string(), spec.instance_name.clone()];
        let _ = self.run(&rm, CONTROL_TIMEOUT).await;

        let id = self.run_checked(&Self::run_args(spec), RUN_TIMEOUT).await?;
        let id = id.lines().last().unwrap_or_default().to_string();
        if id.is_empty() {
            return Err(RuntimeError::ExecutionFailed(format!(
                "{} run returned no container id for '{}'",
                self.binary, spec.service
            )));
        }
        Ok(RuntimeHandle::new(&spec.service, id))
    }

    async fn is_running(&self, handle: &RuntimeHandle) -> RuntimeResult<bool> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            handle.id.clone(),
        ];
        let output = self.run(&args, CONTROL_TIMEOUT).await?;
        Ok(output.success() && output.stdout.trim() == "true")
    }

    async fn exec(
        &self,
        handle: &RuntimeHandle,
        argv: &[String],
        timeout: Duration,
    ) -> RuntimeResult<CommandOutput> {
        let mut args = vec!["exec".to_string(), handle.id.clone()];
        args.extend(argv.iter().cloned());
        self.run(&args, timeout).await
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> RuntimeResult<()> {
        let stop = vec![
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            handle.id.clone(),
        ];
        let _ = self.run(&stop, grace + CONTROL_TIMEOUT).await?;
        let rm = vec!["rm".to_string(), "-f".to_string(), handle.id.clone()];
        self.run_checked(&rm, CONTROL_TIMEOUT).await.map(|_| ())
    }
}
