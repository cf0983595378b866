//! Native runtime implementation
//!
//! Runs each service's `command` as a host child process. There is no
//! isolation: networking is loopback and mounts are passed to the process as
//! `STACKGATE_MOUNT_<N>` hints, since host processes see host paths directly.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};

use super::types::{CommandOutput, LaunchSpec, RuntimeHandle, ServiceRuntime};

/// Native runtime that runs services as child processes of the coordinator
#[derive(Debug)]
pub struct NativeRuntime {
    log_dir: PathBuf,
    children: Mutex<HashMap<String, Child>>,
}

impl NativeRuntime {
    /// Service output goes to `<log_dir>/<instance>.log`.
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, instance_name: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", instance_name))
    }

    /// Environment the child sees: resolved service env plus mount hints.
    fn child_env(spec: &LaunchSpec) -> Vec<(String, String)> {
        let mut env = spec.env.clone();
        for (i, mount) in spec.mounts.iter().enumerate() {
            env.push((format!("STACKGATE_MOUNT_{}", i), mount.to_volume_arg()));
        }
        env
    }
}

#[async_trait]
impl ServiceRuntime for NativeRuntime {
    fn name(&self) -> &str {
        "native"
    }

    async fn is_available(&self) -> bool {
        // Native runtime is always available
        true
    }

    async fn create_network(
        &self,
        _name: &str,
        _labels: &HashMap<String, String>,
    ) -> RuntimeResult<()> {
        Ok(())
    }

    async fn remove_network(&self, _name: &str) -> RuntimeResult<()> {
        Ok(())
    }

    async fn start(&self, spec: &LaunchSpec) -> RuntimeResult<RuntimeHandle> {
        let argv = spec
            .command
            .as_ref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                RuntimeError::ExecutionFailed(format!(
                    "service '{}' has no command; the native runtime cannot run images",
                    spec.service
                ))
            })?;

        std::fs::create_dir_all(&self.log_dir)
            .map_err(|e| RuntimeError::ExecutionFailed(format!("log dir: {}", e)))?;
        let log_path = self.log_path(&spec.instance_name);
        let log = std::fs::File::create(&log_path)
            .map_err(|e| RuntimeError::ExecutionFailed(format!("log file: {}", e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| RuntimeError::ExecutionFailed(format!("log file: {}", e)))?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        for (key, value) in Self::child_env(spec) {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|e| {
            RuntimeError::ExecutionFailed(format!("failed to spawn '{}': {}", argv[0], e))
        })?;
        let pid = child
            .id()
            .map(|p| p.to_string())
            .unwrap_or_else(|| spec.instance_name.clone());
        debug!(service = %spec.service, pid = %pid, log = %log_path.display(), "Spawned process");

        self.children.lock().await.insert(pid.clone(), child);
        Ok(RuntimeHandle::new(&spec.service, pid))
    }

    async fn is_running(&self, handle: &RuntimeHandle) -> RuntimeResult<bool> {
        let mut children = self.children.lock().await;
        match children.get_mut(&handle.id) {
            Some(child) => match child.try_wait() {
                Ok(None) => Ok(true),
                Ok(Some(_)) => Ok(false),
                Err(e) => Err(RuntimeError::ExecutionFailed(e.to_string())),
            },
            None => Ok(false),
        }
    }

    async fn exec(
        &self,
        _handle: &RuntimeHandle,
        argv: &[String],
        timeout: Duration,
    ) -> RuntimeResult<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RuntimeError::ExecutionFailed("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Execute with timeout
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))?
            .map_err(|e| RuntimeError::ExecutionFailed(e.to_string()))?;

        Ok(CommandOutput::new(
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code(),
        ))
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> RuntimeResult<()> {
        let Some(mut child) = self.children.lock().await.remove(&handle.id) else {
            return Err(RuntimeError::NotRunning(handle.service.clone()));
        };

        #[cfg(unix)]
        {
            let _ = Command::new("kill")
                .args(["-TERM", &handle.id])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(RuntimeError::ExecutionFailed(e.to_string())),
            Err(_) => {
                warn!(service = %handle.service, "Grace period elapsed, killing process");
                child
                    .kill()
                    .await
                    .map_err(|e| RuntimeError::ExecutionFailed(e.to_string()))
            }
        }
    }
}
