//! Scripted runtime for tests. Records every call and fails on demand.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{RuntimeError, RuntimeResult};

use super::types::{CommandOutput, LaunchSpec, RuntimeHandle, ServiceRuntime};

/// In-memory [`ServiceRuntime`]. Services start after `start_delay` unless
/// listed in `fail_start`; those in `exit_on_start` launch but are never
/// running. Exec answers come from `exec_results` (default: success).
#[derive(Default)]
pub struct MockRuntime {
    pub fail_start: Mutex<HashSet<String>>,
    pub exit_on_start: Mutex<HashSet<String>>,
    pub start_delay: Duration,
    pub exec_results: Mutex<HashMap<String, CommandOutput>>,
    pub started: Mutex<Vec<LaunchSpec>>,
    pub stopped: Mutex<Vec<String>>,
    pub networks: Mutex<Vec<String>>,
    running: Mutex<HashSet<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(services: &[&str]) -> Self {
        let rt = Self::default();
        rt.fail_start
            .lock()
            .unwrap()
            .extend(services.iter().map(|s| s.to_string()));
        rt
    }

    pub fn exiting(services: &[&str]) -> Self {
        let rt = Self::default();
        rt.exit_on_start
            .lock()
            .unwrap()
            .extend(services.iter().map(|s| s.to_string()));
        rt
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn started_names(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.service.clone())
            .collect()
    }

    pub fn stopped_names(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: &HashMap<String, String>,
    ) -> RuntimeResult<()> {
        self.networks.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        self.networks.lock().unwrap().retain(|n| n != name);
        Ok(())
    }

    async fn start(&self, spec: &LaunchSpec) -> RuntimeResult<RuntimeHandle> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start.lock().unwrap().contains(&spec.service) {
            return Err(RuntimeError::ExecutionFailed(format!(
                "mock refused to start '{}'",
                spec.service
            )));
        }
        self.started.lock().unwrap().push(spec.clone());
        if !self.exit_on_start.lock().unwrap().contains(&spec.service) {
            self.running.lock().unwrap().insert(spec.service.clone());
        }
        Ok(RuntimeHandle::new(&spec.service, format!("mock-{}", spec.service)))
    }

    async fn is_running(&self, handle: &RuntimeHandle) -> RuntimeResult<bool> {
        Ok(self.running.lock().unwrap().contains(&handle.service))
    }

    async fn exec(
        &self,
        handle: &RuntimeHandle,
        _argv: &[String],
        _timeout: Duration,
    ) -> RuntimeResult<CommandOutput> {
        Ok(self
            .exec_results
            .lock()
            .unwrap()
            .get(&handle.service)
            .cloned()
            .unwrap_or_else(|| CommandOutput::new(String::new(), String::new(), Some(0))))
    }

    async fn stop(&self, handle: &RuntimeHandle, _grace: Duration) -> RuntimeResult<()> {
        if !self.running.lock().unwrap().remove(&handle.service) {
            return Err(RuntimeError::NotRunning(handle.service.clone()));
        }
        self.stopped.lock().unwrap().push(handle.service.clone());
        Ok(())
    }
}
