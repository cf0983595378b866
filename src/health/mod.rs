//! Health probing
//!
//! [`Prober`] runs a single attempt. [`HealthProbe`] owns the polling loop
//! around it: start period, per-attempt timeout, retry budget and
//! cancellation when the instance leaves Starting.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Result, StackError};
use crate::instance::{InstanceTable, ServiceState, TableState};
use crate::manifest::{ProbeKind, ServiceDescriptor};
use crate::runtime::{RuntimeHandle, ServiceRuntime};
use crate::utils::duration::format_duration;
use crate::utils::string::output_summary;

/// Result of one probe attempt that could be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

/// Final answer of the polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy { attempts: u32 },
    /// `retries` consecutive counted failures
    Exhausted { attempts: u32, last_error: String },
    /// The instance left Starting while we were probing
    Cancelled,
}

/// Runs one health probe attempt.
///
/// An `Err` means the attempt could not be executed at all; the polling
/// loop counts it as a failed attempt like any other.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn check(
        &self,
        descriptor: &ServiceDescriptor,
        handle: &RuntimeHandle,
    ) -> Result<ProbeOutcome>;
}

// ============================================================================
// CommandProber
// ============================================================================

/// Production prober: exec probes through the runtime, HTTP via reqwest,
/// TCP via a plain connect from the host.
pub struct CommandProber {
    runtime: Arc<dyn ServiceRuntime>,
    client: reqwest::Client,
}

impl CommandProber {
    pub fn new(runtime: Arc<dyn ServiceRuntime>) -> Self {
        Self {
            runtime,
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(3))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn check_exec(
        &self,
        descriptor: &ServiceDescriptor,
        handle: &RuntimeHandle,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ProbeOutcome> {
        let output = self
            .runtime
            .exec(handle, argv, timeout)
            .await
            .map_err(|e| StackError::probe(&descriptor.name, e.to_string()))?;
        if output.success() {
            return Ok(ProbeOutcome::Healthy);
        }
        let code = output
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let summary = output_summary(&output.combined(), 200);
        Ok(ProbeOutcome::Unhealthy(if summary.is_empty() {
            format!("probe exited with {}", code)
        } else {
            format!("probe exited with {}: {}", code, summary)
        }))
    }

    async fn check_http(
        &self,
        descriptor: &ServiceDescriptor,
        url: &str,
        timeout: Duration,
    ) -> Result<ProbeOutcome> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| StackError::probe(&descriptor.name, format!("GET {}: {}", url, e)))?;
        let status = response.status();
        if status.is_success() {
            Ok(ProbeOutcome::Healthy)
        } else {
            Ok(ProbeOutcome::Unhealthy(format!("GET {} returned {}", url, status)))
        }
    }

    async fn check_tcp(&self, host: &str, port: u16) -> Result<ProbeOutcome> {
        match TcpStream::connect((host, port)).await {
            Ok(_) => Ok(ProbeOutcome::Healthy),
            Err(e) => Ok(ProbeOutcome::Unhealthy(format!(
                "connect {}:{}: {}",
                host, port, e
            ))),
        }
    }
}

#[async_trait]
impl Prober for CommandProber {
    async fn check(
        &self,
        descriptor: &ServiceDescriptor,
        handle: &RuntimeHandle,
    ) -> Result<ProbeOutcome> {
        let Some(spec) = descriptor.health_check.as_ref() else {
            return Ok(ProbeOutcome::Healthy);
        };
        match &spec.probe {
            ProbeKind::Http { url } => self.check_http(descriptor, url, spec.timeout).await,
            ProbeKind::Tcp { host, port } => self.check_tcp(host, *port).await,
            kind => match kind.exec_argv() {
                Some(argv) => {
                    self.check_exec(descriptor, handle, &argv, spec.timeout)
                        .await
                }
                None => Err(StackError::probe(&descriptor.name, "probe has no command")),
            },
        }
    }
}

// ============================================================================
// Polling loop
// ============================================================================

/// Drives a service from "launched" to a [`HealthVerdict`].
pub struct HealthProbe {
    prober: Arc<dyn Prober>,
    table: Arc<InstanceTable>,
}

impl HealthProbe {
    pub fn new(prober: Arc<dyn Prober>, table: Arc<InstanceTable>) -> Self {
        Self { prober, table }
    }

    /// Poll until the service passes, exhausts its retries or leaves
    /// Starting. Every attempt is recorded on the instance table.
    pub async fn wait_healthy(
        &self,
        descriptor: &ServiceDescriptor,
        handle: &RuntimeHandle,
    ) -> HealthVerdict {
        let Some(spec) = descriptor.health_check.as_ref() else {
            return HealthVerdict::Healthy { attempts: 0 };
        };
        let name = descriptor.name.as_str();
        let mut rx = self.table.watch();
        let started = Instant::now();
        let mut failures = 0u32;

        loop {
            if rx.borrow().state_of(name) != Some(ServiceState::Starting) {
                return HealthVerdict::Cancelled;
            }

            let in_start_period = started.elapsed() < spec.start_period;
            let attempt = tokio::select! {
                r = tokio::time::timeout(spec.timeout, self.prober.check(descriptor, handle)) => r,
                _ = left_starting(&mut rx, name) => return HealthVerdict::Cancelled,
            };

            let detail = match attempt {
                Ok(Ok(ProbeOutcome::Healthy)) => None,
                Ok(Ok(ProbeOutcome::Unhealthy(reason))) => Some(reason),
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!(
                    "probe timed out after {}",
                    format_duration(spec.timeout)
                )),
            };
            let passed = detail.is_none();
            let counted = passed || !in_start_period;
            let attempts = self
                .table
                .record_probe_attempt(name, passed, counted, detail.clone());

            let Some(reason) = detail else {
                debug!(service = name, attempt = attempts, "Health probe passed");
                return HealthVerdict::Healthy { attempts };
            };

            if counted {
                failures += 1;
                warn!(
                    service = name,
                    attempt = attempts,
                    failures,
                    retries = spec.retries,
                    reason = %reason,
                    "Health probe failed"
                );
                if failures >= spec.retries {
                    return HealthVerdict::Exhausted {
                        attempts,
                        last_error: reason,
                    };
                }
            } else {
                warn!(
                    service = name,
                    attempt = attempts,
                    reason = %reason,
                    "Health probe failed during start period"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(spec.interval) => {}
                _ = left_starting(&mut rx, name) => return HealthVerdict::Cancelled,
            }
        }
    }
}

/// Resolve once `name` is no longer Starting.
async fn left_starting(rx: &mut watch::Receiver<TableState>, name: &str) {
    let _ = rx
        .wait_for(|t| t.state_of(name) != Some(ServiceState::Starting))
        .await;
}

// ============================================================================
// Test double
// ============================================================================

/// Prober that replays scripted outcomes per service.
#[cfg(test)]
pub struct ScriptedProber {
    script: std::sync::Mutex<std::collections::HashMap<String, std::collections::VecDeque<Result<ProbeOutcome>>>>,
    fallback: ProbeOutcome,
    delay: Duration,
    pub calls: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl ScriptedProber {
    /// Every attempt returns `fallback` unless scripted otherwise.
    pub fn new(fallback: ProbeOutcome) -> Self {
        Self {
            script: std::sync::Mutex::new(std::collections::HashMap::new()),
            fallback,
            delay: Duration::ZERO,
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, service: &str, outcomes: Vec<Result<ProbeOutcome>>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(service.to_string(), outcomes.into());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl Prober for ScriptedProber {
    async fn check(
        &self,
        descriptor: &ServiceDescriptor,
        _handle: &RuntimeHandle,
    ) -> Result<ProbeOutcome> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&descriptor.name)
            .and_then(|q| q.pop_front());
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::LifecycleEvent;
    use crate::manifest::{ArtifactRef, HealthCheckSpec, Manifest};
    use crate::runtime::mock::MockRuntime;
    use crate::runtime::CommandOutput;
    use std::path::Path;

    fn service(retries: u32, start_period: Duration) -> ServiceDescriptor {
        let mut d = ServiceDescriptor::new(
            "cache",
            ArtifactRef::Image {
                reference: "redis:7".into(),
            },
        );
        d.health_check = Some(HealthCheckSpec {
            probe: ProbeKind::Command {
                argv: vec!["redis-cli".into(), "ping".into()],
            },
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
            retries,
            start_period,
        });
        d
    }

    /// Table with `d` already in Starting.
    fn starting_table(d: ServiceDescriptor) -> Arc<InstanceTable> {
        let manifest = Manifest::from_services("t", vec![d], Path::new(".")).unwrap();
        let table = Arc::new(InstanceTable::new(Arc::new(manifest)));
        table.transition("cache", ServiceState::Waiting, None).unwrap();
        table.transition("cache", ServiceState::Starting, None).unwrap();
        table
    }

    fn handle() -> RuntimeHandle {
        RuntimeHandle::new("cache", "mock-cache")
    }

    fn unhealthy() -> ProbeOutcome {
        ProbeOutcome::Unhealthy("connection refused".into())
    }

    #[tokio::test]
    async fn test_no_health_check_is_immediately_healthy() {
        let mut d = service(3, Duration::ZERO);
        d.health_check = None;
        let table = starting_table(d.clone());
        let prober = Arc::new(ScriptedProber::new(unhealthy()));
        let probe = HealthProbe::new(prober.clone(), table);
        assert_eq!(
            probe.wait_healthy(&d, &handle()).await,
            HealthVerdict::Healthy { attempts: 0 }
        );
        assert_eq!(prober.calls(), 0);
    }

    #[tokio::test]
    async fn test_passes_after_failures() {
        let d = service(3, Duration::ZERO);
        let table = starting_table(d.clone());
        let prober = Arc::new(
            ScriptedProber::new(ProbeOutcome::Healthy)
                .script("cache", vec![Ok(unhealthy()), Ok(unhealthy())]),
        );
        let probe = HealthProbe::new(prober.clone(), table.clone());
        assert_eq!(
            probe.wait_healthy(&d, &handle()).await,
            HealthVerdict::Healthy { attempts: 3 }
        );
        assert_eq!(table.snapshot().get("cache").unwrap().health_check_attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausts_after_retries_and_stops_probing() {
        let d = service(3, Duration::ZERO);
        let table = starting_table(d.clone());
        let prober = Arc::new(ScriptedProber::new(unhealthy()));
        let probe = HealthProbe::new(prober.clone(), table);
        match probe.wait_healthy(&d, &handle()).await {
            HealthVerdict::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "connection refused");
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prober.calls(), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let d = service(2, Duration::ZERO);
        let table = starting_table(d.clone());
        let prober = Arc::new(
            ScriptedProber::new(ProbeOutcome::Healthy).with_delay(Duration::from_millis(500)),
        );
        let probe = HealthProbe::new(prober, table);
        match probe.wait_healthy(&d, &handle()).await {
            HealthVerdict::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_error_counts_as_failed_attempt() {
        let d = service(1, Duration::ZERO);
        let table = starting_table(d.clone());
        let prober = Arc::new(ScriptedProber::new(ProbeOutcome::Healthy).script(
            "cache",
            vec![Err(StackError::probe("cache", "exec failed"))],
        ));
        let probe = HealthProbe::new(prober, table);
        assert!(matches!(
            probe.wait_healthy(&d, &handle()).await,
            HealthVerdict::Exhausted { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_start_period_failures_are_not_counted() {
        let d = service(1, Duration::from_millis(200));
        let table = starting_table(d.clone());
        let prober = Arc::new(ScriptedProber::new(ProbeOutcome::Healthy).script(
            "cache",
            vec![Ok(unhealthy()), Ok(unhealthy()), Ok(unhealthy())],
        ));
        let mut events = table.subscribe();
        let probe = HealthProbe::new(prober, table);
        assert_eq!(
            probe.wait_healthy(&d, &handle()).await,
            HealthVerdict::Healthy { attempts: 4 }
        );

        let mut uncounted = 0;
        while let Ok(ev) = events.try_recv() {
            if let LifecycleEvent::ProbeAttempt { counted: false, .. } = ev {
                uncounted += 1;
            }
        }
        assert_eq!(uncounted, 3);
    }

    #[tokio::test]
    async fn test_cancelled_when_instance_stops() {
        let d = service(1000, Duration::ZERO);
        let table = starting_table(d.clone());
        let prober = Arc::new(ScriptedProber::new(unhealthy()));
        let probe = HealthProbe::new(prober, table.clone());

        let stopper = {
            let table = table.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                table.transition("cache", ServiceState::Stopped, None).unwrap();
            })
        };
        assert_eq!(
            probe.wait_healthy(&d, &handle()).await,
            HealthVerdict::Cancelled
        );
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_prober_uses_runtime_exec() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.exec_results.lock().unwrap().insert(
            "cache".into(),
            CommandOutput::new(String::new(), "Could not connect\n".into(), Some(1)),
        );
        let prober = CommandProber::new(runtime.clone());
        let d = service(1, Duration::ZERO);
        assert_eq!(
            prober.check(&d, &handle()).await.unwrap(),
            ProbeOutcome::Unhealthy("probe exited with 1: Could not connect".into())
        );

        runtime.exec_results.lock().unwrap().clear();
        assert_eq!(
            prober.check(&d, &handle()).await.unwrap(),
            ProbeOutcome::Healthy
        );
    }

    #[tokio::test]
    async fn test_command_prober_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut d = service(1, Duration::ZERO);
        if let Some(hc) = d.health_check.as_mut() {
            hc.probe = ProbeKind::Tcp {
                host: "127.0.0.1".into(),
                port,
            };
        }
        let prober = CommandProber::new(Arc::new(MockRuntime::new()));
        assert_eq!(
            prober.check(&d, &handle()).await.unwrap(),
            ProbeOutcome::Healthy
        );

        drop(listener);
        assert!(matches!(
            prober.check(&d, &handle()).await.unwrap(),
            ProbeOutcome::Unhealthy(_)
        ));
    }
}
