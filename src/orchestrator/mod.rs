//! Startup coordinator
//!
//! One unit per service runs in a `JoinSet`. A unit walks its own instance
//! through Waiting, Starting and Healthy; the gate, the launcher and the
//! probe are its suspension points. Failures cascade to dependents through
//! the instance table, so no unit ever polls another.

mod report;

pub use report::{ServiceStatus, StatusReport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StackError};
use crate::gate::DependencyGate;
use crate::health::{CommandProber, HealthProbe, HealthVerdict, Prober};
use crate::instance::{InstanceTable, LifecycleEvent, ServiceState, TableState};
use crate::launcher::{Launcher, LABEL_PROJECT};
use crate::manifest::{Manifest, ServiceDescriptor};
use crate::network::{AddressMode, NetworkFabric};
use crate::runtime::{RuntimeHandle, ServiceRuntime};

/// Grace period for services without `stop_grace_period`.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// How long a service without a health check must stay up after launch.
pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_millis(250);

/// Knobs that do not belong in the manifest.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Probe host ports before launching
    pub check_ports: bool,
    /// A service without a health check is Healthy only if it is still
    /// running this long after launch. Zero checks right away.
    pub settle_time: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            check_ports: true,
            settle_time: DEFAULT_SETTLE_TIME,
        }
    }
}

struct Inner {
    manifest: Arc<Manifest>,
    table: Arc<InstanceTable>,
    runtime: Arc<dyn ServiceRuntime>,
    fabric: Arc<NetworkFabric>,
    launcher: Launcher,
    gate: DependencyGate,
    probe: HealthProbe,
    /// Whoever removes a handle owns stopping it.
    handles: Mutex<HashMap<String, RuntimeHandle>>,
    network_up: Mutex<bool>,
    settle_time: Duration,
    /// True while no unit task is alive. Units outlive a dropped `up()`
    /// future, so `shutdown` can wait for them to clean up.
    idle: watch::Sender<bool>,
}

/// Runs a manifest to a settled state and tears it down again.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Coordinator using the production [`CommandProber`].
    pub fn new(
        manifest: Arc<Manifest>,
        runtime: Arc<dyn ServiceRuntime>,
        options: CoordinatorOptions,
    ) -> Self {
        let prober: Arc<dyn Prober> = Arc::new(CommandProber::new(Arc::clone(&runtime)));
        Self::with_prober(manifest, runtime, prober, options)
    }

    pub fn with_prober(
        manifest: Arc<Manifest>,
        runtime: Arc<dyn ServiceRuntime>,
        prober: Arc<dyn Prober>,
        options: CoordinatorOptions,
    ) -> Self {
        let table = Arc::new(InstanceTable::new(Arc::clone(&manifest)));
        let fabric = Arc::new(NetworkFabric::new(
            &manifest.network_name(),
            AddressMode::for_runtime(runtime.as_ref()),
        ));
        let launcher = Launcher::new(
            Arc::clone(&manifest),
            Arc::clone(&runtime),
            Arc::clone(&fabric),
        )
        .with_port_checks(options.check_ports);
        let gate = DependencyGate::new(Arc::clone(&table));
        let probe = HealthProbe::new(prober, Arc::clone(&table));

        Self {
            inner: Arc::new(Inner {
                manifest,
                table,
                runtime,
                fabric,
                launcher,
                gate,
                probe,
                handles: Mutex::new(HashMap::new()),
                network_up: Mutex::new(false),
                settle_time: options.settle_time,
                idle: watch::channel(true).0,
            }),
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.inner.manifest
    }

    /// Lifecycle events (transitions and probe attempts) from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.table.subscribe()
    }

    pub fn snapshot(&self) -> TableState {
        self.inner.table.snapshot()
    }

    pub fn report(&self) -> StatusReport {
        StatusReport::from_table(
            &self.inner.table.snapshot(),
            self.inner.manifest.project(),
            self.inner.fabric.name(),
            self.inner.runtime.name(),
            self.inner.launcher.run_id(),
        )
    }

    /// Bring the whole stack up and return once every service is Healthy,
    /// Failed or Stopped.
    ///
    /// Only network provisioning errors are returned; per-service failures
    /// are in the report.
    pub async fn up(&self) -> Result<StatusReport> {
        let inner = &self.inner;
        let mut labels = HashMap::new();
        labels.insert(
            LABEL_PROJECT.to_string(),
            inner.manifest.project().to_string(),
        );
        inner
            .fabric
            .provision(inner.runtime.as_ref(), &labels)
            .await?;
        *inner.network_up.lock().await = true;

        info!(
            project = %inner.manifest.project(),
            services = inner.manifest.len(),
            runtime = inner.runtime.name(),
            "Starting stack"
        );

        // Units run under a detached supervisor: dropping this future (an
        // interrupt) must not abort a unit between `runtime.start` and
        // recording its handle.
        inner.idle.send_replace(false);
        let mut units = JoinSet::new();
        for descriptor in inner.manifest.services() {
            let inner = Arc::clone(inner);
            let descriptor = Arc::clone(descriptor);
            units.spawn(async move { run_unit(inner, descriptor).await });
        }
        let supervisor = Arc::clone(inner);
        tokio::spawn(async move {
            while let Some(joined) = units.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Service unit panicked");
                }
            }
            supervisor.idle.send_replace(true);
        });
        wait_idle(inner).await;

        // Units only return once their own instance settled or was taken
        // over by a cascade or stop.
        inner.table.wait_settled().await;

        let report = self.report();
        if report.any_failed() {
            warn!(project = %inner.manifest.project(), "Stack started with failures");
        } else {
            info!(project = %inner.manifest.project(), "Stack is healthy");
        }
        Ok(report)
    }

    /// Stop one service.
    ///
    /// Not yet started services become Stopped and their dependents fail.
    /// A Healthy service is stopped in the runtime. Failed and Stopped
    /// services are left alone.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let inner = &self.inner;
        let descriptor = inner
            .manifest
            .get(name)
            .cloned()
            .ok_or_else(|| StackError::UnknownService(name.to_string()))?;

        // The unit may move the instance between our read and our write;
        // retry on the fresh state.
        loop {
            let state = inner
                .table
                .state_of(name)
                .ok_or_else(|| StackError::UnknownService(name.to_string()))?;
            let result = match state {
                ServiceState::Failed | ServiceState::Stopped => return Ok(()),
                ServiceState::Pending => inner
                    .table
                    .transition(name, ServiceState::Waiting, None)
                    .map(|_| ()),
                ServiceState::Waiting | ServiceState::Starting => {
                    let r = inner
                        .table
                        .transition(name, ServiceState::Stopped, Some("stopped by request"));
                    if r.is_ok() {
                        inner.table.cascade_failure(name);
                        // A unit still launching finds Stopped and cleans up.
                        let handle = inner.handles.lock().await.remove(name);
                        if let Some(handle) = handle {
                            stop_handle(inner, &descriptor, handle).await;
                        }
                        return Ok(());
                    }
                    r.map(|_| ())
                }
                ServiceState::Healthy => {
                    let r = inner
                        .table
                        .transition(name, ServiceState::Stopped, Some("stopped by request"));
                    if r.is_ok() {
                        let handle = inner.handles.lock().await.remove(name);
                        if let Some(handle) = handle {
                            stop_handle(inner, &descriptor, handle).await;
                        }
                        return Ok(());
                    }
                    r.map(|_| ())
                }
            };
            match result {
                Ok(()) | Err(StackError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop everything that is not terminal, dependents first, then remove
    /// the network.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        info!(project = %inner.manifest.project(), "Shutting down stack");
        for descriptor in inner.manifest.services().iter().rev() {
            if let Err(e) = self.stop(&descriptor.name).await {
                warn!(service = %descriptor.name, error = %e, "Stop failed");
            }
        }

        // Units still launching see Stopped and release what they started.
        wait_idle(inner).await;

        // Failed services may still hold a runtime handle.
        let leftovers: Vec<(String, RuntimeHandle)> =
            inner.handles.lock().await.drain().collect();
        for (name, handle) in leftovers {
            if let Some(descriptor) = inner.manifest.get(&name).cloned() {
                stop_handle(inner, &descriptor, handle).await;
            }
        }

        let mut network_up = inner.network_up.lock().await;
        if *network_up {
            inner.fabric.teardown(inner.runtime.as_ref()).await?;
            *network_up = false;
        }
        Ok(())
    }
}

// ============================================================================
// Service unit
// ============================================================================

async fn run_unit(inner: Arc<Inner>, descriptor: Arc<ServiceDescriptor>) {
    let name = descriptor.name.as_str();

    // A cascade may already have failed us while we were Pending.
    if inner
        .table
        .transition(name, ServiceState::Waiting, None)
        .is_err()
    {
        return;
    }

    match inner.gate.await_ready(&descriptor).await {
        Ok(()) => {}
        Err(StackError::Cancelled(reason)) => {
            debug!(service = name, reason = %reason, "Unit cancelled while waiting");
            return;
        }
        Err(e) => {
            fail(&inner, name, &e.to_string());
            return;
        }
    }

    if inner
        .table
        .transition(name, ServiceState::Starting, None)
        .is_err()
    {
        return;
    }
    inner.fabric.register(&descriptor);

    let handle = match inner.launcher.start(&descriptor).await {
        Ok(handle) => handle,
        Err(e) => {
            fail(&inner, name, &e.to_string());
            return;
        }
    };
    inner
        .handles
        .lock()
        .await
        .insert(name.to_string(), handle.clone());

    // Stopped while the runtime was starting it.
    if inner.table.state_of(name) != Some(ServiceState::Starting) {
        release(&inner, &descriptor).await;
        return;
    }

    if descriptor.health_check.is_none() {
        if let Err(e) = confirm_running(&inner, &handle).await {
            fail(&inner, name, &e.to_string());
            release(&inner, &descriptor).await;
            return;
        }
    }

    match inner.probe.wait_healthy(&descriptor, &handle).await {
        HealthVerdict::Healthy { attempts } => {
            if inner
                .table
                .transition(name, ServiceState::Healthy, None)
                .is_err()
            {
                release(&inner, &descriptor).await;
                return;
            }
            debug!(service = name, attempts, "Service healthy");
        }
        HealthVerdict::Exhausted {
            attempts,
            last_error,
        } => {
            fail(
                &inner,
                name,
                &format!(
                    "health check failed after {} attempts: {}",
                    attempts, last_error
                ),
            );
            release(&inner, &descriptor).await;
        }
        HealthVerdict::Cancelled => release(&inner, &descriptor).await,
    }
}

/// Fail `name`, drop its address and fail everything waiting on it.
fn fail(inner: &Inner, name: &str, reason: &str) {
    if inner
        .table
        .transition(name, ServiceState::Failed, Some(reason))
        .is_ok()
    {
        inner.fabric.deregister(name);
        let cascaded = inner.table.cascade_failure(name);
        if !cascaded.is_empty() {
            warn!(service = name, dependents = ?cascaded, "Failure cascaded");
        }
    }
}

/// Without a health check, "running after the settle time" is the only
/// readiness signal there is.
async fn confirm_running(inner: &Inner, handle: &RuntimeHandle) -> Result<()> {
    if !inner.settle_time.is_zero() {
        tokio::time::sleep(inner.settle_time).await;
    }
    match inner.runtime.is_running(handle).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(StackError::launch(
            &handle.service,
            "process exited right after launch",
        )),
        Err(e) => Err(StackError::launch(&handle.service, e.to_string())),
    }
}

async fn wait_idle(inner: &Inner) {
    let mut rx = inner.idle.subscribe();
    // The sender lives in `inner`, so the channel cannot close here.
    let _ = rx.wait_for(|idle| *idle).await;
}

/// Stop the unit's runtime handle if nobody else took it.
async fn release(inner: &Inner, descriptor: &ServiceDescriptor) {
    let handle = inner.handles.lock().await.remove(&descriptor.name);
    if let Some(handle) = handle {
        stop_handle(inner, descriptor, handle).await;
    }
}

async fn stop_handle(inner: &Inner, descriptor: &ServiceDescriptor, handle: RuntimeHandle) {
    let grace = descriptor.stop_timeout.unwrap_or(DEFAULT_STOP_GRACE);
    inner.fabric.deregister(&descriptor.name);
    match inner.runtime.stop(&handle, grace).await {
        Ok(()) => info!(service = %descriptor.name, "Service stopped"),
        Err(e) => warn!(service = %descriptor.name, error = %e, "Runtime stop failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ProbeOutcome, ScriptedProber};
    use crate::manifest::{ArtifactRef, HealthCheckSpec, LoadOptions, ProbeKind};
    use crate::runtime::mock::MockRuntime;
    use std::path::Path;

    const STACK: &str = r#"
name: analytics
services:
  cache:
    image: redis:7
    healthcheck:
      test: ["CMD", "redis-cli", "ping"]
      interval: 10ms
      timeout: 100ms
      retries: 3
  backend:
    build: ./backend
    depends_on:
      cache:
        condition: service_healthy
  frontend:
    build: ./frontend
    depends_on: [backend]
"#;

    fn coordinator(
        src: &str,
        runtime: Arc<MockRuntime>,
        prober: ScriptedProber,
    ) -> Coordinator {
        let manifest =
            Manifest::from_yaml_str(src, Path::new("."), &LoadOptions::default()).unwrap();
        Coordinator::with_prober(
            Arc::new(manifest),
            runtime,
            Arc::new(prober),
            CoordinatorOptions {
                check_ports: false,
                settle_time: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_all_healthy_in_dependency_order() {
        let runtime = Arc::new(MockRuntime::new());
        let c = coordinator(STACK, runtime.clone(), ScriptedProber::new(ProbeOutcome::Healthy));
        let report = c.up().await.unwrap();
        assert!(report.all_healthy());
        assert_eq!(runtime.started_names(), vec!["cache", "backend", "frontend"]);

        let snap = c.snapshot();
        let cache_healthy = snap.get("cache").unwrap().entered(ServiceState::Healthy).unwrap();
        let backend_starting = snap
            .get("backend")
            .unwrap()
            .entered(ServiceState::Starting)
            .unwrap();
        assert!(backend_starting > cache_healthy);
    }

    #[tokio::test]
    async fn test_failed_probe_cascades() {
        let runtime = Arc::new(MockRuntime::new());
        let prober = ScriptedProber::new(ProbeOutcome::Unhealthy("refused".into()));
        let c = coordinator(STACK, runtime.clone(), prober);
        let report = c.up().await.unwrap();

        assert_eq!(report.get("cache").unwrap().state, ServiceState::Failed);
        assert_eq!(report.get("cache").unwrap().health_check_attempts, 3);
        assert_eq!(report.get("backend").unwrap().state, ServiceState::Failed);
        assert_eq!(report.get("frontend").unwrap().state, ServiceState::Failed);
        assert_eq!(runtime.started_names(), vec!["cache"]);
        // the unhealthy cache container is released
        assert_eq!(runtime.stopped_names(), vec!["cache"]);
    }

    #[tokio::test]
    async fn test_launch_failure_only_hits_dependents() {
        let src = r#"
services:
  a:
    image: x
  b:
    image: y
    depends_on: [a]
  c:
    image: z
"#;
        let runtime = Arc::new(MockRuntime::failing(&["a"]));
        let c = coordinator(src, runtime, ScriptedProber::new(ProbeOutcome::Healthy));
        let report = c.up().await.unwrap();
        assert_eq!(report.get("a").unwrap().state, ServiceState::Failed);
        assert!(report
            .get("a")
            .unwrap()
            .last_error
            .as_deref()
            .unwrap()
            .contains("mock refused"));
        assert_eq!(report.get("b").unwrap().state, ServiceState::Failed);
        assert_eq!(report.get("c").unwrap().state, ServiceState::Healthy);
    }

    #[tokio::test]
    async fn test_exited_service_without_health_check_fails() {
        let runtime = Arc::new(MockRuntime::exiting(&["backend"]));
        let c = coordinator(STACK, runtime.clone(), ScriptedProber::new(ProbeOutcome::Healthy));
        let report = c.up().await.unwrap();

        assert_eq!(report.get("cache").unwrap().state, ServiceState::Healthy);
        let backend = report.get("backend").unwrap();
        assert_eq!(backend.state, ServiceState::Failed);
        assert!(backend
            .last_error
            .as_deref()
            .unwrap()
            .contains("exited right after launch"));
        assert_eq!(report.get("frontend").unwrap().state, ServiceState::Failed);
        assert!(!runtime.started_names().contains(&"frontend".to_string()));
    }

    #[tokio::test]
    async fn test_interrupted_up_still_stops_launching_service() {
        let runtime =
            Arc::new(MockRuntime::new().with_start_delay(Duration::from_millis(100)));
        let c = coordinator(STACK, runtime.clone(), ScriptedProber::new(ProbeOutcome::Healthy));

        tokio::select! {
            _ = c.up() => panic!("up finished before the interrupt"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        c.shutdown().await.unwrap();

        assert_eq!(runtime.started_names(), vec!["cache"]);
        assert_eq!(runtime.stopped_names(), vec!["cache"]);
        assert!(runtime.networks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_waiting_service() {
        let runtime = Arc::new(MockRuntime::new());
        // cache's probe is slow enough for us to stop backend while it waits
        let c = coordinator(
            STACK,
            runtime.clone(),
            ScriptedProber::new(ProbeOutcome::Healthy).with_delay(Duration::from_millis(60)),
        );

        let up = {
            let c = c.clone();
            tokio::spawn(async move { c.up().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        c.stop("backend").await.unwrap();

        let report = up.await.unwrap().unwrap();
        assert_eq!(report.get("cache").unwrap().state, ServiceState::Healthy);
        assert_eq!(report.get("backend").unwrap().state, ServiceState::Stopped);
        assert_eq!(report.get("frontend").unwrap().state, ServiceState::Failed);
        assert!(!runtime.started_names().contains(&"backend".to_string()));
    }

    #[tokio::test]
    async fn test_stop_unknown_service() {
        let c = coordinator(
            STACK,
            Arc::new(MockRuntime::new()),
            ScriptedProber::new(ProbeOutcome::Healthy),
        );
        assert!(matches!(
            c.stop("ghost").await,
            Err(StackError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_reverse_order() {
        let runtime = Arc::new(MockRuntime::new());
        let c = coordinator(STACK, runtime.clone(), ScriptedProber::new(ProbeOutcome::Healthy));
        c.up().await.unwrap();
        c.shutdown().await.unwrap();

        assert_eq!(runtime.stopped_names(), vec!["frontend", "backend", "cache"]);
        assert!(runtime.networks.lock().unwrap().is_empty());
        let snap = c.snapshot();
        assert!(snap
            .instances()
            .iter()
            .all(|i| i.state == ServiceState::Stopped));
        // stopping again is a no-op
        c.stop("cache").await.unwrap();
    }

    #[tokio::test]
    async fn test_no_health_check_skips_probe() {
        let runtime = Arc::new(MockRuntime::new());
        let prober = Arc::new(ScriptedProber::new(ProbeOutcome::Unhealthy("x".into())));
        let manifest = Manifest::from_services(
            "t",
            vec![ServiceDescriptor::new(
                "worker",
                ArtifactRef::Image {
                    reference: "w".into(),
                },
            )],
            Path::new("."),
        )
        .unwrap();
        let c = Coordinator::with_prober(
            Arc::new(manifest),
            runtime,
            prober.clone(),
            CoordinatorOptions::default(),
        );
        let report = c.up().await.unwrap();
        assert!(report.all_healthy());
        assert_eq!(prober.calls(), 0);
    }

    #[tokio::test]
    async fn test_events_stream() {
        let mut d = ServiceDescriptor::new(
            "cache",
            ArtifactRef::Image {
                reference: "redis".into(),
            },
        );
        d.health_check = Some(HealthCheckSpec {
            probe: ProbeKind::Tcp {
                host: "127.0.0.1".into(),
                port: 1,
            },
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(50),
            retries: 1,
            start_period: Duration::ZERO,
        });
        let manifest = Manifest::from_services("t", vec![d], Path::new(".")).unwrap();
        let c = Coordinator::with_prober(
            Arc::new(manifest),
            Arc::new(MockRuntime::new()),
            Arc::new(ScriptedProber::new(ProbeOutcome::Healthy)),
            CoordinatorOptions::default(),
        );
        let mut events = c.subscribe();
        c.up().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(match ev {
                LifecycleEvent::Transition { transition, .. } => transition.to.to_string(),
                LifecycleEvent::ProbeAttempt { .. } => "probe".to_string(),
            });
        }
        assert_eq!(kinds, vec!["waiting", "starting", "probe", "healthy"]);
    }
}
