//! Service instances and the shared instance table.
//!
//! The table lives inside a `tokio::sync::watch` channel. Every mutation
//! goes through `send_if_modified`, so a transition is atomic with respect to
//! readers and wakes every task waiting on the table (dependency gates,
//! probe loops, the coordinator).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::error::{Result, StackError};
use crate::manifest::{Manifest, ServiceDescriptor};

/// Capacity of the lifecycle event channel. Slow subscribers lag rather
/// than block transitions.
const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Lifecycle state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Pending,
    Waiting,
    Starting,
    Healthy,
    Failed,
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Pending => "pending",
            ServiceState::Waiting => "waiting",
            ServiceState::Starting => "starting",
            ServiceState::Healthy => "healthy",
            ServiceState::Failed => "failed",
            ServiceState::Stopped => "stopped",
        }
    }

    /// Edges of the lifecycle state machine.
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Pending, Waiting)
                | (Waiting, Starting)
                | (Waiting, Failed)
                | (Waiting, Stopped)
                | (Starting, Healthy)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Healthy, Stopped)
        )
    }

    /// Failed and Stopped never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Failed | ServiceState::Stopped)
    }

    /// A state the startup run does not move past on its own.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ServiceState::Healthy | ServiceState::Failed | ServiceState::Stopped
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted state change.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    /// Table-wide, strictly increasing
    pub seq: u64,
    pub from: ServiceState,
    pub to: ServiceState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Runtime view of one service.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub descriptor: Arc<ServiceDescriptor>,
    pub state: ServiceState,
    pub health_check_attempts: u32,
    pub last_error: Option<String>,
    pub history: Vec<Transition>,
}

impl ServiceInstance {
    fn new(descriptor: Arc<ServiceDescriptor>) -> Self {
        Self {
            descriptor,
            state: ServiceState::Pending,
            health_check_attempts: 0,
            last_error: None,
            history: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Sequence number of the transition into `state`, if it happened.
    pub fn entered(&self, state: ServiceState) -> Option<u64> {
        self.history.iter().find(|t| t.to == state).map(|t| t.seq)
    }
}

/// Something worth telling subscribers about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Transition {
        service: String,
        #[serde(flatten)]
        transition: Transition,
    },
    ProbeAttempt {
        service: String,
        attempt: u32,
        passed: bool,
        /// False while the start period is still running
        counted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

// ============================================================================
// Table
// ============================================================================

/// Consistent snapshot of every instance.
#[derive(Debug, Clone)]
pub struct TableState {
    instances: Vec<ServiceInstance>,
    index: HashMap<String, usize>,
    next_seq: u64,
}

impl TableState {
    pub fn get(&self, name: &str) -> Option<&ServiceInstance> {
        self.index.get(name).map(|&i| &self.instances[i])
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut ServiceInstance> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.instances[i]),
            None => None,
        }
    }

    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.get(name).map(|i| i.state)
    }

    /// Instances in launch order.
    pub fn instances(&self) -> &[ServiceInstance] {
        &self.instances
    }

    pub fn all_settled(&self) -> bool {
        self.instances.iter().all(|i| i.state.is_settled())
    }

    fn apply(
        &mut self,
        name: &str,
        to: ServiceState,
        reason: Option<&str>,
    ) -> Result<Transition> {
        let seq = self.next_seq;
        let inst = self
            .get_mut(name)
            .ok_or_else(|| StackError::UnknownService(name.to_string()))?;
        let from = inst.state;
        if !from.can_transition_to(to) {
            return Err(StackError::InvalidTransition {
                service: name.to_string(),
                from,
                to,
            });
        }

        let transition = Transition {
            seq,
            from,
            to,
            at: Utc::now(),
            reason: reason.map(str::to_string),
        };
        inst.state = to;
        if to == ServiceState::Waiting {
            inst.health_check_attempts = 0;
        }
        if to == ServiceState::Failed {
            if let Some(r) = reason {
                inst.last_error = Some(r.to_string());
            }
        }
        inst.history.push(transition.clone());
        self.next_seq += 1;
        Ok(transition)
    }
}

/// Shared, observable table of service instances.
pub struct InstanceTable {
    manifest: Arc<Manifest>,
    state: watch::Sender<TableState>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl InstanceTable {
    /// One Pending instance per manifest service.
    pub fn new(manifest: Arc<Manifest>) -> Self {
        let instances: Vec<ServiceInstance> = manifest
            .services()
            .iter()
            .cloned()
            .map(ServiceInstance::new)
            .collect();
        let index = instances
            .iter()
            .enumerate()
            .map(|(i, inst)| (inst.name().to_string(), i))
            .collect();
        let (state, _) = watch::channel(TableState {
            instances,
            index,
            next_seq: 1,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            manifest,
            state,
            events,
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Receiver that observes every table change.
    pub fn watch(&self) -> watch::Receiver<TableState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> TableState {
        self.state.borrow().clone()
    }

    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.state.borrow().state_of(name)
    }

    /// Move `name` to `to`. Rejected transitions change nothing.
    pub fn transition(
        &self,
        name: &str,
        to: ServiceState,
        reason: Option<&str>,
    ) -> Result<Transition> {
        let mut outcome = None;
        self.state.send_if_modified(|table| {
            let res = table.apply(name, to, reason);
            let changed = res.is_ok();
            outcome = Some(res);
            changed
        });
        let transition = outcome
            .unwrap_or_else(|| Err(StackError::UnknownService(name.to_string())))?;
        self.announce(name, &transition);
        Ok(transition)
    }

    /// Fail every not-yet-started service that transitively depends on
    /// `root`. Returns the services failed by this call, in walk order.
    pub fn cascade_failure(&self, root: &str) -> Vec<String> {
        let mut applied: Vec<(String, Transition)> = Vec::new();
        self.state.send_if_modified(|table| {
            let mut queue: VecDeque<&str> = VecDeque::new();
            let mut seen: HashSet<&str> = HashSet::new();
            queue.push_back(root);
            seen.insert(root);

            while let Some(current) = queue.pop_front() {
                for dependent in self.manifest.dependents(current) {
                    if !seen.insert(dependent.as_str()) {
                        continue;
                    }
                    queue.push_back(dependent.as_str());

                    let reason = format!("dependency '{}' failed", current);
                    let state = table.state_of(dependent);
                    if state == Some(ServiceState::Pending) {
                        if let Ok(t) = table.apply(dependent, ServiceState::Waiting, None) {
                            applied.push((dependent.clone(), t));
                        }
                    }
                    if table.state_of(dependent) == Some(ServiceState::Waiting) {
                        if let Ok(t) = table.apply(dependent, ServiceState::Failed, Some(&reason)) {
                            applied.push((dependent.clone(), t));
                        }
                    }
                }
            }
            !applied.is_empty()
        });

        let mut failed = Vec::new();
        for (name, transition) in &applied {
            self.announce(name, transition);
            if transition.to == ServiceState::Failed {
                failed.push(name.clone());
            }
        }
        failed
    }

    /// Count one probe attempt and publish it. Returns the new count.
    pub fn record_probe_attempt(
        &self,
        name: &str,
        passed: bool,
        counted: bool,
        detail: Option<String>,
    ) -> u32 {
        let mut attempt = 0;
        self.state.send_modify(|table| {
            if let Some(inst) = table.get_mut(name) {
                inst.health_check_attempts += 1;
                attempt = inst.health_check_attempts;
                if !passed {
                    inst.last_error = detail.clone();
                }
            }
        });
        let _ = self.events.send(LifecycleEvent::ProbeAttempt {
            service: name.to_string(),
            attempt,
            passed,
            counted,
            detail,
        });
        attempt
    }

    /// Resolve once every instance is settled.
    pub async fn wait_settled(&self) {
        let mut rx = self.watch();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(TableState::all_settled).await;
    }

    fn announce(&self, name: &str, transition: &Transition) {
        let reason = transition.reason.as_deref().unwrap_or("");
        if transition.to == ServiceState::Failed {
            warn!(
                service = name,
                from = %transition.from,
                to = %transition.to,
                seq = transition.seq,
                reason,
                "Service state changed"
            );
        } else {
            info!(
                service = name,
                from = %transition.from,
                to = %transition.to,
                seq = transition.seq,
                "Service state changed"
            );
        }
        let _ = self.events.send(LifecycleEvent::Transition {
            service: name.to_string(),
            transition: transition.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ArtifactRef, Manifest};
    use std::path::Path;

    fn svc(name: &str, deps: &[&str]) -> ServiceDescriptor {
        let mut s = ServiceDescriptor::new(
            name,
            ArtifactRef::Image {
                reference: "alpine".into(),
            },
        );
        s.dependencies = deps.iter().map(|d| d.to_string()).collect();
        s
    }

    fn table(services: Vec<ServiceDescriptor>) -> InstanceTable {
        let manifest = Manifest::from_services("t", services, Path::new(".")).unwrap();
        InstanceTable::new(Arc::new(manifest))
    }

    #[test]
    fn test_state_machine_edges() {
        use ServiceState::*;
        assert!(Pending.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Healthy));
        assert!(Healthy.can_transition_to(Stopped));
        assert!(!Pending.can_transition_to(Starting));
        assert!(!Healthy.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Waiting));
        assert!(!Stopped.can_transition_to(Waiting));
        assert!(Failed.is_terminal() && Stopped.is_terminal());
        assert!(!Healthy.is_terminal());
        assert!(Healthy.is_settled());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Healthy.to_string(), "healthy");
        assert_eq!(ServiceState::Waiting.to_string(), "waiting");
    }

    #[test]
    fn test_transition_records_history_and_seq() {
        let t = table(vec![svc("a", &[]), svc("b", &[])]);
        let first = t.transition("a", ServiceState::Waiting, None).unwrap();
        let second = t.transition("b", ServiceState::Waiting, None).unwrap();
        let third = t.transition("a", ServiceState::Starting, None).unwrap();
        assert!(first.seq < second.seq && second.seq < third.seq);

        let snap = t.snapshot();
        let a = snap.get("a").unwrap();
        assert_eq!(a.state, ServiceState::Starting);
        assert_eq!(a.history.len(), 2);
        assert_eq!(a.entered(ServiceState::Starting), Some(third.seq));
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let t = table(vec![svc("a", &[])]);
        let err = t.transition("a", ServiceState::Healthy, None).unwrap_err();
        assert!(matches!(
            err,
            StackError::InvalidTransition {
                from: ServiceState::Pending,
                to: ServiceState::Healthy,
                ..
            }
        ));
        let snap = t.snapshot();
        assert_eq!(snap.state_of("a"), Some(ServiceState::Pending));
        assert!(snap.get("a").unwrap().history.is_empty());
    }

    #[test]
    fn test_unknown_service() {
        let t = table(vec![svc("a", &[])]);
        assert!(matches!(
            t.transition("zzz", ServiceState::Waiting, None),
            Err(StackError::UnknownService(_))
        ));
    }

    #[test]
    fn test_failed_sets_last_error() {
        let t = table(vec![svc("a", &[])]);
        t.transition("a", ServiceState::Waiting, None).unwrap();
        t.transition("a", ServiceState::Failed, Some("boom")).unwrap();
        assert_eq!(
            t.snapshot().get("a").unwrap().last_error.as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn test_cascade_failure_walks_transitively() {
        let t = table(vec![
            svc("cache", &[]),
            svc("backend", &["cache"]),
            svc("frontend", &["backend"]),
            svc("other", &[]),
        ]);
        t.transition("cache", ServiceState::Waiting, None).unwrap();
        t.transition("cache", ServiceState::Failed, Some("probe")).unwrap();
        t.transition("backend", ServiceState::Waiting, None).unwrap();

        let failed = t.cascade_failure("cache");
        assert_eq!(failed, vec!["backend", "frontend"]);

        let snap = t.snapshot();
        assert_eq!(snap.state_of("backend"), Some(ServiceState::Failed));
        assert_eq!(snap.state_of("frontend"), Some(ServiceState::Failed));
        assert_eq!(snap.state_of("other"), Some(ServiceState::Pending));
        // Pending passes through Waiting
        let fe = snap.get("frontend").unwrap();
        assert_eq!(fe.history[0].to, ServiceState::Waiting);
        assert_eq!(
            fe.last_error.as_deref(),
            Some("dependency 'backend' failed")
        );
    }

    #[test]
    fn test_cascade_is_idempotent() {
        let t = table(vec![svc("a", &[]), svc("b", &["a"])]);
        assert_eq!(t.cascade_failure("a"), vec!["b"]);
        assert!(t.cascade_failure("a").is_empty());
    }

    #[test]
    fn test_deep_cascade_does_not_recurse() {
        let n = 5000;
        let mut services = vec![svc("s0", &[])];
        for i in 1..n {
            services.push(svc(&format!("s{}", i), &[&format!("s{}", i - 1)]));
        }
        let t = table(services);
        assert_eq!(t.cascade_failure("s0").len(), n - 1);
    }

    #[test]
    fn test_probe_attempts_reset_on_waiting() {
        let t = table(vec![svc("a", &[])]);
        assert_eq!(t.record_probe_attempt("a", false, true, Some("x".into())), 1);
        assert_eq!(t.record_probe_attempt("a", false, true, None), 2);
        t.transition("a", ServiceState::Waiting, None).unwrap();
        assert_eq!(t.snapshot().get("a").unwrap().health_check_attempts, 0);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let t = table(vec![svc("a", &[])]);
        let mut rx = t.subscribe();
        t.transition("a", ServiceState::Waiting, None).unwrap();
        t.record_probe_attempt("a", true, true, None);
        match rx.recv().await.unwrap() {
            LifecycleEvent::Transition { service, transition } => {
                assert_eq!(service, "a");
                assert_eq!(transition.to, ServiceState::Waiting);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            LifecycleEvent::ProbeAttempt { attempt: 1, passed: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_wait_settled() {
        let t = Arc::new(table(vec![svc("a", &[])]));
        let waiter = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.wait_settled().await })
        };
        t.transition("a", ServiceState::Waiting, None).unwrap();
        t.transition("a", ServiceState::Starting, None).unwrap();
        t.transition("a", ServiceState::Healthy, None).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
