//! Dependency gate: holds a Waiting service until every dependency is
//! Healthy, and fails closed the moment one of them cannot get there.

use std::sync::Arc;

use crate::error::{Result, StackError};
use crate::instance::{InstanceTable, ServiceState, TableState};
use crate::manifest::ServiceDescriptor;

pub struct DependencyGate {
    table: Arc<InstanceTable>,
}

impl DependencyGate {
    pub fn new(table: Arc<InstanceTable>) -> Self {
        Self { table }
    }

    /// Suspend until `descriptor` may launch.
    ///
    /// Wakes only on table changes. Returns `DependencyFailed` as soon as a
    /// dependency is Failed or Stopped, and `Cancelled` if the service itself
    /// left Waiting in the meantime.
    pub async fn await_ready(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let mut rx = self.table.watch();
        loop {
            let decision = evaluate(&rx.borrow_and_update(), descriptor);
            if let Some(result) = decision {
                return result;
            }
            crate::log_component!(
                debug,
                "gate",
                "Waiting on dependencies",
                service = descriptor.name.as_str()
            );
            if rx.changed().await.is_err() {
                return Err(StackError::Cancelled(format!(
                    "instance table closed while '{}' was waiting",
                    descriptor.name
                )));
            }
        }
    }
}

/// `None` while undecided.
fn evaluate(table: &TableState, descriptor: &ServiceDescriptor) -> Option<Result<()>> {
    let name = descriptor.name.as_str();
    match table.state_of(name) {
        Some(ServiceState::Waiting) => {}
        Some(state) => {
            return Some(Err(StackError::Cancelled(format!(
                "'{}' left waiting (now {})",
                name, state
            ))))
        }
        None => return Some(Err(StackError::UnknownService(name.to_string()))),
    }

    let mut all_healthy = true;
    for dep in &descriptor.dependencies {
        match table.state_of(dep) {
            Some(ServiceState::Healthy) => {}
            Some(state @ (ServiceState::Failed | ServiceState::Stopped)) => {
                return Some(Err(StackError::DependencyFailed {
                    service: name.to_string(),
                    dependency: dep.clone(),
                    state,
                }))
            }
            Some(_) => all_healthy = false,
            None => return Some(Err(StackError::UnknownService(dep.clone()))),
        }
    }
    all_healthy.then_some(Ok(()))
}
