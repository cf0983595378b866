//! Network fabric: the isolated segment services share and the registry
//! that answers "where is service X".
//!
//! A service becomes addressable when it enters Starting and stops being
//! addressable when it is stopped. Asking earlier is an ordering fault.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::error::{Result, StackError};
use crate::manifest::{PortMapping, ServiceDescriptor};
use crate::runtime::ServiceRuntime;

/// Where a registered service can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub service: String,
    /// DNS alias on a container network, loopback for host processes
    pub host: String,
    pub ports: Vec<PortMapping>,
}

/// How services address each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// Container network: the service name is a resolvable alias
    ServiceName,
    /// Host processes: everything is on 127.0.0.1
    Loopback,
}

impl AddressMode {
    /// Native processes share the host network; everything else gets aliases.
    pub fn for_runtime(runtime: &dyn ServiceRuntime) -> Self {
        if runtime.name() == "native" {
            AddressMode::Loopback
        } else {
            AddressMode::ServiceName
        }
    }
}

/// Proof that the segment exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub name: String,
}

pub struct NetworkFabric {
    name: String,
    mode: AddressMode,
    registry: RwLock<HashMap<String, Endpoint>>,
}

impl NetworkFabric {
    pub fn new(name: &str, mode: AddressMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> AddressMode {
        self.mode
    }

    /// Create the segment through the runtime.
    pub async fn provision(
        &self,
        runtime: &dyn ServiceRuntime,
        labels: &HashMap<String, String>,
    ) -> Result<NetworkHandle> {
        runtime.create_network(&self.name, labels).await?;
        info!(network = %self.name, runtime = runtime.name(), "Network ready");
        Ok(NetworkHandle {
            name: self.name.clone(),
        })
    }

    /// Remove the segment and forget every registration.
    pub async fn teardown(&self, runtime: &dyn ServiceRuntime) -> Result<()> {
        self.entries_mut().clear();
        runtime.remove_network(&self.name).await?;
        info!(network = %self.name, "Network removed");
        Ok(())
    }

    /// Make `descriptor` addressable. Called on entry to Starting.
    pub fn register(&self, descriptor: &ServiceDescriptor) -> Endpoint {
        let host = match self.mode {
            AddressMode::ServiceName => descriptor.name.clone(),
            AddressMode::Loopback => "127.0.0.1".to_string(),
        };
        let endpoint = Endpoint {
            service: descriptor.name.clone(),
            host,
            ports: descriptor.published_ports.clone(),
        };
        self.entries_mut()
            .insert(descriptor.name.clone(), endpoint.clone());
        debug!(service = %descriptor.name, host = %endpoint.host, "Address registered");
        endpoint
    }

    pub fn deregister(&self, service: &str) {
        if self.entries_mut().remove(service).is_some() {
            debug!(service, "Address deregistered");
        }
    }

    pub fn address_of(&self, service: &str) -> Result<Endpoint> {
        self.entries().get(service).cloned().ok_or_else(|| {
            StackError::UnresolvedAddress(format!(
                "service '{}' is not running on network '{}'",
                service, self.name
            ))
        })
    }

    // Every registry update is a single map operation, so a poisoned lock
    // still guards a consistent map.
    fn entries(&self) -> RwLockReadGuard<'_, HashMap<String, Endpoint>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Endpoint>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}
