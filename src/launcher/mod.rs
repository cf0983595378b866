//! Launcher: turns a descriptor into a running service.
//!
//! Steps, each failing the service with a launch error: resolve environment
//! templates, check secret mounts, check host ports, hand the result to the
//! runtime. Nothing is retried.

mod mount;

pub use mount::check_host_path;

use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, StackError};
use crate::manifest::{
    resolve_host_path, Manifest, PortMapping, Protocol, ServiceDescriptor, TemplateContext,
};
use crate::network::NetworkFabric;
use crate::runtime::{LaunchSpec, MountSpec, RuntimeHandle, ServiceRuntime};

/// Label keys attached to every launched service.
pub const LABEL_PROJECT: &str = "io.stackgate.project";
pub const LABEL_SERVICE: &str = "io.stackgate.service";
pub const LABEL_RUN: &str = "io.stackgate.run";

/// Template lookups at launch time: host environment plus the fabric.
struct LaunchContext<'a> {
    fabric: &'a NetworkFabric,
}

impl TemplateContext for LaunchContext<'_> {
    fn host_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn service_address(&self, service: &str) -> Result<String> {
        self.fabric.address_of(service).map(|ep| ep.host)
    }
}

pub struct Launcher {
    manifest: Arc<Manifest>,
    runtime: Arc<dyn ServiceRuntime>,
    fabric: Arc<NetworkFabric>,
    check_ports: bool,
    run_id: String,
}

impl Launcher {
    pub fn new(
        manifest: Arc<Manifest>,
        runtime: Arc<dyn ServiceRuntime>,
        fabric: Arc<NetworkFabric>,
    ) -> Self {
        Self {
            manifest,
            runtime,
            fabric,
            check_ports: true,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Skip the host port probe (the runtime still reports conflicts).
    pub fn with_port_checks(mut self, enabled: bool) -> Self {
        self.check_ports = enabled;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Resolve and check everything needed to start `descriptor`.
    pub fn prepare(&self, descriptor: &ServiceDescriptor) -> Result<LaunchSpec> {
        let name = descriptor.name.as_str();
        let ctx = LaunchContext {
            fabric: &self.fabric,
        };

        let mut env = Vec::with_capacity(descriptor.environment.len());
        for (key, template) in &descriptor.environment {
            let value = template.resolve(&ctx).map_err(|e| {
                StackError::launch(name, format!("environment '{}': {}", key, reason_of(&e)))
            })?;
            env.push((key.clone(), value));
        }

        let mut mounts = Vec::with_capacity(descriptor.secret_mounts.len());
        for mount in &descriptor.secret_mounts {
            let raw = mount.host_path.resolve(&ctx).map_err(|e| {
                StackError::launch(
                    name,
                    format!("mount '{}': {}", mount.container_path, reason_of(&e)),
                )
            })?;
            let host_path = check_host_path(
                &resolve_host_path(self.manifest.source_dir(), &raw),
                mount.read_only,
            )
            .map_err(|reason| StackError::launch(name, reason))?;
            mounts.push(MountSpec {
                host_path,
                container_path: mount.container_path.clone(),
                read_only: mount.read_only,
            });
        }

        if self.check_ports {
            for port in &descriptor.published_ports {
                check_port_free(port).map_err(|reason| StackError::launch(name, reason))?;
            }
        }

        let mut labels = descriptor.labels.clone();
        labels.push((LABEL_PROJECT.to_string(), self.manifest.project().to_string()));
        labels.push((LABEL_SERVICE.to_string(), name.to_string()));
        labels.push((LABEL_RUN.to_string(), self.run_id.clone()));

        let mut spec = LaunchSpec::new(
            name,
            &self.manifest.container_name(name),
            &descriptor
                .artifact
                .image_for(self.manifest.project(), name),
        );
        spec.command = descriptor.command.clone();
        spec.env = env;
        spec.mounts = mounts;
        spec.ports = descriptor.published_ports.clone();
        spec.network = self.fabric.name().to_string();
        spec.aliases = vec![name.to_string()];
        spec.labels = labels;
        spec.working_dir = self.manifest.source_dir().to_path_buf();
        Ok(spec)
    }

    /// Prepare and start `descriptor` through the runtime.
    pub async fn start(&self, descriptor: &ServiceDescriptor) -> Result<RuntimeHandle> {
        let spec = self.prepare(descriptor)?;
        debug!(service = %spec.service, image = %spec.image, "Launching");
        let handle = self
            .runtime
            .start(&spec)
            .await
            .map_err(|e| StackError::launch(&descriptor.name, e.to_string()))?;
        info!(
            service = %descriptor.name,
            runtime = self.runtime.name(),
            id = %handle.id,
            "Service launched"
        );
        Ok(handle)
    }
}

/// Strip the variant prefix so launch errors read as one sentence.
fn reason_of(err: &StackError) -> String {
    match err {
        StackError::Config(msg) | StackError::UnresolvedAddress(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Bind the host port briefly to see whether something else holds it.
fn check_port_free(port: &PortMapping) -> std::result::Result<(), String> {
    let ip = port.host_ip.as_deref().unwrap_or("0.0.0.0");
    let bound = match port.protocol {
        Protocol::Tcp => TcpListener::bind((ip, port.host_port)).map(drop),
        Protocol::Udp => UdpSocket::bind((ip, port.host_port)).map(drop),
    };
    bound.map_err(|e| {
        format!(
            "host port {}/{} is not available: {}",
            port.host_port,
            port.protocol.as_str(),
            e
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ArtifactRef, LoadOptions};
    use crate::network::AddressMode;
    use crate::runtime::mock::MockRuntime;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup(src: &str, dir: &Path) -> (Launcher, Arc<Manifest>, Arc<NetworkFabric>, Arc<MockRuntime>) {
        let manifest =
            Arc::new(Manifest::from_yaml_str(src, dir, &LoadOptions::default()).unwrap());
        let runtime = Arc::new(MockRuntime::new());
        let fabric = Arc::new(NetworkFabric::new(
            &manifest.network_name(),
            AddressMode::ServiceName,
        ));
        let launcher = Launcher::new(manifest.clone(), runtime.clone(), fabric.clone());
        (launcher, manifest, fabric, runtime)
    }

    #[tokio::test]
    async fn test_prepare_resolves_everything() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("sa.json"), "{}").unwrap();
        std::env::set_var("STACKGATE_LAUNCH_TEST_PROJECT", "proj-42");
        let src = r#"
name: analytics
services:
  cache:
    image: redis:7
  backend:
    build: ./backend
    environment:
      PROJECT: ${STACKGATE_LAUNCH_TEST_PROJECT}
      LOCATION: ${STACKGATE_LAUNCH_TEST_LOCATION_UNSET:-US}
      REDIS_URL: redis://${service:cache}:6379
    volumes:
      - ./sa.json:/app/credentials.json:ro
    labels:
      tier: api
    depends_on: [cache]
"#;
        let (launcher, manifest, fabric, runtime) = setup(src, dir.path());
        fabric.register(manifest.get("cache").unwrap());

        let handle = launcher.start(manifest.get("backend").unwrap()).await.unwrap();
        assert_eq!(handle.service, "backend");

        let started = runtime.started.lock().unwrap();
        let spec = &started[0];
        assert_eq!(spec.instance_name, "analytics-backend");
        assert_eq!(spec.image, "analytics-backend:latest");
        assert_eq!(spec.network, "analytics_default");
        assert_eq!(spec.aliases, vec!["backend"]);
        assert_eq!(
            spec.env,
            vec![
                ("PROJECT".to_string(), "proj-42".to_string()),
                ("LOCATION".to_string(), "US".to_string()),
                ("REDIS_URL".to_string(), "redis://cache:6379".to_string()),
            ]
        );
        assert_eq!(
            spec.mounts[0].host_path,
            dir.path().join("sa.json").canonicalize().unwrap()
        );
        assert!(spec.labels.contains(&("tier".to_string(), "api".to_string())));
        assert!(spec
            .labels
            .contains(&(LABEL_RUN.to_string(), launcher.run_id().to_string())));
    }

    #[test]
    fn test_missing_host_variable_names_it() {
        let dir = TempDir::new().unwrap();
        let src = "services:\n  backend:\n    image: x\n    environment:\n      P: ${STACKGATE_LAUNCH_TEST_SURELY_UNSET}\n";
        let (launcher, manifest, _, _) = setup(src, dir.path());
        let err = launcher.prepare(manifest.get("backend").unwrap()).unwrap_err();
        assert!(matches!(err, StackError::Launch { .. }));
        let msg = err.to_string();
        assert!(msg.contains("STACKGATE_LAUNCH_TEST_SURELY_UNSET"));
        assert!(msg.contains("environment 'P'"));
    }

    #[test]
    fn test_unregistered_service_reference_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let src = "services:\n  a:\n    image: x\n    environment:\n      B: ${service:b}\n  b:\n    image: y\n";
        let (launcher, manifest, _, _) = setup(src, dir.path());
        let err = launcher.prepare(manifest.get("a").unwrap()).unwrap_err();
        assert!(matches!(err, StackError::Launch { .. }));
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_missing_secret_file() {
        let dir = TempDir::new().unwrap();
        let src = "services:\n  a:\n    image: x\n    volumes:\n      - ./missing.json:/run/secret.json:ro\n";
        let (launcher, manifest, _, _) = setup(src, dir.path());
        let err = launcher.prepare(manifest.get("a").unwrap()).unwrap_err();
        assert!(err.to_string().contains("missing.json"));
    }

    #[test]
    fn test_port_in_use() {
        let holder = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let dir = TempDir::new().unwrap();
        let src = format!("services:\n  a:\n    image: x\n    ports: [\"{}:80\"]\n", port);
        let (launcher, manifest, _, _) = setup(&src, dir.path());
        let err = launcher.prepare(manifest.get("a").unwrap()).unwrap_err();
        assert!(err.to_string().contains(&format!("host port {}/tcp", port)));

        let lenient = Launcher::new(
            manifest.clone(),
            Arc::new(MockRuntime::new()),
            Arc::new(NetworkFabric::new("n", AddressMode::ServiceName)),
        )
        .with_port_checks(false);
        assert!(lenient.prepare(manifest.get("a").unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_runtime_failure_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let manifest = Arc::new(
            Manifest::from_services(
                "t",
                vec![ServiceDescriptor::new(
                    "a",
                    ArtifactRef::Image {
                        reference: "x".into(),
                    },
                )],
                dir.path(),
            )
            .unwrap(),
        );
        let launcher = Launcher::new(
            manifest.clone(),
            Arc::new(MockRuntime::failing(&["a"])),
            Arc::new(NetworkFabric::new("n", AddressMode::ServiceName)),
        );
        let err = launcher.start(manifest.get("a").unwrap()).await.unwrap_err();
        assert!(matches!(err, StackError::Launch { ref service, .. } if service == "a"));
    }
}
