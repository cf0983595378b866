//! Manifest core types.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use super::template::Template;

/// What the runtime should run for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactRef {
    /// A pullable image reference (e.g. "redis:7-alpine").
    Image { reference: String },
    /// A build context. Building is external; the runtime expects the
    /// resulting image under [`ArtifactRef::image_for`].
    Build {
        context: String,
        dockerfile: Option<String>,
    },
}

impl ArtifactRef {
    /// Image reference the runtime should start for `service` in `project`.
    pub fn image_for(&self, project: &str, service: &str) -> String {
        match self {
            ArtifactRef::Image { reference } => reference.clone(),
            ArtifactRef::Build { .. } => format!("{}-{}:latest", project, service),
        }
    }
}

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A published port (host side to container side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    /// Optional host interface ("127.0.0.1"); all interfaces when absent.
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    /// `[ip:]host:container[/proto]`, as docker's `-p` expects it.
    pub fn to_publish_arg(&self) -> String {
        let mut s = match &self.host_ip {
            Some(ip) => format!("{}:{}:{}", ip, self.host_port, self.container_port),
            None => format!("{}:{}", self.host_port, self.container_port),
        };
        if self.protocol == Protocol::Udp {
            s.push_str("/udp");
        }
        s
    }
}

/// A file or directory made visible inside the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMount {
    /// Host side; may reference host variables. Checked at launch.
    pub host_path: Template,
    /// Absolute path inside the service.
    pub container_path: String,
    pub read_only: bool,
}

/// The probe a health check runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeKind {
    /// Exec an argv inside the service (`["CMD", ...]`).
    Command { argv: Vec<String> },
    /// Run a script through `sh -c` inside the service (`["CMD-SHELL", ...]`).
    Shell { script: String },
    /// HTTP GET from the host; any 2xx passes.
    Http { url: String },
    /// TCP connect from the host.
    Tcp { host: String, port: u16 },
}

impl ProbeKind {
    /// argv to hand to the runtime for exec-style probes.
    pub fn exec_argv(&self) -> Option<Vec<String>> {
        match self {
            ProbeKind::Command { argv } => Some(argv.clone()),
            ProbeKind::Shell { script } => Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                script.clone(),
            ]),
            ProbeKind::Http { .. } | ProbeKind::Tcp { .. } => None,
        }
    }
}

/// Readiness check configuration for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckSpec {
    pub probe: ProbeKind,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

/// Static definition of one service. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub artifact: ArtifactRef,
    /// argv override; required for the native runtime.
    pub command: Option<Vec<String>>,
    pub published_ports: Vec<PortMapping>,
    /// Declaration order is kept so launches are reproducible.
    pub environment: Vec<(String, Template)>,
    pub secret_mounts: Vec<SecretMount>,
    /// Services that must be Healthy before this one launches.
    pub dependencies: Vec<String>,
    pub health_check: Option<HealthCheckSpec>,
    pub stop_timeout: Option<Duration>,
    pub labels: Vec<(String, String)>,
}

impl ServiceDescriptor {
    /// A bare descriptor, mostly useful for building manifests in code.
    pub fn new(name: &str, artifact: ArtifactRef) -> Self {
        Self {
            name: name.to_string(),
            artifact,
            command: None,
            published_ports: Vec::new(),
            environment: Vec::new(),
            secret_mounts: Vec::new(),
            dependencies: Vec::new(),
            health_check: None,
            stop_timeout: None,
            labels: Vec::new(),
        }
    }

    pub fn depends_on(&self, other: &str) -> bool {
        self.dependencies.iter().any(|d| d == other)
    }
}

/// Where relative host paths are resolved from.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    pub path: Option<PathBuf>,
    pub base_dir: PathBuf,
}
