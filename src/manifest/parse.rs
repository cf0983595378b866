//! YAML manifest parsing (a compose-style subset) into service descriptors.
//!
//! Only structural checks happen here. Host paths are not touched and host
//! variables are not read; both wait until launch.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use crate::config::HealthDefaults;
use crate::error::{Result, StackError};
use crate::utils::duration::parse_duration;

use super::template::Template;
use super::types::{
    ArtifactRef, HealthCheckSpec, PortMapping, ProbeKind, Protocol, SecretMount,
    ServiceDescriptor,
};

static SERVICE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").unwrap());

// ---------------------------------------------------------------------------
// Raw document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawManifest {
    pub name: Option<String>,
    /// Accepted for compose compatibility; ignored.
    #[serde(default)]
    #[allow(dead_code)]
    pub version: Option<serde_yaml::Value>,
    #[serde(default)]
    pub networks: Option<serde_yaml::Mapping>,
    #[serde(default)]
    pub services: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    image: Option<String>,
    build: Option<RawBuild>,
    command: Option<StringOrList>,
    #[serde(default)]
    ports: Vec<RawPort>,
    environment: Option<RawEnvironment>,
    #[serde(default)]
    volumes: Vec<RawVolume>,
    depends_on: Option<RawDependsOn>,
    healthcheck: Option<RawHealthCheck>,
    stop_grace_period: Option<RawDuration>,
    labels: Option<RawLabels>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBuild {
    Context(String),
    Detailed {
        context: String,
        dockerfile: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    String(String),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u16),
    Short(String),
    Long {
        target: u16,
        published: Option<RawPortNumber>,
        host_ip: Option<String>,
        protocol: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPortNumber {
    Number(u16),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEnvironment {
    Map(serde_yaml::Mapping),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVolume {
    Short(String),
    Long {
        #[serde(rename = "type")]
        kind: Option<String>,
        source: String,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, RawDependency>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDependency {
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHealthCheck {
    test: Option<StringOrList>,
    http: Option<String>,
    tcp: Option<RawPortNumber>,
    interval: Option<RawDuration>,
    timeout: Option<RawDuration>,
    retries: Option<u32>,
    start_period: Option<RawDuration>,
    #[serde(default)]
    disable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLabels {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Parsed top-level document, services in declaration order.
pub(crate) struct ParsedManifest {
    pub name: Option<String>,
    pub network: Option<String>,
    pub services: Vec<ServiceDescriptor>,
}

pub(crate) fn parse_document(src: &str, health: &HealthDefaults) -> Result<ParsedManifest> {
    let raw: RawManifest = serde_yaml::from_str(src)
        .map_err(|e| StackError::Config(format!("invalid manifest: {}", e)))?;

    if raw.services.is_empty() {
        return Err(StackError::Config(
            "manifest defines no services".to_string(),
        ));
    }

    let network = match &raw.networks {
        Some(networks) => networks
            .keys()
            .next()
            .map(|k| scalar_to_string(k, "networks"))
            .transpose()?,
        None => None,
    };

    let mut services = Vec::with_capacity(raw.services.len());
    for (key, value) in raw.services {
        let name = scalar_to_string(&key, "services")?;
        check_service_name(&name)?;
        let raw_service: RawService = serde_yaml::from_value(value)
            .map_err(|e| StackError::Config(format!("service '{}': {}", name, e)))?;
        services.push(convert_service(&name, raw_service, health)?);
    }

    Ok(ParsedManifest {
        name: raw.name,
        network,
        services,
    })
}

fn convert_service(name: &str, raw: RawService, health: &HealthDefaults) -> Result<ServiceDescriptor> {
    let ctx = |msg: String| StackError::Config(format!("service '{}': {}", name, msg));

    let artifact = match (raw.image, raw.build) {
        (Some(reference), None) => {
            if reference.trim().is_empty() {
                return Err(ctx("image must not be empty".into()));
            }
            ArtifactRef::Image { reference }
        }
        (None, Some(RawBuild::Context(context))) => ArtifactRef::Build {
            context,
            dockerfile: None,
        },
        (None, Some(RawBuild::Detailed {
            context,
            dockerfile,
        })) => ArtifactRef::Build {
            context,
            dockerfile,
        },
        (Some(_), Some(_)) => return Err(ctx("set either 'image' or 'build', not both".into())),
        (None, None) => return Err(ctx("one of 'image' or 'build' is required".into())),
    };

    let command = match raw.command {
        None => None,
        Some(StringOrList::List(argv)) if argv.is_empty() => {
            return Err(ctx("command must not be empty".into()))
        }
        Some(StringOrList::List(argv)) => Some(argv),
        Some(StringOrList::String(s)) => {
            let argv: Vec<String> = s.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                return Err(ctx("command must not be empty".into()));
            }
            Some(argv)
        }
    };

    let published_ports = raw
        .ports
        .into_iter()
        .map(parse_port)
        .collect::<std::result::Result<Vec<_>, String>>()
        .map_err(ctx)?;

    let environment = parse_environment(raw.environment).map_err(ctx)?;

    let secret_mounts = raw
        .volumes
        .into_iter()
        .map(parse_volume)
        .collect::<std::result::Result<Vec<_>, String>>()
        .map_err(ctx)?;

    let dependencies = parse_depends_on(raw.depends_on).map_err(ctx)?;

    let health_check = match raw.healthcheck {
        Some(hc) => parse_health_check(hc, health).map_err(ctx)?,
        None => None,
    };

    let stop_timeout = raw
        .stop_grace_period
        .map(to_duration)
        .transpose()
        .map_err(ctx)?;

    let labels = match raw.labels {
        None => Vec::new(),
        Some(RawLabels::Map(map)) => map.into_iter().collect(),
        Some(RawLabels::List(list)) => list
            .into_iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry, String::new()),
            })
            .collect(),
    };

    Ok(ServiceDescriptor {
        name: name.to_string(),
        artifact,
        command,
        published_ports,
        environment,
        secret_mounts,
        dependencies,
        health_check,
        stop_timeout,
        labels,
    })
}

fn scalar_to_string(value: &serde_yaml::Value, section: &str) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(StackError::Config(format!(
            "{}: expected a scalar key, got {:?}",
            section, other
        ))),
    }
}

fn parse_port(raw: RawPort) -> std::result::Result<PortMapping, String> {
    match raw {
        RawPort::Number(port) => Err(format!(
            "port '{}' has no host side; use 'HOST:{}'",
            port, port
        )),
        RawPort::Short(spec) => parse_port_spec(&spec),
        RawPort::Long {
            target,
            published,
            host_ip,
            protocol,
        } => {
            let host_port = match published {
                Some(RawPortNumber::Number(p)) => p,
                Some(RawPortNumber::Text(t)) => parse_port_number(&t)?,
                None => return Err(format!("port {} has no 'published' host port", target)),
            };
            let protocol = parse_protocol(protocol.as_deref().unwrap_or("tcp"))?;
            build_port(host_ip, host_port, target, protocol)
        }
    }
}

/// `[ip:]host:container[/proto]`
fn parse_port_spec(spec: &str) -> std::result::Result<PortMapping, String> {
    let (body, protocol) = match spec.split_once('/') {
        Some((body, proto)) => (body, parse_protocol(proto)?),
        None => (spec, Protocol::Tcp),
    };
    let parts: Vec<&str> = body.split(':').collect();
    match parts.as_slice() {
        [host, container] => build_port(
            None,
            parse_port_number(host)?,
            parse_port_number(container)?,
            protocol,
        ),
        [ip, host, container] => build_port(
            Some(ip.to_string()),
            parse_port_number(host)?,
            parse_port_number(container)?,
            protocol,
        ),
        [single] => Err(format!(
            "port '{}' has no host side; use 'HOST:{}'",
            single, single
        )),
        _ => Err(format!(
            "invalid port '{}'; expected 'HOST:CONTAINER' or 'IP:HOST:CONTAINER'",
            spec
        )),
    }
}

fn parse_port_number(s: &str) -> std::result::Result<u16, String> {
    if s.contains('-') {
        return Err(format!("port ranges are not supported ('{}')", s));
    }
    s.trim()
        .parse::<u16>()
        .map_err(|_| format!("invalid port number '{}'", s))
}

fn parse_protocol(s: &str) -> std::result::Result<Protocol, String> {
    match s.to_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => Err(format!("unsupported protocol '{}'", other)),
    }
}

fn build_port(
    host_ip: Option<String>,
    host_port: u16,
    container_port: u16,
    protocol: Protocol,
) -> std::result::Result<PortMapping, String> {
    if host_port == 0 || container_port == 0 {
        return Err("port 0 cannot be published".to_string());
    }
    Ok(PortMapping {
        host_ip,
        host_port,
        container_port,
        protocol,
    })
}

fn parse_environment(
    raw: Option<RawEnvironment>,
) -> std::result::Result<Vec<(String, Template)>, String> {
    let pairs: Vec<(String, Option<String>)> = match raw {
        None => return Ok(Vec::new()),
        Some(RawEnvironment::List(list)) => list
            .into_iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (entry, None),
            })
            .collect(),
        Some(RawEnvironment::Map(map)) => {
            let mut pairs = Vec::with_capacity(map.len());
            for (k, v) in map {
                let key = scalar_to_string(&k, "environment").map_err(|e| e.to_string())?;
                let value = match v {
                    serde_yaml::Value::Null => None,
                    other => Some(scalar_to_string(&other, "environment").map_err(|_| {
                        format!("environment '{}' must be a scalar value", key)
                    })?),
                };
                pairs.push((key, value));
            }
            pairs
        }
    };

    let mut seen: HashMap<String, ()> = HashMap::new();
    let mut environment = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(format!("invalid environment variable name '{}'", key));
        }
        if seen.insert(key.clone(), ()).is_some() {
            return Err(format!("environment variable '{}' is set twice", key));
        }
        let template = match value {
            Some(v) => Template::parse(&v)
                .map_err(|e| format!("environment '{}': {}", key, e))?,
            // A bare name passes the host value through; unset means empty.
            None => Template::parse(&format!("${{{}-}}", key))
                .map_err(|e| format!("environment '{}': {}", key, e))?,
        };
        environment.push((key, template));
    }
    Ok(environment)
}

/// Split on ':' outside of `${...}` references.
fn split_mount_spec(spec: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let bytes = spec.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' if i > 0 && bytes[i - 1] == b'$' => depth += 1,
            b'}' if depth > 0 => depth -= 1,
            b':' if depth == 0 => {
                parts.push(&spec[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&spec[start..]);
    parts
}

fn parse_volume(raw: RawVolume) -> std::result::Result<SecretMount, String> {
    let (host, container, read_only) = match raw {
        RawVolume::Short(spec) => match split_mount_spec(&spec).as_slice() {
            [host, container] => (host.to_string(), container.to_string(), false),
            [host, container, "ro"] => (host.to_string(), container.to_string(), true),
            [host, container, "rw"] => (host.to_string(), container.to_string(), false),
            [_, _, mode] => {
                return Err(format!(
                    "invalid mount mode '{}'; only 'ro' and 'rw' are supported",
                    mode
                ))
            }
            _ => {
                return Err(format!(
                    "invalid mount '{}'; expected 'host:container' or 'host:container:ro'",
                    spec
                ))
            }
        },
        RawVolume::Long {
            kind,
            source,
            target,
            read_only,
        } => {
            if let Some(kind) = kind.filter(|k| k != "bind") {
                return Err(format!("mount type '{}' is not supported; use 'bind'", kind));
            }
            (source, target, read_only)
        }
    };

    if host.is_empty() {
        return Err("mount host path must not be empty".to_string());
    }
    if !is_host_path(&host) {
        return Err(format!(
            "named volume '{}' is not supported; mount a host path instead",
            host
        ));
    }
    if container.is_empty() || !container.starts_with('/') || container.contains("..") {
        return Err(format!("invalid container mount path '{}'", container));
    }

    Ok(SecretMount {
        host_path: Template::parse(&host).map_err(|e| e.to_string())?,
        container_path: container,
        read_only,
    })
}

fn is_host_path(host: &str) -> bool {
    host.starts_with('/') || host.starts_with('.') || host.starts_with('~') || host.starts_with('$')
}

fn parse_depends_on(raw: Option<RawDependsOn>) -> std::result::Result<Vec<String>, String> {
    let names: Vec<String> = match raw {
        None => return Ok(Vec::new()),
        Some(RawDependsOn::List(list)) => list,
        Some(RawDependsOn::Map(map)) => {
            let mut names = Vec::with_capacity(map.len());
            for (name, dep) in map {
                match dep.condition.as_deref() {
                    None | Some("service_healthy") | Some("service_started") => {}
                    Some(other) => {
                        return Err(format!(
                            "depends_on '{}': unsupported condition '{}'",
                            name, other
                        ))
                    }
                }
                names.push(name);
            }
            names
        }
    };

    let mut unique: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !unique.contains(&name) {
            unique.push(name);
        }
    }
    Ok(unique)
}

fn to_duration(raw: RawDuration) -> std::result::Result<Duration, String> {
    match raw {
        RawDuration::Seconds(s) => Ok(Duration::from_secs(s)),
        RawDuration::Text(t) => parse_duration(&t).map_err(|e| e.to_string()),
    }
}

fn parse_health_check(
    raw: RawHealthCheck,
    defaults: &HealthDefaults,
) -> std::result::Result<Option<HealthCheckSpec>, String> {
    if raw.disable {
        return Ok(None);
    }

    let mut probes = Vec::new();
    if let Some(test) = raw.test {
        match test {
            StringOrList::String(script) => probes.push(ProbeKind::Shell { script }),
            StringOrList::List(list) => match list.split_first() {
                Some((kind, rest)) if kind == "NONE" => {
                    if !rest.is_empty() {
                        return Err("healthcheck test 'NONE' takes no arguments".into());
                    }
                    return Ok(None);
                }
                Some((kind, rest)) if kind == "CMD" && !rest.is_empty() => {
                    probes.push(ProbeKind::Command {
                        argv: rest.to_vec(),
                    })
                }
                Some((kind, rest)) if kind == "CMD-SHELL" && !rest.is_empty() => {
                    probes.push(ProbeKind::Shell {
                        script: rest.join(" "),
                    })
                }
                _ => {
                    return Err(
                        "healthcheck test must start with CMD, CMD-SHELL or NONE".to_string()
                    )
                }
            },
        }
    }
    if let Some(url) = raw.http {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("healthcheck http '{}' must be an http(s) URL", url));
        }
        probes.push(ProbeKind::Http { url });
    }
    if let Some(tcp) = raw.tcp {
        let (host, port) = match tcp {
            RawPortNumber::Number(p) => ("127.0.0.1".to_string(), p),
            RawPortNumber::Text(t) => match t.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), parse_port_number(port)?),
                None => ("127.0.0.1".to_string(), parse_port_number(&t)?),
            },
        };
        probes.push(ProbeKind::Tcp { host, port });
    }

    let probe = match probes.len() {
        0 => return Err("healthcheck needs one of 'test', 'http' or 'tcp'".to_string()),
        1 => probes.remove(0),
        _ => return Err("healthcheck takes only one of 'test', 'http' or 'tcp'".to_string()),
    };

    let interval = raw
        .interval
        .map(to_duration)
        .transpose()?
        .unwrap_or_else(|| defaults.interval());
    let timeout = raw
        .timeout
        .map(to_duration)
        .transpose()?
        .unwrap_or_else(|| defaults.timeout());
    let start_period = raw
        .start_period
        .map(to_duration)
        .transpose()?
        .unwrap_or_else(|| defaults.start_period());
    let retries = raw.retries.unwrap_or(defaults.retries);

    if interval.is_zero() || timeout.is_zero() {
        return Err("healthcheck interval and timeout must be greater than zero".into());
    }
    if retries == 0 {
        return Err("healthcheck retries must be at least 1".into());
    }

    Ok(Some(HealthCheckSpec {
        probe,
        interval,
        timeout,
        retries,
        start_period,
    }))
}

fn check_service_name(name: &str) -> Result<()> {
    if SERVICE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(StackError::Config(format!(
            "invalid service name '{}'; use letters, digits, '_', '.' or '-'",
            name
        )))
    }
}

/// Checks across the whole service set, whichever way it was built: name
/// syntax, name uniqueness and host port ownership.
pub(super) fn check_service_set(services: &[ServiceDescriptor]) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for svc in services {
        check_service_name(&svc.name)?;
        if !seen.insert(svc.name.as_str()) {
            return Err(StackError::Config(format!(
                "service '{}' is defined more than once",
                svc.name
            )));
        }
    }
    check_host_ports(services)
}

fn check_host_ports(services: &[ServiceDescriptor]) -> Result<()> {
    let mut owners: HashMap<(u16, Protocol), &str> = HashMap::new();
    for svc in services {
        for port in &svc.published_ports {
            if let Some(owner) = owners.insert((port.host_port, port.protocol), &svc.name) {
                return Err(StackError::Config(format!(
                    "host port {}/{} is published by both '{}' and '{}'",
                    port.host_port,
                    port.protocol.as_str(),
                    owner,
                    svc.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> HealthDefaults {
        HealthDefaults::default()
    }

    fn parse(src: &str) -> Result<ParsedManifest> {
        let parsed = parse_document(src, &defaults())?;
        check_service_set(&parsed.services)?;
        Ok(parsed)
    }

    fn parse_err(src: &str) -> String {
        match parse(src) {
            Ok(_) => panic!("expected parse failure"),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn test_three_tier_document() {
        let src = r#"
name: analytics
services:
  cache:
    image: redis:7-alpine
    ports: ["6379:6379"]
    healthcheck:
      test: ["CMD", "redis-cli", "ping"]
      interval: 2s
      timeout: 1s
      retries: 5
  backend:
    build: ./backend
    ports:
      - "8000:8000"
    environment:
      BIGQUERY_PROJECT_ID: ${BIGQUERY_PROJECT_ID}
      BIGQUERY_LOCATION: ${BIGQUERY_LOCATION:-US}
      REDIS_URL: redis://${service:cache}:6379
      WORKERS: 4
    volumes:
      - ${BIGQUERY_CREDENTIALS_PATH}:/app/credentials.json:ro
    depends_on:
      cache:
        condition: service_healthy
  frontend:
    build:
      context: ./frontend
      dockerfile: Dockerfile.prod
    ports: ["3000:3000"]
    depends_on: [backend]
"#;
        let parsed = parse(src).unwrap();
        assert_eq!(parsed.name.as_deref(), Some("analytics"));
        let names: Vec<_> = parsed.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cache", "backend", "frontend"]);

        let cache = &parsed.services[0];
        let hc = cache.health_check.as_ref().unwrap();
        assert_eq!(
            hc.probe,
            ProbeKind::Command {
                argv: vec!["redis-cli".into(), "ping".into()]
            }
        );
        assert_eq!(hc.interval, Duration::from_secs(2));
        assert_eq!(hc.retries, 5);

        let backend = &parsed.services[1];
        assert!(matches!(backend.artifact, ArtifactRef::Build { .. }));
        assert_eq!(backend.environment.len(), 4);
        assert_eq!(backend.environment[3].1.raw(), "4");
        assert_eq!(backend.secret_mounts.len(), 1);
        assert!(backend.secret_mounts[0].read_only);
        assert_eq!(backend.secret_mounts[0].container_path, "/app/credentials.json");
        assert_eq!(backend.dependencies, vec!["cache"]);
        assert!(backend.health_check.is_none());

        let frontend = &parsed.services[2];
        assert_eq!(
            frontend.artifact,
            ArtifactRef::Build {
                context: "./frontend".into(),
                dockerfile: Some("Dockerfile.prod".into())
            }
        );
    }

    #[test]
    fn test_no_services() {
        assert!(parse_err("services: {}\n").contains("no services"));
    }

    #[test]
    fn test_unknown_service_key_is_rejected() {
        let err = parse_err("services:\n  cache:\n    image: redis\n    restart: always\n");
        assert!(err.contains("service 'cache'"));
        assert!(err.contains("restart"));
    }

    #[test]
    fn test_image_and_build_exclusive() {
        assert!(parse_err("services:\n  a:\n    image: x\n    build: .\n").contains("not both"));
        assert!(parse_err("services:\n  a:\n    ports: []\n").contains("required"));
    }

    #[test]
    fn test_invalid_service_name() {
        assert!(parse_err("services:\n  'bad name':\n    image: x\n").contains("invalid service name"));
    }

    #[test]
    fn test_port_forms() {
        let src = r#"
services:
  a:
    image: x
    ports:
      - "127.0.0.1:8080:80"
      - "5353:53/udp"
      - target: 443
        published: 8443
"#;
        let parsed = parse(src).unwrap();
        let ports = &parsed.services[0].published_ports;
        assert_eq!(ports[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(ports[0].host_port, 8080);
        assert_eq!(ports[1].protocol, Protocol::Udp);
        assert_eq!(ports[2].container_port, 443);
        assert_eq!(ports[2].host_port, 8443);
    }

    #[test]
    fn test_port_errors() {
        assert!(parse_err("services:\n  a:\n    image: x\n    ports: [\"80\"]\n").contains("no host side"));
        assert!(parse_err("services:\n  a:\n    image: x\n    ports: [\"0:80\"]\n").contains("port 0"));
        assert!(parse_err("services:\n  a:\n    image: x\n    ports: [\"8000-8001:80\"]\n")
            .contains("ranges"));
    }

    #[test]
    fn test_duplicate_host_port_across_services() {
        let src = r#"
services:
  a:
    image: x
    ports: ["8000:80"]
  b:
    image: y
    ports: ["8000:8000"]
"#;
        let err = parse_err(src);
        assert!(err.contains("host port 8000/tcp"));
        assert!(err.contains("'a'") && err.contains("'b'"));
    }

    #[test]
    fn test_same_port_different_protocol_is_allowed() {
        let src = "services:\n  a:\n    image: x\n    ports: [\"53:53\"]\n  b:\n    image: y\n    ports: [\"53:53/udp\"]\n";
        assert!(parse(src).is_ok());
    }

    #[test]
    fn test_environment_list_form() {
        let src = "services:\n  a:\n    image: x\n    environment:\n      - MODE=prod\n      - HOME_DIR\n";
        let parsed = parse(src).unwrap();
        let env = &parsed.services[0].environment;
        assert_eq!(env[0].0, "MODE");
        assert_eq!(env[0].1.raw(), "prod");
        assert_eq!(env[1].1.host_vars().collect::<Vec<_>>(), vec!["HOME_DIR"]);
    }

    #[test]
    fn test_malformed_template_is_config_error() {
        let err = parse_err("services:\n  a:\n    image: x\n    environment:\n      KEY: ${BROKEN\n");
        assert!(err.contains("environment 'KEY'"));
    }

    #[test]
    fn test_volume_forms() {
        let src = r#"
services:
  a:
    image: x
    volumes:
      - ./config:/etc/app
      - ${CREDS:-./key.json}:/run/secrets/key.json:ro
      - type: bind
        source: /var/data
        target: /data
        read_only: true
"#;
        let parsed = parse(src).unwrap();
        let mounts = &parsed.services[0].secret_mounts;
        assert!(!mounts[0].read_only);
        assert_eq!(mounts[1].host_path.raw(), "${CREDS:-./key.json}");
        assert!(mounts[1].read_only);
        assert_eq!(mounts[2].container_path, "/data");
        assert!(mounts[2].read_only);
    }

    #[test]
    fn test_volume_errors() {
        assert!(parse_err("services:\n  a:\n    image: x\n    volumes: [\"data:/var/lib\"]\n")
            .contains("named volume"));
        assert!(parse_err("services:\n  a:\n    image: x\n    volumes: [\"./a:relative\"]\n")
            .contains("invalid container mount path"));
        assert!(parse_err("services:\n  a:\n    image: x\n    volumes: [\"./a:/b/../c\"]\n")
            .contains("invalid container mount path"));
        assert!(parse_err("services:\n  a:\n    image: x\n    volumes: [\"./a:/b:z\"]\n")
            .contains("invalid mount mode"));
    }

    #[test]
    fn test_split_mount_spec_respects_braces() {
        assert_eq!(
            split_mount_spec("${A:-/x}:/y:ro"),
            vec!["${A:-/x}", "/y", "ro"]
        );
        assert_eq!(split_mount_spec("/a:/b"), vec!["/a", "/b"]);
    }

    #[test]
    fn test_depends_on_conditions() {
        let ok = "services:\n  a:\n    image: x\n  b:\n    image: y\n    depends_on:\n      a:\n        condition: service_started\n";
        assert_eq!(parse(ok).unwrap().services[1].dependencies, vec!["a"]);

        let bad = "services:\n  a:\n    image: x\n  b:\n    image: y\n    depends_on:\n      a:\n        condition: service_completed_successfully\n";
        assert!(parse_err(bad).contains("unsupported condition"));
    }

    #[test]
    fn test_health_check_forms() {
        let src = r#"
services:
  shell:
    image: x
    healthcheck:
      test: curl -f http://localhost/ || exit 1
  cmdshell:
    image: x
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U postgres"]
  http:
    image: x
    healthcheck:
      http: http://localhost:8000/health
      start_period: 10s
  tcp:
    image: x
    healthcheck:
      tcp: 6379
  off:
    image: x
    healthcheck:
      test: ["NONE"]
"#;
        let parsed = parse(src).unwrap();
        let hc = |i: usize| parsed.services[i].health_check.clone();
        assert!(matches!(hc(0).unwrap().probe, ProbeKind::Shell { .. }));
        assert_eq!(
            hc(1).unwrap().probe,
            ProbeKind::Shell {
                script: "pg_isready -U postgres".into()
            }
        );
        let http = hc(2).unwrap();
        assert_eq!(http.start_period, Duration::from_secs(10));
        // defaults come from HealthDefaults
        assert_eq!(http.interval, Duration::from_secs(30));
        assert_eq!(http.retries, 3);
        assert_eq!(
            hc(3).unwrap().probe,
            ProbeKind::Tcp {
                host: "127.0.0.1".into(),
                port: 6379
            }
        );
        assert!(hc(4).is_none());
    }

    #[test]
    fn test_health_check_errors() {
        assert!(parse_err("services:\n  a:\n    image: x\n    healthcheck:\n      retries: 3\n")
            .contains("needs one of"));
        assert!(parse_err(
            "services:\n  a:\n    image: x\n    healthcheck:\n      tcp: 1\n      http: http://x\n"
        )
        .contains("only one of"));
        assert!(parse_err(
            "services:\n  a:\n    image: x\n    healthcheck:\n      tcp: 1\n      retries: 0\n"
        )
        .contains("at least 1"));
        assert!(parse_err(
            "services:\n  a:\n    image: x\n    healthcheck:\n      test: [\"PING\"]\n"
        )
        .contains("CMD"));
    }

    #[test]
    fn test_labels_and_grace_period() {
        let src = "services:\n  a:\n    image: x\n    stop_grace_period: 20s\n    labels:\n      - tier=cache\n";
        let parsed = parse(src).unwrap();
        let a = &parsed.services[0];
        assert_eq!(a.stop_timeout, Some(Duration::from_secs(20)));
        assert_eq!(a.labels, vec![("tier".to_string(), "cache".to_string())]);
    }

    #[test]
    fn test_first_network_is_used() {
        let src = "networks:\n  analytics-net: {}\nservices:\n  a:\n    image: x\n";
        assert_eq!(parse(src).unwrap().network.as_deref(), Some("analytics-net"));
    }
}
