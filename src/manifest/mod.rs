//! Stack manifest: loading, structural validation and the immutable
//! descriptor store shared by every other component.
//!
//! A [`Manifest`] is fully validated on construction. Services are kept in a
//! deterministic topological order (dependencies first, ties broken by
//! declaration order), so iterating `services()` is a valid launch order.

pub mod graph;
mod parse;
pub mod template;
pub mod types;

pub use template::{Fallback, ProcessEnv, Segment, Template, TemplateContext};
pub use types::*;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::HealthDefaults;
use crate::error::{Result, StackError};

/// File names tried, in order, when no manifest path is given.
pub const DEFAULT_MANIFEST_NAMES: &[&str] =
    &["stackgate.yaml", "compose.yaml", "docker-compose.yml"];

/// Project name used when neither the manifest nor its directory gives one.
pub const DEFAULT_PROJECT: &str = "stackgate";

/// Knobs for [`Manifest::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Defaults for health check fields the manifest leaves out
    pub health: HealthDefaults,
    /// Dotenv file to merge into the process environment before parsing.
    /// When unset, `.env` next to the manifest is used if it exists.
    pub env_file: Option<PathBuf>,
    /// Overrides the `name:` key and the directory-derived project name
    pub project: Option<String>,
}

/// The validated, immutable stack definition.
#[derive(Debug)]
pub struct Manifest {
    project: String,
    network: Option<String>,
    services: Vec<Arc<ServiceDescriptor>>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    source: ManifestSource,
}

impl Manifest {
    /// Locate a manifest in `dir` using [`DEFAULT_MANIFEST_NAMES`].
    pub fn discover(dir: &Path) -> Option<PathBuf> {
        DEFAULT_MANIFEST_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    }

    /// Load and validate the manifest at `path`.
    ///
    /// The dotenv file (explicit or `.env` beside the manifest) is merged
    /// into the process environment first. Existing variables win.
    pub fn load(path: &Path, opts: &LoadOptions) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        load_env_file(&base_dir, opts.env_file.as_deref())?;

        let src = std::fs::read_to_string(path).map_err(|e| {
            StackError::Config(format!("cannot read manifest {}: {}", path.display(), e))
        })?;

        let source = ManifestSource {
            path: Some(path.to_path_buf()),
            base_dir,
        };
        let manifest = Self::build(&src, source, opts)?;
        info!(
            project = %manifest.project,
            services = manifest.len(),
            path = %path.display(),
            "Manifest loaded"
        );
        Ok(manifest)
    }

    /// Validate a manifest held in memory. Relative host paths resolve
    /// against `base_dir`. No dotenv file is read.
    pub fn from_yaml_str(src: &str, base_dir: &Path, opts: &LoadOptions) -> Result<Self> {
        let source = ManifestSource {
            path: None,
            base_dir: base_dir.to_path_buf(),
        };
        Self::build(src, source, opts)
    }

    /// Build a manifest from descriptors constructed in code. The same name,
    /// host port, reference and cycle checks apply.
    pub fn from_services(
        project: &str,
        services: Vec<ServiceDescriptor>,
        base_dir: &Path,
    ) -> Result<Self> {
        let source = ManifestSource {
            path: None,
            base_dir: base_dir.to_path_buf(),
        };
        Self::assemble(project.to_string(), None, services, source)
    }

    fn build(src: &str, source: ManifestSource, opts: &LoadOptions) -> Result<Self> {
        let parsed = parse::parse_document(src, &opts.health)?;
        let project = opts
            .project
            .clone()
            .or(parsed.name)
            .or_else(|| project_from_dir(&source.base_dir))
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        Self::assemble(project, parsed.network, parsed.services, source)
    }

    fn assemble(
        project: String,
        network: Option<String>,
        services: Vec<ServiceDescriptor>,
        source: ManifestSource,
    ) -> Result<Self> {
        if services.is_empty() {
            return Err(StackError::Config(
                "manifest defines no services".to_string(),
            ));
        }
        parse::check_service_set(&services)?;
        graph::check_references(&services)?;
        let order = graph::topological_order(&services)?;

        let mut slots: Vec<Option<ServiceDescriptor>> = services.into_iter().map(Some).collect();
        let services: Vec<Arc<ServiceDescriptor>> = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .map(Arc::new)
            .collect();

        let index = services
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for svc in &services {
            for dep in &svc.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(svc.name.clone());
            }
        }

        debug!(
            order = ?services.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "Launch order resolved"
        );

        Ok(Self {
            project,
            network,
            services,
            index,
            dependents,
            source,
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Network the stack runs on: the first declared network, else
    /// `<project>_default`.
    pub fn network_name(&self) -> String {
        self.network
            .clone()
            .unwrap_or_else(|| format!("{}_default", self.project))
    }

    /// Services in launch order.
    pub fn services(&self) -> &[Arc<ServiceDescriptor>] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.index.get(name).map(|&i| &self.services[i])
    }

    /// Services that directly depend on `name` (reverse edges), in launch order.
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Services grouped by dependency depth.
    pub fn launch_waves(&self) -> Vec<Vec<String>> {
        let ordered: Vec<ServiceDescriptor> =
            self.services.iter().map(|s| s.as_ref().clone()).collect();
        graph::launch_waves(&ordered)
    }

    pub fn source_dir(&self) -> &Path {
        &self.source.base_dir
    }

    /// Resolve a (template-expanded) host path against the manifest
    /// directory, expanding a leading `~`.
    pub fn resolve_host_path(&self, raw: &str) -> PathBuf {
        resolve_host_path(&self.source.base_dir, raw)
    }

    /// Container name used for `service`.
    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{}", self.project, service)
    }
}

/// Join `raw` onto `base_dir` unless it is absolute or home-relative.
pub fn resolve_host_path(base_dir: &Path, raw: &str) -> PathBuf {
    if raw.starts_with('~') {
        return crate::config::expand_home(raw);
    }
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn project_from_dir(dir: &Path) -> Option<String> {
    let dir = std::fs::canonicalize(dir).ok()?;
    let name = dir.file_name()?.to_string_lossy().to_lowercase();
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn load_env_file(base_dir: &Path, explicit: Option<&Path>) -> Result<()> {
    match explicit {
        Some(path) => {
            dotenvy::from_path(path).map_err(|e| {
                StackError::Config(format!("cannot load env file {}: {}", path.display(), e))
            })?;
            debug!(path = %path.display(), "Loaded env file");
        }
        None => {
            let default = base_dir.join(".env");
            if default.is_file() {
                dotenvy::from_path(&default).map_err(|e| {
                    StackError::Config(format!(
                        "cannot load env file {}: {}",
                        default.display(),
                        e
                    ))
                })?;
                debug!(path = %default.display(), "Loaded env file");
            }
        }
    }
    Ok(())
}
