//! Final state report: a text table for terminals, JSON for scripts.

use serde::Serialize;

use crate::instance::{ServiceState, TableState, Transition};
use crate::utils::string::prefix_chars;

/// Widest error shown in the text table.
const ERROR_COLUMN: usize = 80;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub health_check_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub dependencies: Vec<String>,
    pub ports: Vec<String>,
    pub history: Vec<Transition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project: String,
    pub network: String,
    pub runtime: String,
    pub run_id: String,
    pub services: Vec<ServiceStatus>,
}

impl StatusReport {
    pub fn from_table(
        table: &TableState,
        project: &str,
        network: &str,
        runtime: &str,
        run_id: &str,
    ) -> Self {
        let services = table
            .instances()
            .iter()
            .map(|inst| ServiceStatus {
                name: inst.name().to_string(),
                state: inst.state,
                health_check_attempts: inst.health_check_attempts,
                // Only failures explain themselves; start-period noise on a
                // healthy service is not an error.
                last_error: if inst.state == ServiceState::Failed {
                    inst.last_error.clone()
                } else {
                    None
                },
                dependencies: inst.descriptor.dependencies.clone(),
                ports: inst
                    .descriptor
                    .published_ports
                    .iter()
                    .map(|p| p.to_publish_arg())
                    .collect(),
                history: inst.history.clone(),
            })
            .collect();
        Self {
            project: project.to_string(),
            network: network.to_string(),
            runtime: runtime.to_string(),
            run_id: run_id.to_string(),
            services,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn any_failed(&self) -> bool {
        self.services
            .iter()
            .any(|s| s.state == ServiceState::Failed)
    }

    pub fn all_healthy(&self) -> bool {
        self.services
            .iter()
            .all(|s| s.state == ServiceState::Healthy)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Aligned table, one row per service in launch order.
    pub fn to_text(&self) -> String {
        let name_w = self
            .services
            .iter()
            .map(|s| s.name.len())
            .max()
            .unwrap_or(0)
            .max("SERVICE".len());
        let ports: Vec<String> = self.services.iter().map(|s| s.ports.join(",")).collect();
        let ports_w = ports
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max("PORTS".len());

        let mut out = format!(
            "Project {} on {} ({})\n\n",
            self.project, self.network, self.runtime
        );
        out.push_str(&format!(
            "{:<name_w$}  {:<8}  {:>6}  {:<ports_w$}  {}\n",
            "SERVICE", "STATE", "PROBES", "PORTS", "ERROR"
        ));
        for (svc, ports) in self.services.iter().zip(&ports) {
            let error = svc.last_error.as_deref().map(clip).unwrap_or_default();
            out.push_str(
                format!(
                    "{:<name_w$}  {:<8}  {:>6}  {:<ports_w$}  {}",
                    svc.name,
                    svc.state.as_str(),
                    svc.health_check_attempts,
                    ports,
                    error
                )
                .trim_end(),
            );
            out.push('\n');
        }
        out
    }
}

fn clip(s: &str) -> String {
    let mut out = prefix_chars(s, ERROR_COLUMN);
    if s.chars().count() > ERROR_COLUMN {
        out.push_str("...");
    }
    out
}
