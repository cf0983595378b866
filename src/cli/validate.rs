//! `stackgate validate` and `stackgate plan`: load-only commands.

use anyhow::Result;
use std::path::PathBuf;
use std::process::ExitCode;

use stackgate::manifest::{Manifest, ProbeKind};
use stackgate::utils::duration::format_duration;

use super::{load_config, load_manifest, resolve_manifest_path};

/// Check a manifest and print the launch order.
pub(crate) fn cmd_validate(file: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config()?;
    let path = resolve_manifest_path(file)?;
    let manifest = load_manifest(&path, &config, None)?;

    println!("Manifest: {}", path.display());
    println!("[OK] {} service(s), project '{}'", manifest.len(), manifest.project());
    println!();
    println!("Launch order:");
    for (i, svc) in manifest.services().iter().enumerate() {
        println!("  {}. {}", i + 1, svc.name);
    }
    Ok(ExitCode::SUCCESS)
}

/// Print launch waves and the gate in front of every service.
pub(crate) fn cmd_plan(file: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config()?;
    let path = resolve_manifest_path(file)?;
    let manifest = load_manifest(&path, &config, None)?;
    print!("{}", render_plan(&manifest));
    Ok(ExitCode::SUCCESS)
}

fn render_plan(manifest: &Manifest) -> String {
    let mut out = format!(
        "Project '{}' on network '{}'\n",
        manifest.project(),
        manifest.network_name()
    );
    for (i, wave) in manifest.launch_waves().iter().enumerate() {
        out.push_str(&format!("\nWave {}:\n", i + 1));
        for name in wave {
            let Some(svc) = manifest.get(name) else {
                continue;
            };
            let gate = if svc.dependencies.is_empty() {
                "starts immediately".to_string()
            } else {
                format!("waits for {} healthy", svc.dependencies.join(", "))
            };
            let probe = match &svc.health_check {
                None => "no health check".to_string(),
                Some(hc) => format!(
                    "{} every {}, {} retries",
                    describe_probe(&hc.probe),
                    format_duration(hc.interval),
                    hc.retries
                ),
            };
            out.push_str(&format!("  {:<16} {}; {}\n", svc.name, gate, probe));
        }
    }
    out
}

fn describe_probe(probe: &ProbeKind) -> String {
    match probe {
        ProbeKind::Command { argv } => format!("exec `{}`", argv.join(" ")),
        ProbeKind::Shell { script } => format!("shell `{}`", script),
        ProbeKind::Http { url } => format!("GET {}", url),
        ProbeKind::Tcp { host, port } => format!("tcp {}:{}", host, port),
    }
}
