//! `stackgate up`: run the startup, report, wait, shut down.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use stackgate::config::RuntimeType;
use stackgate::orchestrator::{Coordinator, CoordinatorOptions, StatusReport};
use stackgate::runtime::{available_runtimes, create_runtime};
use stackgate::{LifecycleEvent, ServiceState};

use super::{load_config, load_manifest, resolve_manifest_path, EXIT_SERVICE_FAILED};

/// Exit status after an interrupt during startup (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

pub struct UpArgs {
    pub file: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub runtime: Option<RuntimeType>,
    pub json: bool,
    pub exit_after_start: bool,
}

pub(crate) async fn cmd_up(args: UpArgs) -> Result<ExitCode> {
    let mut config = load_config()?;
    if let Some(runtime) = args.runtime {
        config.runtime.runtime_type = runtime;
    }

    let path = resolve_manifest_path(args.file)?;
    let manifest = Arc::new(load_manifest(&path, &config, args.env_file)?);

    let runtime = match create_runtime(&config.runtime).await {
        Ok(runtime) => runtime,
        Err(e) => {
            let available = available_runtimes(&config.runtime).await;
            return Err(anyhow::Error::from(e).context(format!(
                "Failed to initialize runtime (available here: {})",
                available.join(", ")
            )));
        }
    };

    let coordinator = Coordinator::new(
        Arc::clone(&manifest),
        runtime,
        CoordinatorOptions {
            check_ports: config.launcher.check_ports,
            ..CoordinatorOptions::default()
        },
    );

    let printer = (!args.json).then(|| spawn_event_printer(&coordinator));

    let report = tokio::select! {
        result = coordinator.up() => result.context("Failed to start stack")?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, shutting down...");
            coordinator.shutdown().await.context("Shutdown failed")?;
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
    };

    if let Some(printer) = printer {
        printer.abort();
    }
    print_report(&report, args.json)?;

    let code = if report.any_failed() {
        ExitCode::from(EXIT_SERVICE_FAILED)
    } else {
        ExitCode::SUCCESS
    };

    if args.exit_after_start {
        return Ok(code);
    }

    if !args.json {
        println!("\nPress Ctrl-C to stop the stack.");
    }
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    eprintln!("\nShutting down...");
    coordinator.shutdown().await.context("Shutdown failed")?;
    Ok(code)
}

fn print_report(report: &StatusReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json().context("Failed to serialize report")?);
    } else {
        println!();
        print!("{}", report.to_text());
    }
    Ok(())
}

/// Print lifecycle events as they happen.
fn spawn_event_printer(coordinator: &Coordinator) -> tokio::task::JoinHandle<()> {
    let mut events = coordinator.subscribe();
    let width = coordinator
        .manifest()
        .services()
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0);
    let started = Instant::now();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    if let Some(line) = format_event(&event, width) {
                        println!("[{:>7.2}s] {}", elapsed, line);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn format_event(event: &LifecycleEvent, width: usize) -> Option<String> {
    match event {
        LifecycleEvent::Transition {
            service,
            transition,
        } => {
            let mut line = format!(
                "{:<width$}  {} -> {}",
                service, transition.from, transition.to
            );
            if transition.to == ServiceState::Failed {
                if let Some(reason) = &transition.reason {
                    line.push_str(&format!(" ({})", reason));
                }
            }
            Some(line)
        }
        LifecycleEvent::ProbeAttempt {
            service,
            attempt,
            passed: false,
            detail,
            ..
        } => Some(format!(
            "{:<width$}  probe #{} failed: {}",
            service,
            attempt,
            detail.as_deref().unwrap_or("unhealthy")
        )),
        LifecycleEvent::ProbeAttempt { .. } => None,
    }
}
