//! CLI module: command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod config;
pub mod up;
pub mod validate;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use stackgate::config::{Config, RuntimeType};
use stackgate::manifest::{LoadOptions, Manifest, DEFAULT_MANIFEST_NAMES};
use stackgate::StackError;

/// Exit status when a service ended Failed.
pub const EXIT_SERVICE_FAILED: u8 = 1;
/// Exit status for manifest/config errors found before anything started.
pub const EXIT_STRUCTURAL: u8 = 2;

#[derive(Parser)]
#[command(name = "stackgate")]
#[command(version)]
#[command(about = "Health-gated startup coordinator for single-host service stacks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the stack: every service launches once its dependencies are healthy
    Up {
        /// Manifest file (default: stackgate.yaml, compose.yaml, docker-compose.yml)
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Dotenv file merged into the environment (default: .env next to the manifest)
        #[arg(long)]
        env_file: Option<PathBuf>,
        /// Runtime backend, overriding the config file
        #[arg(long, value_enum)]
        runtime: Option<RuntimeArg>,
        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
        /// Exit once startup settles instead of waiting for Ctrl-C
        #[arg(long)]
        exit_after_start: bool,
    },
    /// Load and check a manifest without starting anything
    Validate {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Show launch waves and dependency gates
    Plan {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Inspect the coordinator configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate ~/.stackgate/config.json
    Check,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RuntimeArg {
    Docker,
    Native,
}

impl From<RuntimeArg> for RuntimeType {
    fn from(arg: RuntimeArg) -> Self {
        match arg {
            RuntimeArg::Docker => RuntimeType::Docker,
            RuntimeArg::Native => RuntimeType::Native,
        }
    }
}

pub async fn run() -> Result<ExitCode> {
    // Initialize logging from config (format, level, optional file output).
    // Load config early so we can respect the logging settings; fall back to
    // defaults if the config file is missing or unreadable.
    let logging_cfg = Config::load().map(|c| c.logging).unwrap_or_default();
    stackgate::utils::logging::init_logging(&logging_cfg);

    let cli = Cli::parse();

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Version) => {
            cmd_version();
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Up {
            file,
            env_file,
            runtime,
            json,
            exit_after_start,
        }) => {
            up::cmd_up(up::UpArgs {
                file,
                env_file,
                runtime: runtime.map(RuntimeType::from),
                json,
                exit_after_start,
            })
            .await
        }
        Some(Commands::Validate { file }) => validate::cmd_validate(file),
        Some(Commands::Plan { file }) => validate::cmd_plan(file),
        Some(Commands::Config { action }) => config::cmd_config(action),
    }
}

fn cmd_version() {
    println!("stackgate {}", env!("CARGO_PKG_VERSION"));
}

/// Structural errors (bad manifest, bad config) exit 2, everything else 1.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<StackError>() {
        Some(e) if e.is_fatal() => ExitCode::from(EXIT_STRUCTURAL),
        _ => ExitCode::FAILURE,
    }
}

/// `-f` if given, else the first default manifest name in the working
/// directory.
pub(crate) fn resolve_manifest_path(file: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(file) = file {
        return Ok(file);
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Manifest::discover(&cwd).ok_or_else(|| {
        anyhow::Error::from(StackError::Config(format!(
            "no manifest found in {} (looked for {})",
            cwd.display(),
            DEFAULT_MANIFEST_NAMES.join(", ")
        )))
    })
}

pub(crate) fn load_manifest(
    path: &Path,
    config: &Config,
    env_file: Option<PathBuf>,
) -> Result<Manifest> {
    let opts = LoadOptions {
        health: config.health.clone(),
        env_file,
        project: None,
    };
    Manifest::load(path, &opts)
        .with_context(|| format!("Failed to load manifest {}", path.display()))
}

/// Config file problems are structural too.
pub(crate) fn load_config() -> Result<Config> {
    Config::load().context("Failed to load configuration")
}
