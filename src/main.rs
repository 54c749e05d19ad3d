use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use econ_sim::config::load_config;
use econ_sim::runner::run_simulation;
use econ_sim::worker::run_worker;

/// Run a multi-agent economic simulation.
#[derive(Parser)]
#[command(name = "runsim", version, about)]
struct Cli {
    /// Path to the simulation config JSON.
    #[arg(long = "cfg", global = true)]
    cfg: Option<PathBuf>,

    /// Log level: CRITICAL, ERROR, WARNING, INFO or DEBUG.
    #[arg(long = "log", global = true, default_value = "WARNING")]
    log: String,

    #[command(subcommand)]
    command: Option<WorkerCommand>,
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Agent host process, spawned by the runner. Not for direct use.
    #[command(hide = true)]
    Worker {
        /// Hub gateway address, e.g. 127.0.0.1:45123.
        #[arg(long)]
        connect: String,
    },
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let directive = match level.to_ascii_uppercase().as_str() {
        "CRITICAL" | "ERROR" => "error",
        "WARNING" => "warn",
        "INFO" => "info",
        "DEBUG" => "debug",
        other => anyhow::bail!("unknown log level \"{other}\""),
    };
    let filter = EnvFilter::try_new(directive)?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(WorkerCommand::Worker { connect }) => {
            run_worker(&connect).context("worker failed")?;
        }
        None => {
            let cfg = cli.cfg.context("--cfg <path> is required")?;
            let config = load_config(&cfg)?;
            let config_dir =
                cfg.parent().unwrap_or_else(|| std::path::Path::new(".")).to_path_buf();
            run_simulation(config, &config_dir)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log) {
        eprintln!("runsim: {e}");
        return ExitCode::FAILURE;
    }
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
