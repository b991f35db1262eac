//! BioinfoFlow CLI and REST API entry point.
//!
//! Binary name: `bioflow`
//!
//! Parses CLI arguments, initializes the database and engine, then
//! dispatches to the appropriate command handler or starts the REST API
//! server.
//!
//! Exit codes for `run`: 0 on COMPLETED, 1 on FAILED/ERROR, 2 on an
//! invalid workflow, 130 on cancellation.

mod cli;
mod http;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use state::AppState;

/// Container-native workflow engine for reproducible data pipelines.
#[derive(Parser)]
#[command(name = "bioflow")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base directory for run trees and the history database (default: cwd).
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Emit machine-readable JSON instead of styled output.
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow from a YAML file.
    Run {
        /// Path to the workflow YAML file.
        workflow_file: PathBuf,

        /// Input override in the form key=value (repeatable).
        #[arg(short, long = "input")]
        input: Vec<String>,

        /// Maximum number of steps to execute in parallel.
        #[arg(short, long, default_value_t = 1)]
        parallel: usize,

        /// Default time limit for steps without one (e.g. 30m, 1h).
        #[arg(long, default_value = "1h")]
        default_time_limit: String,

        /// Disable time limits for all steps.
        #[arg(long)]
        disable_time_limits: bool,

        /// Write run trees under this directory instead of --base-dir.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Validate and print the execution plan without running.
        #[arg(long)]
        dry_run: bool,
    },

    /// List recent runs.
    List {
        /// Only show runs of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show run and per-step state.
    Status {
        /// Run identifier.
        run_id: String,
    },

    /// Write a template workflow file.
    Init {
        /// Workflow name.
        name: String,

        /// Output file (default: <name>.yaml).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Start the REST API server.
    Serve {
        /// Bind address.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Bind port.
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,bioflow=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let base_dir = match cli.base_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Run {
            workflow_file,
            input,
            parallel,
            default_time_limit,
            disable_time_limits,
            output_dir,
            dry_run,
        } => {
            let opts = cli::run::RunArgs {
                workflow_file,
                inputs: input,
                parallel,
                default_time_limit,
                disable_time_limits,
                base_dir: output_dir.unwrap_or(base_dir),
                dry_run,
            };
            cli::run::handle_run(opts, cli.json).await
        }

        Commands::List { workflow, limit } => {
            let state = AppState::init(base_dir).await?;
            cli::list::handle_list(&state, workflow.as_deref(), limit, cli.json).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status { run_id } => {
            let state = AppState::init(base_dir).await?;
            cli::status::handle_status(&state, &run_id, cli.json).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Init { name, output } => {
            cli::init::handle_init(&name, output.as_deref(), cli.json)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Serve { host, port } => {
            let state = AppState::init(base_dir).await?;
            http::serve(state, &host, port).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
