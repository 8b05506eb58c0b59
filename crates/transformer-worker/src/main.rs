//! Transformer Worker
//!
//! Runs one transformation task from a task contract file and prints the
//! resulting output manifest.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use transformer_core::RunId;

mod config;
mod error;
mod json_output;
mod runner;

use config::Config;
use runner::{RunOverrides, Runner};

#[derive(Parser)]
#[command(name = "transformer-worker")]
#[command(about = "Run transformer images over input artifacts")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transformer of a task contract
    Run {
        /// Path to the task contract (JSON)
        #[arg(short, long)]
        task: PathBuf,

        /// Image to run instead of the transformer's registry reference
        #[arg(long)]
        image: Option<String>,

        /// Directory holding the input artifact (default: <input-root>/task-<id>/artifact)
        #[arg(long)]
        artifact_dir: Option<PathBuf>,
    },

    /// Remove containers and volumes left behind by a run
    Cleanup {
        /// Run identity printed when the run started
        #[arg(long)]
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the manifest or JSON events
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    if cli.config.json {
        json_output::enable_json_mode();
    }

    let runner = Runner::new(cli.config)?;

    match cli.command {
        Commands::Run {
            task,
            image,
            artifact_dir,
        } => {
            let task = Runner::load_task(&task).await?;
            let overrides = RunOverrides {
                image,
                artifact_directory: artifact_dir,
            };

            let manifest = match runner.run(&task, overrides).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    error!(error = %e, "Task could not be run");
                    json_output::emit_error(&e.to_string());
                    return Err(e.into());
                }
            };

            if !json_output::is_json_mode() {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            }
            if manifest.is_error() {
                std::process::exit(1);
            }
        }
        Commands::Cleanup { run_id } => {
            let run_id = RunId::new(run_id);
            let summary = runner.cleanup(&run_id).await?;
            info!(
                run_id = %run_id,
                containers = summary.containers_removed,
                volumes = summary.volumes_removed,
                "Cleanup finished"
            );
        }
    }

    Ok(())
}
