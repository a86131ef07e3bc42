//! # cadence CLI
//!
//! Command-line harness for the cadence actor runtime: runs a manifest of
//! actors and scripted input against an in-memory store, or checks one
//! without running it.

mod commands;
mod manifest;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a manifest's actors and play its script
    Run {
        /// Path to the manifest
        #[arg(default_value = "cadence.yml")]
        manifest: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,

        /// Dispatch rounds allowed after each step
        #[arg(long, default_value_t = 64)]
        max_rounds: usize,
    },

    /// Check a manifest's actors, machines and schemas
    Check {
        /// Path to the manifest
        #[arg(default_value = "cadence.yml")]
        manifest: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::INFO.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            manifest,
            json,
            max_rounds,
        } => {
            let opts = commands::RunOptions { json, max_rounds };
            commands::run_manifest(&manifest, opts).await
        }
        Commands::Check { manifest, json } => commands::check_manifest(&manifest, json),
    }
}
