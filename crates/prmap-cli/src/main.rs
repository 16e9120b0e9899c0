use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "prmap-cli")]
#[command(about = "parkrun map data pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, reconcile and write data.js plus the run report.
    Sync,
    /// Summarize recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        /// Output directory; defaults to PRMAP_OUTPUT_DIR.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = prmap_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} events={} current={} failures={} manifest={}",
                summary.run_id,
                summary.events,
                summary.current_events,
                summary.failures.len(),
                summary.manifest
            );
        }
        Commands::Report { runs, output } => {
            println!("{}", prmap_sync::report_markdown(runs, output)?);
        }
    }

    Ok(())
}
