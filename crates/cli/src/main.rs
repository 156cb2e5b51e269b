//! storysnap CLI - Main Entry Point
//!
//! Discovers stories from a Storybook catalog and uploads their DOM
//! snapshots for visual comparison.

use clap::{Parser, Subcommand};

use storysnap_cli::commands::{snapshot, validate};
use storysnap_cli::output::{self, print_error};

/// storysnap - visual snapshots for Storybook stories
#[derive(Parser)]
#[command(name = "storysnap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format for listings
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover stories and upload their snapshots
    Snapshot(snapshot::SnapshotArgs),

    /// Check a config file
    Validate(validate::ValidateArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Snapshot(args) => snapshot::execute(args, cli.format, cli.verbose).await,
        Commands::Validate(args) => validate::execute(args, cli.format).await,
    };

    if let Err(e) = result {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
