//! Slumber CLI
//!
//! Command-line tools for exercising the Slumber sync engine.
//!
//! # Commands
//!
//! - `simulate` - Pair two in-memory devices, log sleep on one and reconcile
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Slumber sync engine tools.
#[derive(Parser)]
#[command(name = "slumber")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair a phone and a companion in memory and sync them
    Simulate {
        /// Number of nights to log on the phone
        #[arg(short, long, default_value = "7")]
        entries: usize,

        /// Log the nights while the companion is unreachable
        #[arg(short, long)]
        offline: bool,

        /// JSON file with sync settings
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            entries,
            offline,
            config,
        } => {
            let settings = match config {
                Some(path) => commands::settings::SettingsFile::load(&path)?,
                None => commands::settings::SettingsFile::default(),
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let report = runtime.block_on(commands::simulate::run(entries, offline, &settings))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Version => {
            println!("Slumber CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
