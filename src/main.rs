//! Talk to the dav-fs daemon from the command line.
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "Client tools for a WebDAV-backed filesystem daemon.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a dav-fs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the daemon to drop its caches.
    InvalidateCaches,

    /// Fetch the root object's attributes once.
    Probe,

    /// Probe periodically and report liveness changes.
    Watch {
        /// Milliseconds between probes.
        #[arg(short, long, default_value_t = 5000)]
        interval_ms: u64,
    },
}

fn main() {
    let args = Args::parse();

    let config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    if let Err(e) = Trc::default().init() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        });

    let outcome: Result<(), String> = runtime.block_on(async move {
        match args.command {
            Command::InvalidateCaches => daemon::invalidate_caches(config)
                .await
                .map_err(|e| e.to_string()),
            Command::Probe => daemon::probe(config).await.map_err(|e| e.to_string()),
            Command::Watch { interval_ms } => {
                daemon::watch(config, Duration::from_millis(interval_ms.max(1)))
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    });

    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(1);
    }
}
