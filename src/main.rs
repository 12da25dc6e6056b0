//! Trellis - unified CLI entrypoint.
//!
//! Usage:
//!   trellis serve [--config config/trellis.toml] [--bind ADDR]
//!   trellis watch [--connect ADDR]
//!   trellis config validate --config config/trellis.toml

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use trellis::cli::commands::{init_tracing, load_config, run_config, run_serve, run_watch};
use trellis::cli::{Cli, Commands};
use trellis::config::ConfigOverrides;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/trellis.toml"));

    match cli.command {
        Commands::Serve(args) => {
            let overrides = ConfigOverrides {
                log_level: cli.log_level,
                bind: args.bind,
                connect: None,
            };
            let config = load_config(&config_path, &overrides)?;
            init_tracing(&config.telemetry.log_level);
            run_serve(config).await
        }
        Commands::Watch(args) => {
            let overrides = ConfigOverrides {
                log_level: cli.log_level,
                bind: None,
                connect: args.connect,
            };
            let config = load_config(&config_path, &overrides)?;
            init_tracing(&config.telemetry.log_level);
            run_watch(config).await
        }
        Commands::Config(args) => run_config(args),
    }
}
