//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate a configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/trellis.toml")]
        config: PathBuf,
    },
    /// Print the effective configuration with defaults filled in.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/trellis.toml")]
        config: PathBuf,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path (stdout when omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config } => show_config(&config),
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("config file not found: {}", path.display());
    }
    Config::from_file(path)?;
    println!("{}: ok", path.display());
    Ok(())
}

fn show_config(path: &Path) -> Result<()> {
    let config = if path.exists() {
        Config::from_file(path)?
    } else {
        Config::default()
    };
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    print!("{rendered}");
    Ok(())
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = r#"# Trellis configuration.

[store]
# Soft capacity of the event dispatch queue.
queue_capacity = 4096
# Report writes that leave the value unchanged.
notify_on_unchanged = true

# Enable to run as a server.
#[server]
#bind = "0.0.0.0:1735"

# Enable to replicate from a server.
#[client]
#connect = "127.0.0.1:1735"
#reconnect_backoff_ms = 1000

[telemetry]
log_level = "info"
"#;
    match output {
        Some(path) => {
            std::fs::write(path, template)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {}", path.display());
        }
        None => print!("{template}"),
    }
    Ok(())
}
