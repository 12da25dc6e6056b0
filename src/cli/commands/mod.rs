//! CLI command implementations.

mod config;
mod serve;
mod watch;

pub use config::{run_config, ConfigArgs};
pub use serve::{run_serve, ServeArgs};
pub use watch::{run_watch, WatchArgs};

use crate::core::config::{Config, ConfigOverrides};
use anyhow::Result;
use std::path::Path;

/// Load configuration with CLI overrides applied. A missing file falls
/// back to defaults; an unreadable or invalid file is an error.
pub fn load_config(path: &Path, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path)?
    } else {
        Config::default()
    };
    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}

/// Initialize the tracing subscriber from the configured log level.
/// `RUST_LOG` takes precedence when set.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}
