//! Serve command implementation.

use crate::core::config::Config;
use crate::net::server;
use crate::storage::Storage;
use anyhow::Result;
use clap::Args;

/// Run the table server.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Bind address override (e.g. "0.0.0.0:1735").
    #[arg(long)]
    pub bind: Option<String>,
}

/// Run the server until interrupted.
pub async fn run_serve(config: Config) -> Result<()> {
    let server_config = config.server.clone().unwrap_or_default();
    let storage = Storage::new(config.store.clone())?;

    let handle = server::start(storage, &server_config).await?;
    tracing::info!(addr = %handle.local_addr(), "trellis server running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
