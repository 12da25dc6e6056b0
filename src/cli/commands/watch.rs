//! Watch command implementation.

use crate::core::config::Config;
use crate::net::client;
use crate::notify::{NotifyKind, Selector};
use crate::storage::Storage;
use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;

/// Connect to a server and print table changes.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Server address override (e.g. "127.0.0.1:1735").
    #[arg(long)]
    pub connect: Option<String>,
}

/// Mirror a server's table and print every change until interrupted.
pub async fn run_watch(config: Config) -> Result<()> {
    let client_config = config
        .client
        .clone()
        .context("no server address: set client.connect or pass --connect")?;
    let storage = Storage::new(config.store.clone())?;

    storage.add_listener(
        Selector::All,
        NotifyKind::all(),
        true,
        Arc::new(|event| {
            println!(
                "{:>6} {} = {:?} (seq {})",
                kind_label(event.kind),
                event.key,
                event.value,
                event.seq
            );
        }),
    );

    let handle = client::start(storage, &client_config);
    tracing::info!(server = %client_config.connect, "watching");

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}

fn kind_label(kind: NotifyKind) -> &'static str {
    if kind == NotifyKind::NEW {
        "new"
    } else if kind == NotifyKind::DELETE {
        "delete"
    } else if kind == NotifyKind::UPDATE {
        "update"
    } else {
        "flags"
    }
}
