//! Common test utilities.
//!
//! Shared helpers for integration tests. Import with `mod common;` in
//! test files.
#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use trellis::config::{ClientConfig, ServerConfig, StoreConfig};
use trellis::net::{client, server, ClientHandle, ServerHandle};
use trellis::{EntryEvent, ListenerCallback, Storage};

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    let config_content = r#"
[store]
queue_capacity = 64

[telemetry]
log_level = "warn"
"#;

    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("failed to write config");
    file
}

/// A store with a small queue, suitable for tests.
pub fn test_storage() -> Arc<Storage> {
    Storage::new(StoreConfig::default()).expect("failed to create store")
}

/// Start a server for the given store on an ephemeral port.
pub async fn start_server(storage: Arc<Storage>) -> ServerHandle {
    server::start(
        storage,
        &ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    )
    .await
    .expect("failed to start server")
}

/// Connect a client for the given store, with a short reconnect backoff.
pub fn connect_client(storage: Arc<Storage>, addr: SocketAddr) -> ClientHandle {
    client::start(
        storage,
        &ClientConfig {
            connect: addr.to_string(),
            reconnect_backoff_ms: 50,
        },
    )
}

/// Recorder of delivered entry events.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<EntryEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback that appends every delivered event to this log.
    pub fn callback(&self) -> ListenerCallback {
        let events = self.events.clone();
        Arc::new(move |event: &EntryEvent| {
            events.lock().unwrap().push(event.clone());
        })
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<EntryEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Block until the log holds at least `n` events.
    pub fn wait_len(&self, n: usize, timeout: Duration) -> bool {
        wait_until_sync(timeout, || self.len() >= n)
    }
}

/// Poll a condition from a blocking context until it holds.
pub fn wait_until_sync(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Poll a condition from an async context until it holds.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Generous deadline for replication to settle.
pub const CONVERGE: Duration = Duration::from_secs(5);
