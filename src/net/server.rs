//! Server side of table replication.
//!
//! The server owns wire id allocation and is the authority on sequence
//! ties. Each accepted connection performs the hello exchange, receives a
//! full snapshot terminated by ServerHelloDone, and is then registered as
//! an event sink so every subsequent store mutation (from the local API
//! or from any other client) streams out incrementally. A client's own
//! changes are not echoed back to it, with one exception: the server
//! answers a client's EntryAssign directly so the client learns the
//! allocated id, and answers any stale message with the authoritative
//! entry state.

use crate::core::config::ServerConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::net::acceptor::Acceptor;
use crate::net::wire::{FrameReader, FrameWriter, Message, PROTOCOL_VERSION};
use crate::net::{event_sink, snapshot_to_assign};
use crate::storage::{AssignOutcome, Storage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A running table server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    conn_shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every established connection.
    pub async fn shutdown(self) {
        self.acceptor.shutdown();
        let _ = self.conn_shutdown.send(true);
        let _ = self.accept_task.await;
    }
}

/// Bind the listening socket and start serving the given store.
pub async fn start(storage: Arc<Storage>, config: &ServerConfig) -> TrellisResult<ServerHandle> {
    let addr: SocketAddr = config.bind.parse().map_err(|e| TrellisError::Bind {
        addr: config.bind.clone(),
        message: format!("invalid bind address: {e}"),
    })?;
    storage.enable_id_assignment();

    let acceptor = Arc::new(Acceptor::new(addr));
    let local_addr = acceptor.start().await?;
    let (conn_shutdown, _) = watch::channel(false);
    let accept_task = tokio::spawn(accept_loop(
        acceptor.clone(),
        storage,
        conn_shutdown.clone(),
    ));

    Ok(ServerHandle {
        local_addr,
        acceptor,
        conn_shutdown,
        accept_task,
    })
}

async fn accept_loop(
    acceptor: Arc<Acceptor>,
    storage: Arc<Storage>,
    conn_shutdown: watch::Sender<bool>,
) {
    let mut next_conn: u64 = 1;
    loop {
        match acceptor.accept().await {
            Ok(Some((stream, peer))) => {
                let conn = next_conn;
                next_conn += 1;
                let storage = storage.clone();
                let stop = conn_shutdown.subscribe();
                tokio::spawn(async move {
                    match serve_connection(storage, stream, conn, stop).await {
                        Ok(()) => tracing::info!(conn, peer = %peer, "connection closed"),
                        Err(e) if e.is_transient() => {
                            tracing::debug!(conn, peer = %peer, error = %e, "connection dropped")
                        }
                        Err(e) => {
                            tracing::warn!(conn, peer = %peer, error = %e, "connection failed")
                        }
                    }
                });
            }
            Ok(None) => {
                tracing::info!("accept loop stopped");
                return;
            }
            Err(e) => {
                // Transient (EMFILE and friends). Back off briefly instead
                // of spinning.
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_connection(
    storage: Arc<Storage>,
    stream: TcpStream,
    conn: u64,
    mut stop: watch::Receiver<bool>,
) -> TrellisResult<()> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    // Hello exchange: the first message must announce a version we speak.
    let version = match reader.read_message().await? {
        Message::ClientHello { version } => version,
        other => {
            return Err(TrellisError::protocol(format!(
                "expected ClientHello, got {other:?}"
            )))
        }
    };
    if version != PROTOCOL_VERSION {
        writer
            .send(&Message::ProtoUnsupported {
                supported: PROTOCOL_VERSION,
            })
            .await?;
        return Err(TrellisError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: version,
        });
    }

    // Snapshot, its enqueue into the outbound channel, and the sink
    // registration happen in one locked step so no mutation can fall
    // between them and no incremental message can precede ServerHelloDone
    // in the channel.
    let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();
    let listener_id = storage.begin_server_sync(event_sink(outbound.clone(), conn), |snapshot| {
        tracing::debug!(conn, entries = snapshot.len(), "starting sync");
        for snap in snapshot {
            let _ = outbound.send(snapshot_to_assign(snap));
        }
        let _ = outbound.send(Message::ServerHelloDone);
    });

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if writer.send(&message).await.is_err() {
                break;
            }
        }
    });

    let result = tokio::select! {
        result = read_loop(&storage, &mut reader, &outbound, conn) => result,
        _ = stop.changed() => Ok(()),
    };

    storage.remove_listener(listener_id);
    drop(outbound);
    writer_task.abort();
    result
}

async fn read_loop<R: tokio::io::AsyncRead + Unpin>(
    storage: &Storage,
    reader: &mut FrameReader<R>,
    outbound: &mpsc::UnboundedSender<Message>,
    conn: u64,
) -> TrellisResult<()> {
    loop {
        let message = match reader.read_message().await {
            Ok(message) => message,
            // The peer hanging up is a normal way for this loop to end.
            Err(TrellisError::Transport { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        match message {
            Message::KeepAlive => {}
            Message::EntryAssign {
                key,
                seq,
                flags,
                value,
                ..
            } => match storage.server_apply_assign(&key, value.clone(), flags, seq, conn) {
                AssignOutcome::Applied { id, seq } => {
                    // Tell the originator which id its key received. Its
                    // own change is otherwise not echoed back.
                    let _ = outbound.send(Message::EntryAssign {
                        key,
                        id,
                        seq,
                        flags,
                        value,
                    });
                }
                AssignOutcome::KeptLocal(snap) => {
                    let _ = outbound.send(snapshot_to_assign(&snap));
                }
            },
            Message::EntryUpdate { id, seq, value } => {
                if let Some(snap) = storage.apply_update(id, seq, value, conn) {
                    // Stale update: correct the peer with our state.
                    let _ = outbound.send(snapshot_to_assign(&snap));
                }
            }
            Message::FlagsUpdate { id, seq, flags } => {
                storage.apply_flags(id, seq, flags, conn);
            }
            Message::EntryDelete { id } => {
                storage.apply_delete(id, conn);
            }
            other => {
                return Err(TrellisError::protocol(format!(
                    "unexpected message from client: {other:?}"
                )))
            }
        }
    }
}
