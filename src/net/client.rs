//! Client side of table replication.
//!
//! The client maintains one connection to the server, reconnecting with a
//! fixed backoff whenever it drops. Every (re)connect performs the full
//! hello exchange and snapshot, after which the session streams
//! incrementally. Local state survives a disconnect; on reconnect the
//! client pushes entries where it was strictly ahead of the server's
//! snapshot, and announces entries it created while offline.

use crate::core::config::ClientConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::net::wire::{FrameReader, FrameWriter, Message, PROTOCOL_VERSION};
use crate::net::{event_sink, snapshot_to_assign};
use crate::notify::{NotifyKind, Selector};
use crate::storage::{AssignOutcome, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Connection lifecycle, observable through [`ClientHandle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No connection; waiting for the next attempt.
    Disconnected,
    /// TCP connect in flight.
    Connecting,
    /// Connected; hello and snapshot exchange in progress.
    HelloExchange,
    /// Snapshot complete; replicating incrementally.
    Synchronized,
}

/// A running table client.
pub struct ClientHandle {
    state: watch::Receiver<ConnState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches the given state.
    pub async fn wait_for(&self, target: ConnState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Stop reconnecting and close the current connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Start replicating the given store from a server.
pub fn start(storage: Arc<Storage>, config: &ClientConfig) -> ClientHandle {
    let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(
        storage,
        config.connect.clone(),
        config.reconnect_backoff(),
        state_tx,
        shutdown_rx,
    ));
    ClientHandle {
        state: state_rx,
        shutdown: shutdown_tx,
        task,
    }
}

async fn run(
    storage: Arc<Storage>,
    connect: String,
    backoff: Duration,
    state: watch::Sender<ConnState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut session: u64 = 0;
    while !*shutdown.borrow() {
        session += 1;
        let _ = state.send(ConnState::Connecting);
        let stream = tokio::select! {
            result = TcpStream::connect(connect.as_str()) => result,
            _ = shutdown.changed() => break,
        };
        match stream {
            Ok(stream) => {
                let _ = state.send(ConnState::HelloExchange);
                let outcome = tokio::select! {
                    result = run_session(&storage, stream, session, &state) => result,
                    _ = shutdown.changed() => break,
                };
                match outcome {
                    Ok(()) => tracing::info!(server = %connect, "server closed connection"),
                    Err(e) if e.is_transient() => {
                        tracing::debug!(server = %connect, error = %e, "connection lost")
                    }
                    Err(e) => tracing::warn!(server = %connect, error = %e, "session failed"),
                }
                // Values survive; ids belong to the dead connection.
                storage.clear_ids();
            }
            Err(e) => {
                tracing::debug!(server = %connect, error = %e, "connect failed");
            }
        }
        let _ = state.send(ConnState::Disconnected);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
    }
    storage.clear_ids();
    let _ = state.send(ConnState::Disconnected);
}

async fn run_session(
    storage: &Arc<Storage>,
    stream: TcpStream,
    conn: u64,
    state: &watch::Sender<ConnState>,
) -> TrellisResult<()> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    writer
        .send(&Message::ClientHello {
            version: PROTOCOL_VERSION,
        })
        .await?;

    // The sink goes up before the snapshot is applied: a local write
    // landing mid-exchange is queued on the channel and reaches the
    // server once the writer drains, instead of falling into the gap
    // between snapshot application and a later registration. Snapshot
    // applications themselves carry this connection's origin and are
    // not echoed.
    let (outbound, rx) = mpsc::unbounded_channel::<Message>();
    let listener_id = storage.add_listener(
        Selector::All,
        NotifyKind::all(),
        false,
        event_sink(outbound.clone(), conn),
    );

    let result = replicate(storage, &mut reader, writer, rx, &outbound, conn, state).await;

    storage.remove_listener(listener_id);
    drop(outbound);
    result
}

async fn replicate(
    storage: &Arc<Storage>,
    reader: &mut FrameReader<OwnedReadHalf>,
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    outbound: &mpsc::UnboundedSender<Message>,
    conn: u64,
    state: &watch::Sender<ConnState>,
) -> TrellisResult<()> {
    // Snapshot phase. The server wins sequence ties here; entries where
    // we are strictly ahead are pushed back afterwards.
    let mut ahead = Vec::new();
    loop {
        match reader.read_message().await? {
            Message::KeepAlive => {}
            Message::ProtoUnsupported { supported } => {
                return Err(TrellisError::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs: supported,
                })
            }
            Message::EntryAssign {
                key,
                id,
                seq,
                flags,
                value,
            } => {
                if let AssignOutcome::KeptLocal(snap) =
                    storage.client_apply_assign(&key, id, value, flags, seq, true, conn)
                {
                    ahead.push(snap);
                }
            }
            Message::ServerHelloDone => break,
            other => {
                return Err(TrellisError::protocol(format!(
                    "unexpected message during snapshot: {other:?}"
                )))
            }
        }
    }

    let writer_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => {
                        if writer.send(&message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    if writer.send(&Message::KeepAlive).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Push entries where our state is newer than the snapshot.
    for snap in &ahead {
        if let Some(id) = snap.id {
            let _ = outbound.send(Message::EntryUpdate {
                id,
                seq: snap.seq,
                value: snap.value.clone(),
            });
        }
    }
    // Announce entries created while disconnected; the server answers
    // each with the allocated id.
    let pending = storage.pending_announcements();
    for snap in &pending {
        debug_assert_eq!(snap.id, None);
        let _ = outbound.send(snapshot_to_assign(snap));
    }
    tracing::debug!(
        conn,
        ahead = ahead.len(),
        announced = pending.len(),
        "synchronized"
    );
    let _ = state.send(ConnState::Synchronized);

    let result = read_loop(storage, reader, outbound, conn).await;

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
        match reader.read_message().await? {
            Message::KeepAlive => {}
            Message::EntryAssign {
                key,
                id,
                seq,
                flags,
                value,
            } => {
                match storage.client_apply_assign(&key, id, value, flags, seq, false, conn) {
                    AssignOutcome::Applied { .. } => {}
                    // Strictly ahead: push our value under the id just
                    // learned. An equal sequence is the server echoing
                    // our own announcement and needs no answer.
                    AssignOutcome::KeptLocal(snap) if snap.seq > seq => {
                        if let Some(id) = snap.id {
                            let _ = outbound.send(Message::EntryUpdate {
                                id,
                                seq: snap.seq,
                                value: snap.value.clone(),
                            });
                        }
                    }
                    AssignOutcome::KeptLocal(_) => {}
                }
            }
            Message::EntryUpdate { id, seq, value } => {
                // The server is authoritative; a stale update from it is
                // dropped without correction.
                let _ = storage.apply_update(id, seq, value, conn);
            }
            Message::FlagsUpdate { id, seq, flags } => {
                storage.apply_flags(id, seq, flags, conn);
            }
            Message::EntryDelete { id } => {
                storage.apply_delete(id, conn);
            }
            other => {
                return Err(TrellisError::protocol(format!(
                    "unexpected message from server: {other:?}"
                )))
            }
        }
    }
}
