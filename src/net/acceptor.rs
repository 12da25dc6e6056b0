//! Listening socket lifecycle.
//!
//! An [`Acceptor`] goes through three states: created, listening, shut
//! down. Shutdown is one-way; a shut-down acceptor cannot be restarted.
//! Accept errors raised while shutting down are expected (the listener is
//! being torn down) and surface as a clean `Ok(None)` instead of noise.

use crate::core::error::{TrellisError, TrellisResult};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

enum AcceptorState {
    Created,
    Listening(Arc<TcpListener>),
    ShutDown,
}

/// A shutdown-aware TCP listener.
pub struct Acceptor {
    addr: SocketAddr,
    state: Mutex<AcceptorState>,
    shutdown: watch::Sender<bool>,
}

impl Acceptor {
    pub fn new(addr: SocketAddr) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            addr,
            state: Mutex::new(AcceptorState::Created),
            shutdown,
        }
    }

    /// Bind the listening socket and return the bound address.
    ///
    /// Calling again while listening returns the address unchanged; a
    /// shut-down acceptor reports [`TrellisError::AcceptorClosed`]. A
    /// bind failure is fatal to the acceptor.
    pub async fn start(&self) -> TrellisResult<SocketAddr> {
        {
            let state = self.state.lock();
            match &*state {
                AcceptorState::Created => {}
                AcceptorState::Listening(listener) => {
                    return listener
                        .local_addr()
                        .map_err(|e| TrellisError::transport(e.to_string()));
                }
                AcceptorState::ShutDown => return Err(TrellisError::AcceptorClosed),
            }
        }
        let listener = TcpListener::bind(self.addr).await.map_err(|e| TrellisError::Bind {
            addr: self.addr.to_string(),
            message: e.to_string(),
        })?;
        let local = listener
            .local_addr()
            .map_err(|e| TrellisError::transport(e.to_string()))?;

        let mut state = self.state.lock();
        match &*state {
            AcceptorState::Created => {
                tracing::info!(addr = %local, "listening");
                *state = AcceptorState::Listening(Arc::new(listener));
                Ok(local)
            }
            // Shut down while we were binding.
            _ => Err(TrellisError::AcceptorClosed),
        }
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            AcceptorState::Listening(listener) => listener.local_addr().ok(),
            _ => None,
        }
    }

    /// Wait for the next inbound connection.
    ///
    /// Returns `Ok(None)` once the acceptor is shut down, including when
    /// shutdown interrupts a blocked accept.
    pub async fn accept(&self) -> TrellisResult<Option<(TcpStream, SocketAddr)>> {
        let listener = match &*self.state.lock() {
            AcceptorState::Listening(listener) => listener.clone(),
            AcceptorState::Created => {
                return Err(TrellisError::transport("acceptor not started"))
            }
            AcceptorState::ShutDown => return Ok(None),
        };
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(None);
        }
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "accepted connection");
                    Ok(Some((stream, peer)))
                }
                // An accept failure raced by shutdown is intentional and
                // suppressed; anything else is reported.
                Err(_) if *shutdown.borrow() => Ok(None),
                Err(e) => Err(TrellisError::transport(format!("accept failed: {e}"))),
            },
            _ = shutdown.changed() => Ok(None),
        }
    }

    /// Shut the acceptor down, waking any blocked accept. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, AcceptorState::ShutDown) {
            tracing::debug!(addr = %self.addr, "acceptor shutting down");
            *state = AcceptorState::ShutDown;
        }
        let _ = self.shutdown.send(true);
    }
}
