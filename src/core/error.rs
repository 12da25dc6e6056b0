//! Error types for the table core and the sync protocol.
//!
//! Storage mutations that fail leave the store untouched and produce no
//! event. Transport errors are split into fatal (bind-time) and transient
//! (established-session) conditions; transient ones drive the client's
//! reconnect loop.

use crate::value::EntryType;
use thiserror::Error;

/// Common Trellis error conditions.
#[derive(Debug, Error)]
pub enum TrellisError {
    /// A typed write targeted an entry holding a different type.
    ///
    /// The store is unchanged and no event is emitted.
    #[error("type mismatch for '{key}': entry is {expected:?}, write was {actual:?}")]
    TypeMismatch {
        key: String,
        expected: EntryType,
        actual: EntryType,
    },

    /// Key not present in the store.
    #[error("key not found: '{key}'")]
    KeyNotFound { key: String },

    /// Bind/listen failure at server start. Fatal: the server does not start.
    #[error("failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    /// Accept/read/write failure on an established session. Transient:
    /// drives client-side reconnect.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Malformed or out-of-sequence protocol message. Closes the connection.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The peers do not speak the same protocol version.
    #[error("protocol version mismatch: ours {ours:#06x}, theirs {theirs:#06x}")]
    VersionMismatch { ours: u16, theirs: u16 },

    /// The acceptor was shut down; it cannot be started again.
    #[error("acceptor is closed")]
    AcceptorClosed,

    /// The store's dispatch thread could not be started. Fatal: the
    /// store is unusable without its consumer.
    #[error("failed to start dispatch thread: {message}")]
    Dispatch { message: String },
}

impl TrellisError {
    /// Create a TypeMismatch error.
    pub fn type_mismatch(key: impl Into<String>, expected: EntryType, actual: EntryType) -> Self {
        Self::TypeMismatch {
            key: key.into(),
            expected,
            actual,
        }
    }

    /// Create a KeyNotFound error.
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    /// Create a Transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a Protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Check if this error should trigger reconnect rather than abort.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Protocol { .. })
    }
}

/// Result type using TrellisError.
pub type TrellisResult<T> = Result<T, TrellisError>;
