//! Trellis - synchronized hierarchical table of named values.
//!
//! Trellis replicates a tree of typed, named values between one server
//! and any number of TCP clients. Every participant holds a full replica;
//! reads are local and writes propagate asynchronously. Keys are
//! slash-separated paths presented through prefix-scoped [`table::Table`]
//! views, and change listeners observe mutations in the order they were
//! applied.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Table views                          │
//! │        typed get/put │ sub-tables │ change listeners        │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Storage                            │
//! │   entries │ sequence numbers │ wire ids │ event dispatch    │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Replication                          │
//! │     wire codec │ acceptor │ server role │ client role       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types
//! - [`value`] - Value variants, entry types and flags
//! - [`storage`] - The authoritative entry map and conflict resolution
//! - [`notify`] - Listener registry and ordered event dispatch
//! - [`table`] - Prefix-scoped table views, the public API
//! - [`net`] - Wire protocol, TCP acceptor, server and client roles
//! - [`cli`] - Command-line interface
//!
//! # Key Invariants
//!
//! - An entry's value type is fixed from first write until deletion
//! - Sequence numbers strictly increase per entry; higher wins, the
//!   server wins snapshot ties
//! - Listeners observe mutations in application order
//! - A client keeps serving local reads and writes while disconnected
//!   and reconciles on reconnect

// Core infrastructure
pub mod core;

// Data model
pub mod value;

// Authoritative store
pub mod storage;

// Listener dispatch
pub mod notify;

// Public table API
pub mod table;

// Replication
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error};
pub use net::{client, server, ConnState, PROTOCOL_VERSION};
pub use notify::{EntryEvent, ListenerCallback, ListenerId, NotifyKind};
pub use storage::Storage;
pub use table::Table;
pub use value::{EntryFlags, EntryType, TypeMask, Value};
