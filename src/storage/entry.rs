//! A single table entry.

use crate::value::{EntryFlags, Value};

/// One named slot in the store.
///
/// The value type is fixed after the first successful write. The sequence
/// number starts at 1 and strictly increases on every successful value or
/// flags mutation; it is the sole tie-break when reconciling concurrent
/// local and remote writes. The wire id is assigned by the server side of
/// a connection and elides the key string on the wire.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Current value.
    pub value: Value,

    /// Metadata flags.
    pub flags: EntryFlags,

    /// Per-entry sequence number.
    pub seq: u32,

    /// Server-assigned wire id, if any.
    pub id: Option<u16>,
}

impl Entry {
    /// Create a fresh entry for a first write.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            flags: EntryFlags::empty(),
            seq: 1,
            id: None,
        }
    }
}

/// Read-only snapshot of an entry, as reported to callers and used when
/// serializing a full sync.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: String,
    pub value: Value,
    pub flags: EntryFlags,
    pub seq: u32,
    pub id: Option<u16>,
}
