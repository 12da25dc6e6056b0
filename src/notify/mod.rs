//! Listener registrations and change events.
//!
//! Every successful store mutation produces exactly one [`EntryEvent`],
//! pushed onto the store's ordered dispatch queue while the mutation lock
//! is still held. A dedicated dispatch loop pops events in enqueue order
//! and delivers each to every registered listener whose selector and kind
//! filter match. Callbacks run outside the mutation lock and may write
//! back into the store; those writes produce new events handled in later
//! dispatch iterations, never re-entrantly.

mod queue;

pub use queue::EventQueue;

use crate::value::{EntryFlags, Value};
use std::collections::HashSet;
use std::sync::Arc;

bitflags::bitflags! {
    /// Kinds of entry change notifications.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NotifyKind: u8 {
        /// Entry created (or replayed as new at registration time).
        const NEW = 0x01;
        /// Entry deleted.
        const DELETE = 0x02;
        /// Entry value replaced.
        const UPDATE = 0x04;
        /// Entry flags changed.
        const FLAGS = 0x08;
    }
}

impl Default for NotifyKind {
    fn default() -> Self {
        Self::all()
    }
}

/// Where a mutation came from.
///
/// Connection sinks use this to avoid echoing a peer's own update back to
/// it; sub-table listeners registered without `local_notify` use it to
/// skip locally originated changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Mutation made through the local table API.
    Local,
    /// Mutation applied from the remote peer on the given connection.
    Remote(u64),
}

impl EventOrigin {
    pub fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }
}

/// A single entry change notification.
#[derive(Debug, Clone)]
pub struct EntryEvent {
    /// Full hierarchical key of the affected entry.
    pub key: String,

    /// The entry's value: the new value for NEW/UPDATE, the removed value
    /// for DELETE, the current value for FLAGS.
    pub value: Value,

    /// Flags after the mutation (before removal, for DELETE).
    pub flags: EntryFlags,

    /// Sequence number after the mutation.
    pub seq: u32,

    /// Wire id, if one has been assigned.
    pub entry_id: Option<u16>,

    /// Which kind of change this is (exactly one bit).
    pub kind: NotifyKind,

    /// Where the mutation came from.
    pub origin: EventOrigin,

    /// When set, deliver only to this registration (immediate replay).
    pub target: Option<ListenerId>,
}

/// Listener callback. One callback may hold many registrations.
pub type ListenerCallback = Arc<dyn Fn(&EntryEvent) + Send + Sync>;

/// Opaque registration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// What a registration listens to.
#[derive(Debug, Clone)]
pub enum Selector {
    /// Every event, regardless of key. Used by connection sinks.
    All,
    /// Immediate keys of the table at `prefix` (nested keys excluded).
    Table { prefix: String },
    /// One exact key.
    Key { key: String },
    /// New/removed immediate sub-tables of `prefix`.
    SubTable { prefix: String, local_notify: bool },
}

/// A stored listener registration.
pub(crate) struct Registration {
    pub(crate) id: ListenerId,
    pub(crate) selector: Selector,
    pub(crate) mask: NotifyKind,
    pub(crate) callback: ListenerCallback,
    /// Queue stamp at registration time. Events stamped at or below this
    /// were enqueued before the registration existed; their mutations are
    /// already reflected in the state the registration started from (the
    /// immediate-replay snapshot, a connection snapshot), so delivering
    /// them would double-count. Targeted replay events are exempt.
    pub(crate) watermark: u64,
    /// Sub-table children already announced to this registration.
    pub(crate) announced: HashSet<String>,
}

/// The key's path relative to a table prefix, if it is under that prefix.
pub(crate) fn relative<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    if prefix.is_empty() {
        key.strip_prefix('/')
    } else {
        key.strip_prefix(prefix).and_then(|r| r.strip_prefix('/'))
    }
}

/// Registry of listener registrations for one store.
///
/// Lives inside the store's mutation lock so that immediate replay at
/// registration time sees a consistent snapshot: no concurrent write can
/// be double-counted or missed between snapshot and registration.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    items: Vec<Registration>,
    next_id: u64,
}

impl ListenerRegistry {
    pub(crate) fn add(
        &mut self,
        selector: Selector,
        mask: NotifyKind,
        callback: ListenerCallback,
        watermark: u64,
    ) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.items.push(Registration {
            id,
            selector,
            mask,
            callback,
            watermark,
            announced: HashSet::new(),
        });
        id
    }

    /// Remove one registration by id. Returns whether it existed.
    pub(crate) fn remove_by_id(&mut self, id: ListenerId) -> bool {
        let before = self.items.len();
        self.items.retain(|reg| reg.id != id);
        self.items.len() != before
    }

    /// Remove every registration held by the given callback identity.
    /// Removing an unregistered callback is a no-op.
    pub(crate) fn remove_by_callback(&mut self, callback: &ListenerCallback) -> usize {
        let before = self.items.len();
        self.items.retain(|reg| !Arc::ptr_eq(&reg.callback, callback));
        before - self.items.len()
    }

    pub(crate) fn get_mut(&mut self, id: ListenerId) -> Option<&mut Registration> {
        self.items.iter_mut().find(|reg| reg.id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Collect (callback, event) pairs for one popped event.
    ///
    /// `stamp` is the event's enqueue stamp; registrations added at or
    /// after it skip the event (its mutation predates them). Targeted
    /// replay events always reach their registration.
    /// `subtable_nonempty(prefix, child)` reports whether any key remains
    /// under `prefix/child/`; it is consulted for sub-table DELETE
    /// announcements.
    pub(crate) fn collect_matches(
        &mut self,
        stamp: u64,
        event: &EntryEvent,
        subtable_nonempty: &dyn Fn(&str, &str) -> bool,
    ) -> Vec<(ListenerCallback, EntryEvent)> {
        let mut out = Vec::new();
        for reg in &mut self.items {
            if let Some(target) = event.target {
                if reg.id == target {
                    out.push((reg.callback.clone(), event.clone()));
                }
                continue;
            }
            if stamp <= reg.watermark {
                continue;
            }
            if !reg.mask.intersects(event.kind) {
                continue;
            }
            match &reg.selector {
                Selector::All => out.push((reg.callback.clone(), event.clone())),
                Selector::Table { prefix } => {
                    if let Some(rel) = relative(prefix, &event.key) {
                        if !rel.contains('/') {
                            out.push((reg.callback.clone(), event.clone()));
                        }
                    }
                }
                Selector::Key { key } => {
                    if *key == event.key {
                        out.push((reg.callback.clone(), event.clone()));
                    }
                }
                Selector::SubTable {
                    prefix,
                    local_notify,
                } => {
                    if !local_notify && event.origin.is_local() {
                        continue;
                    }
                    let Some(rel) = relative(prefix, &event.key) else {
                        continue;
                    };
                    let Some(slash) = rel.find('/') else {
                        continue;
                    };
                    let child = &rel[..slash];
                    let child_key = format!("{}/{}", prefix, child);
                    if event.kind == NotifyKind::NEW {
                        if reg.announced.insert(child.to_string()) {
                            let mut ev = event.clone();
                            ev.key = child_key;
                            out.push((reg.callback.clone(), ev));
                        }
                    } else if event.kind == NotifyKind::DELETE
                        && reg.announced.contains(child)
                        && !subtable_nonempty(prefix, child)
                    {
                        reg.announced.remove(child);
                        let mut ev = event.clone();
                        ev.key = child_key;
                        out.push((reg.callback.clone(), ev));
                    }
                }
            }
        }
        out
    }
}
