//! The authoritative key→entry mapping for one table root.
//!
//! Storage owns every entry exclusively; table views hold only a prefix
//! and an `Arc<Storage>`. All mutation runs under a single lock held for
//! the duration of one lookup/mutate/enqueue step and released before any
//! listener callback executes, so a callback can itself write without
//! deadlocking. Each successful mutation enqueues exactly one event while
//! the lock is held; the dispatch thread delivers events in enqueue order.

mod entry;

pub use entry::{Entry, EntrySnapshot};

use crate::core::config::StoreConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::notify::{
    relative, EntryEvent, EventOrigin, EventQueue, ListenerCallback, ListenerId, ListenerRegistry,
    NotifyKind, Selector,
};
use crate::value::{EntryFlags, TypeMask, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Sentinel wire id carried by a client-originated EntryAssign before the
/// server has allocated a real id.
pub const UNASSIGNED_ID: u16 = 0xFFFF;

/// Outcome of applying a remote EntryAssign.
#[derive(Debug, Clone)]
pub enum AssignOutcome {
    /// The assignment was applied (entry created or value adopted).
    Applied { id: u16, seq: u32 },
    /// The local entry was strictly newer; the id was adopted but the
    /// local value kept. The holder should re-announce its state.
    KeptLocal(EntrySnapshot),
}

struct StorageInner {
    entries: BTreeMap<String, Entry>,
    /// Wire id → key, for id-addressed incremental messages.
    ids: HashMap<u16, String>,
    next_id: u16,
    listeners: ListenerRegistry,
}

/// The single authoritative store behind a table root.
pub struct Storage {
    inner: Mutex<StorageInner>,
    queue: Arc<EventQueue>,
    notify_on_unchanged: bool,
    /// Set on the server side: entries receive a wire id at creation.
    assign_ids: AtomicBool,
}

impl Storage {
    /// Create a store and spawn its dispatch thread.
    pub fn new(config: StoreConfig) -> TrellisResult<Arc<Self>> {
        let storage = Arc::new(Self {
            inner: Mutex::new(StorageInner {
                entries: BTreeMap::new(),
                ids: HashMap::new(),
                next_id: 0,
                listeners: ListenerRegistry::default(),
            }),
            queue: Arc::new(EventQueue::new(config.queue_capacity)),
            notify_on_unchanged: config.notify_on_unchanged,
            assign_ids: AtomicBool::new(false),
        });
        let queue = storage.queue.clone();
        let weak = Arc::downgrade(&storage);
        std::thread::Builder::new()
            .name("trellis-dispatch".to_string())
            .spawn(move || run_dispatch(queue, weak))
            .map_err(|e| TrellisError::Dispatch {
                message: e.to_string(),
            })?;
        Ok(storage)
    }

    /// Switch on server-side wire id allocation.
    pub(crate) fn enable_id_assignment(&self) {
        self.assign_ids.store(true, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Whether the key holds a value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Whether some key lives strictly below `prefix/`.
    pub fn contains_sub_table(&self, prefix: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .keys()
            .any(|key| relative(prefix, key).is_some())
    }

    /// Current value of a key.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.inner.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Read-only snapshot of one entry.
    pub fn get_entry(&self, key: &str) -> Option<EntrySnapshot> {
        let inner = self.inner.lock();
        inner.entries.get(key).map(|e| EntrySnapshot {
            key: key.to_string(),
            value: e.value.clone(),
            flags: e.flags,
            seq: e.seq,
            id: e.id,
        })
    }

    /// Flags of a key (empty if absent).
    pub fn get_flags(&self, key: &str) -> EntryFlags {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|e| e.flags)
            .unwrap_or_default()
    }

    /// Whether the key is marked persistent.
    pub fn is_persistent(&self, key: &str) -> bool {
        self.get_flags(key).contains(EntryFlags::PERSISTENT)
    }

    /// Immediate keys of the table at `prefix`, filtered by type.
    ///
    /// An empty mask accepts any type. Returned keys are full paths.
    pub fn get_keys(&self, prefix: &str, types: TypeMask) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(key, entry)| {
                relative(prefix, key).is_some_and(|rel| !rel.contains('/'))
                    && types.accepts(entry.value.entry_type())
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Names of immediate sub-tables of `prefix`, sorted.
    pub fn get_sub_tables(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in inner.entries.keys() {
            if let Some(rel) = relative(prefix, key) {
                if let Some(slash) = rel.find('/') {
                    let child = &rel[..slash];
                    if seen.insert(child.to_string()) {
                        out.push(child.to_string());
                    }
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Local mutation
    // ------------------------------------------------------------------

    /// Write a value through the local table API.
    pub fn put_value(&self, key: &str, value: Value) -> TrellisResult<()> {
        self.set_value_from(key, value, EventOrigin::Local)
    }

    pub(crate) fn set_value_from(
        &self,
        key: &str,
        value: Value,
        origin: EventOrigin,
    ) -> TrellisResult<()> {
        self.queue.reserve();
        let mut inner = self.inner.lock();
        let assign = self.assign_ids.load(Ordering::Relaxed);
        let StorageInner {
            entries,
            ids,
            next_id,
            ..
        } = &mut *inner;
        match entries.get_mut(key) {
            Some(entry) => {
                let expected = entry.value.entry_type();
                let actual = value.entry_type();
                if expected != actual {
                    return Err(TrellisError::type_mismatch(key, expected, actual));
                }
                if !self.notify_on_unchanged && entry.value == value {
                    return Ok(());
                }
                entry.value = value;
                entry.seq += 1;
                let event = make_event(key, entry, NotifyKind::UPDATE, origin);
                self.queue.push(event);
            }
            None => {
                let mut entry = Entry::new(value);
                if assign {
                    entry.id = Some(alloc_id(ids, next_id, key));
                }
                let event = make_event(key, &entry, NotifyKind::NEW, origin);
                entries.insert(key.to_string(), entry);
                self.queue.push(event);
            }
        }
        Ok(())
    }

    /// Remove an entry entirely. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &str) {
        self.delete_from(key, EventOrigin::Local);
    }

    pub(crate) fn delete_from(&self, key: &str, origin: EventOrigin) {
        self.queue.reserve();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(key) {
            if let Some(id) = entry.id {
                inner.ids.remove(&id);
            }
            let event = make_event(key, &entry, NotifyKind::DELETE, origin);
            self.queue.push(event);
        }
    }

    /// Set flag bits on an existing entry. No-op on an absent key or when
    /// the bits are already set.
    pub fn set_flags(&self, key: &str, flags: EntryFlags) {
        self.mutate_flags(key, |current| current | flags, EventOrigin::Local);
    }

    /// Clear flag bits on an existing entry.
    pub fn clear_flags(&self, key: &str, flags: EntryFlags) {
        self.mutate_flags(key, |current| current - flags, EventOrigin::Local);
    }

    /// Mark the entry for durable save/restore.
    pub fn set_persistent(&self, key: &str) {
        self.set_flags(key, EntryFlags::PERSISTENT);
    }

    /// Unmark the entry for durable save/restore.
    pub fn clear_persistent(&self, key: &str) {
        self.clear_flags(key, EntryFlags::PERSISTENT);
    }

    fn mutate_flags(
        &self,
        key: &str,
        f: impl FnOnce(EntryFlags) -> EntryFlags,
        origin: EventOrigin,
    ) {
        self.queue.reserve();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            let new = f(entry.flags);
            if new == entry.flags {
                return;
            }
            entry.flags = new;
            entry.seq += 1;
            let event = make_event(key, entry, NotifyKind::FLAGS, origin);
            self.queue.push(event);
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Register a listener.
    ///
    /// With `immediate` set (and NEW in the mask), the registration
    /// synthesizes NEW events for every currently matching entry, taken
    /// under the same lock as normal writes, targeted at this
    /// registration only. The registration is watermarked with the
    /// current queue stamp: events still queued from before it registered
    /// are not delivered to it, since the entries it starts from already
    /// reflect those mutations.
    pub fn add_listener(
        &self,
        selector: Selector,
        mask: NotifyKind,
        immediate: bool,
        callback: ListenerCallback,
    ) -> ListenerId {
        let mut inner = self.inner.lock();
        let watermark = self.queue.stamp();
        let StorageInner {
            entries, listeners, ..
        } = &mut *inner;
        let id = listeners.add(selector.clone(), mask, callback, watermark);
        if immediate && mask.contains(NotifyKind::NEW) {
            match &selector {
                Selector::SubTable { prefix, .. } => {
                    let mut announced = HashSet::new();
                    for (key, entry) in entries.iter() {
                        let Some(rel) = relative(prefix, key) else {
                            continue;
                        };
                        let Some(slash) = rel.find('/') else {
                            continue;
                        };
                        let child = &rel[..slash];
                        if announced.insert(child.to_string()) {
                            let mut event = make_event(key, entry, NotifyKind::NEW, EventOrigin::Local);
                            event.key = format!("{}/{}", prefix, child);
                            event.target = Some(id);
                            self.queue.push(event);
                        }
                    }
                    if let Some(reg) = listeners.get_mut(id) {
                        reg.announced = announced;
                    }
                }
                _ => {
                    for (key, entry) in entries.iter() {
                        if selector_matches_key(&selector, key) {
                            let mut event = make_event(key, entry, NotifyKind::NEW, EventOrigin::Local);
                            event.target = Some(id);
                            self.queue.push(event);
                        }
                    }
                }
            }
        }
        id
    }

    /// Remove one registration by id.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.lock().listeners.remove_by_id(id)
    }

    /// Remove every registration held by the callback identity. A no-op
    /// for an unregistered callback.
    pub fn remove_listener_by_callback(&self, callback: &ListenerCallback) -> usize {
        self.inner.lock().listeners.remove_by_callback(callback)
    }

    /// Number of live registrations.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    // ------------------------------------------------------------------
    // Remote application (connection reader side)
    // ------------------------------------------------------------------

    /// Server side: apply a client's EntryAssign, allocating an id for a
    /// new key. A stale assignment keeps the local state and reports it
    /// so the caller can re-announce the authoritative entry.
    pub(crate) fn server_apply_assign(
        &self,
        key: &str,
        value: Value,
        flags: EntryFlags,
        seq: u32,
        conn: u64,
    ) -> AssignOutcome {
        self.queue.reserve();
        let mut inner = self.inner.lock();
        let StorageInner {
            entries,
            ids,
            next_id,
            ..
        } = &mut *inner;
        match entries.get_mut(key) {
            Some(entry) => {
                let id = match entry.id {
                    Some(id) => id,
                    None => {
                        let id = alloc_id(ids, next_id, key);
                        entry.id = Some(id);
                        id
                    }
                };
                if seq > entry.seq {
                    entry.value = value;
                    entry.flags = flags;
                    entry.seq = seq;
                    let event = make_event(key, entry, NotifyKind::UPDATE, EventOrigin::Remote(conn));
                    self.queue.push(event);
                    AssignOutcome::Applied { id, seq }
                } else {
                    AssignOutcome::KeptLocal(EntrySnapshot {
                        key: key.to_string(),
                        value: entry.value.clone(),
                        flags: entry.flags,
                        seq: entry.seq,
                        id: Some(id),
                    })
                }
            }
            None => {
                let id = alloc_id(ids, next_id, key);
                let entry = Entry {
                    value,
                    flags,
                    seq: seq.max(1),
                    id: Some(id),
                };
                let event = make_event(key, &entry, NotifyKind::NEW, EventOrigin::Remote(conn));
                let seq = entry.seq;
                entries.insert(key.to_string(), entry);
                self.queue.push(event);
                AssignOutcome::Applied { id, seq }
            }
        }
    }

    /// Client side: apply a server EntryAssign, adopting the server id.
    ///
    /// During the connect snapshot the server also wins sequence ties;
    /// in steady state only a strictly greater sequence is applied.
    pub(crate) fn client_apply_assign(
        &self,
        key: &str,
        id: u16,
        value: Value,
        flags: EntryFlags,
        seq: u32,
        snapshot: bool,
        conn: u64,
    ) -> AssignOutcome {
        self.queue.reserve();
        let mut inner = self.inner.lock();
        let StorageInner { entries, ids, .. } = &mut *inner;
        ids.insert(id, key.to_string());
        match entries.get_mut(key) {
            Some(entry) => {
                entry.id = Some(id);
                let apply = seq > entry.seq || (snapshot && seq == entry.seq);
                if apply {
                    let unchanged = entry.value == value && entry.flags == flags;
                    entry.value = value;
                    entry.flags = flags;
                    entry.seq = seq;
                    if self.notify_on_unchanged || !unchanged {
                        let event =
                            make_event(key, entry, NotifyKind::UPDATE, EventOrigin::Remote(conn));
                        self.queue.push(event);
                    }
                    AssignOutcome::Applied { id, seq }
                } else {
                    AssignOutcome::KeptLocal(EntrySnapshot {
                        key: key.to_string(),
                        value: entry.value.clone(),
                        flags: entry.flags,
                        seq: entry.seq,
                        id: Some(id),
                    })
                }
            }
            None => {
                let entry = Entry {
                    value,
                    flags,
                    seq: seq.max(1),
                    id: Some(id),
                };
                let event = make_event(key, &entry, NotifyKind::NEW, EventOrigin::Remote(conn));
                let seq = entry.seq;
                entries.insert(key.to_string(), entry);
                self.queue.push(event);
                AssignOutcome::Applied { id, seq }
            }
        }
    }

    /// Apply a remote EntryUpdate. A stale or unknown-id update is
    /// discarded; when the local entry is authoritative its snapshot is
    /// returned so the server side can correct the peer.
    pub(crate) fn apply_update(
        &self,
        id: u16,
        seq: u32,
        value: Value,
        conn: u64,
    ) -> Option<EntrySnapshot> {
        self.queue.reserve();
        let mut inner = self.inner.lock();
        let StorageInner { entries, ids, .. } = &mut *inner;
        let Some(key) = ids.get(&id).cloned() else {
            tracing::debug!(id, "update for unknown id, ignoring");
            return None;
        };
        let Some(entry) = entries.get_mut(&key) else {
            return None;
        };
        if seq <= entry.seq {
            tracing::trace!(key = %key, remote_seq = seq, local_seq = entry.seq, "stale update");
            return Some(EntrySnapshot {
                key: key.clone(),
                value: entry.value.clone(),
                flags: entry.flags,
                seq: entry.seq,
                id: Some(id),
            });
        }
        if entry.value.entry_type() != value.entry_type() {
            tracing::warn!(key = %key, "remote update with mismatched type, discarding");
            return None;
        }
        entry.value = value;
        entry.seq = seq;
        let event = make_event(&key, entry, NotifyKind::UPDATE, EventOrigin::Remote(conn));
        self.queue.push(event);
        None
    }

    /// Apply a remote EntryDelete. Unknown ids are ignored.
    pub(crate) fn apply_delete(&self, id: u16, conn: u64) {
        self.queue.reserve();
        let mut inner = self.inner.lock();
        let Some(key) = inner.ids.remove(&id) else {
            return;
        };
        if let Some(entry) = inner.entries.remove(&key) {
            let event = make_event(&key, &entry, NotifyKind::DELETE, EventOrigin::Remote(conn));
            self.queue.push(event);
        }
    }

    /// Apply a remote FlagsUpdate (full replacement bitmask).
    pub(crate) fn apply_flags(&self, id: u16, seq: u32, flags: EntryFlags, conn: u64) {
        self.queue.reserve();
        let mut inner = self.inner.lock();
        let StorageInner { entries, ids, .. } = &mut *inner;
        let Some(key) = ids.get(&id).cloned() else {
            return;
        };
        let Some(entry) = entries.get_mut(&key) else {
            return;
        };
        if seq <= entry.seq {
            return;
        }
        entry.seq = seq;
        if entry.flags == flags {
            return;
        }
        entry.flags = flags;
        let event = make_event(&key, entry, NotifyKind::FLAGS, EventOrigin::Remote(conn));
        self.queue.push(event);
    }

    // ------------------------------------------------------------------
    // Connection synchronization
    // ------------------------------------------------------------------

    /// Server side: take the full snapshot for a connecting client,
    /// hand it to `emit`, and register the connection's event sink, all
    /// in one locked step.
    ///
    /// `emit` runs while the lock is held and must only enqueue into the
    /// connection's outbound channel. This guarantees the wire sees the
    /// snapshot (and whatever terminator `emit` appends) before any
    /// incremental event: a delivery to the sink needs this lock, so it
    /// cannot land in the channel until `emit` has finished.
    pub(crate) fn begin_server_sync(
        &self,
        sink: ListenerCallback,
        emit: impl FnOnce(&[EntrySnapshot]),
    ) -> ListenerId {
        let mut inner = self.inner.lock();
        let watermark = self.queue.stamp();
        let StorageInner {
            entries,
            ids,
            next_id,
            listeners,
        } = &mut *inner;
        let mut snapshot = Vec::with_capacity(entries.len());
        for (key, entry) in entries.iter_mut() {
            if entry.id.is_none() {
                entry.id = Some(alloc_id(ids, next_id, key));
            }
            snapshot.push(EntrySnapshot {
                key: key.clone(),
                value: entry.value.clone(),
                flags: entry.flags,
                seq: entry.seq,
                id: entry.id,
            });
        }
        emit(&snapshot);
        listeners.add(Selector::All, NotifyKind::all(), sink, watermark)
    }

    /// Client side: the entries created while disconnected (no wire id
    /// yet), to be announced to the server after the snapshot.
    pub(crate) fn pending_announcements(&self) -> Vec<EntrySnapshot> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.id.is_none())
            .map(|(key, entry)| EntrySnapshot {
                key: key.clone(),
                value: entry.value.clone(),
                flags: entry.flags,
                seq: entry.seq,
                id: None,
            })
            .collect()
    }

    /// Discard the connection's id allocation (client side, on
    /// disconnect). Entry values are preserved pending resync.
    pub(crate) fn clear_ids(&self) {
        let mut inner = self.inner.lock();
        inner.ids.clear();
        for entry in inner.entries.values_mut() {
            entry.id = None;
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn deliver(&self, stamp: u64, event: &EntryEvent) {
        let matches = {
            let mut inner = self.inner.lock();
            let StorageInner {
                entries, listeners, ..
            } = &mut *inner;
            let nonempty = |prefix: &str, child: &str| {
                let sub = format!("{}/{}", prefix, child);
                entries.keys().any(|key| relative(&sub, key).is_some())
            };
            listeners.collect_matches(stamp, event, &nonempty)
        };
        // Lock released: callbacks may freely write back into the store.
        for (callback, event) in matches {
            callback(&event);
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}

fn alloc_id(ids: &mut HashMap<u16, String>, next_id: &mut u16, key: &str) -> u16 {
    let id = *next_id;
    *next_id = next_id.wrapping_add(1);
    ids.insert(id, key.to_string());
    id
}

fn make_event(key: &str, entry: &Entry, kind: NotifyKind, origin: EventOrigin) -> EntryEvent {
    EntryEvent {
        key: key.to_string(),
        value: entry.value.clone(),
        flags: entry.flags,
        seq: entry.seq,
        entry_id: entry.id,
        kind,
        origin,
        target: None,
    }
}

fn selector_matches_key(selector: &Selector, key: &str) -> bool {
    match selector {
        Selector::All => true,
        Selector::Table { prefix } => {
            relative(prefix, key).is_some_and(|rel| !rel.contains('/'))
        }
        Selector::Key { key: target } => target == key,
        Selector::SubTable { .. } => false,
    }
}

/// Dispatch loop body: pop events in order and deliver each to matching
/// listeners. Exits when the store is dropped (queue shut down).
fn run_dispatch(queue: Arc<EventQueue>, storage: Weak<Storage>) {
    queue.register_dispatch_thread();
    while let Some((stamp, event)) = queue.pop() {
        let Some(storage) = storage.upgrade() else {
            break;
        };
        storage.deliver(stamp, &event);
    }
    tracing::debug!("dispatch loop exited");
}
