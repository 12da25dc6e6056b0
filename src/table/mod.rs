//! Prefix-scoped table views.
//!
//! A [`Table`] is a cheap value: a normalized path prefix plus a handle to
//! the owning [`Storage`]. Many views may share one store; none of them
//! owns the data. All accessors are default-taking and non-failing except
//! `put_value`, which reports a type mismatch.

use crate::core::error::TrellisResult;
use crate::notify::{ListenerCallback, ListenerId, NotifyKind, Selector};
use crate::storage::Storage;
use crate::value::{EntryFlags, TypeMask, Value};
use bytes::Bytes;
use std::sync::Arc;

/// A view over the table at one path prefix.
#[derive(Clone)]
pub struct Table {
    path: String,
    storage: Arc<Storage>,
}

/// Collapse a path to canonical form: leading `/`, single separators, no
/// trailing `/`. The root is the empty string.
fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    out
}

impl Table {
    /// The root table of a store.
    pub fn root(storage: Arc<Storage>) -> Self {
        Self {
            path: String::new(),
            storage,
        }
    }

    /// The table at `path` (normalized) of a store.
    pub fn new(storage: Arc<Storage>, path: &str) -> Self {
        Self {
            path: normalize(path),
            storage,
        }
    }

    /// This table's absolute path ("" for the root).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The store backing this view.
    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    /// The sub-table at `name` relative to this one.
    pub fn get_sub_table(&self, name: &str) -> Table {
        Self {
            path: format!("{}{}", self.path, normalize(name)),
            storage: self.storage.clone(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.path, normalize(key))
    }

    // ------------------------------------------------------------------
    // Keys and structure
    // ------------------------------------------------------------------

    /// Whether `key` holds a value in this table.
    pub fn contains_key(&self, key: &str) -> bool {
        self.storage.contains_key(&self.full_key(key))
    }

    /// Whether a non-empty sub-table exists at `name`.
    pub fn contains_sub_table(&self, name: &str) -> bool {
        self.storage.contains_sub_table(&self.full_key(name))
    }

    /// Names of this table's keys, filtered by type (empty mask = any).
    pub fn get_keys(&self, types: TypeMask) -> Vec<String> {
        let strip = self.path.len() + 1;
        self.storage
            .get_keys(&self.path, types)
            .into_iter()
            .map(|key| key[strip..].to_string())
            .collect()
    }

    /// Names of this table's immediate sub-tables.
    pub fn get_sub_tables(&self) -> Vec<String> {
        self.storage.get_sub_tables(&self.path)
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    pub fn set_persistent(&self, key: &str) {
        self.storage.set_persistent(&self.full_key(key));
    }

    pub fn clear_persistent(&self, key: &str) {
        self.storage.clear_persistent(&self.full_key(key));
    }

    pub fn is_persistent(&self, key: &str) -> bool {
        self.storage.is_persistent(&self.full_key(key))
    }

    pub fn set_flags(&self, key: &str, flags: EntryFlags) {
        self.storage.set_flags(&self.full_key(key), flags);
    }

    pub fn clear_flags(&self, key: &str, flags: EntryFlags) {
        self.storage.clear_flags(&self.full_key(key), flags);
    }

    pub fn get_flags(&self, key: &str) -> EntryFlags {
        self.storage.get_flags(&self.full_key(key))
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Delete the entry at `key` (value and flags). No-op if absent.
    pub fn delete(&self, key: &str) {
        self.storage.delete(&self.full_key(key));
    }

    /// Current value of `key`.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.storage.get_value(&self.full_key(key))
    }

    /// Write a value. Fails on a type mismatch with an existing entry.
    pub fn put_value(&self, key: &str, value: Value) -> TrellisResult<()> {
        self.storage.put_value(&self.full_key(key), value)
    }

    pub fn put_boolean(&self, key: &str, value: bool) -> TrellisResult<()> {
        self.put_value(key, Value::Boolean(value))
    }

    pub fn put_number(&self, key: &str, value: f64) -> TrellisResult<()> {
        self.put_value(key, Value::Double(value))
    }

    pub fn put_string(&self, key: &str, value: impl Into<String>) -> TrellisResult<()> {
        self.put_value(key, Value::String(value.into()))
    }

    pub fn put_raw(&self, key: &str, value: Bytes) -> TrellisResult<()> {
        self.put_value(key, Value::Raw(value))
    }

    pub fn put_boolean_array(&self, key: &str, value: Vec<bool>) -> TrellisResult<()> {
        self.put_value(key, Value::BooleanArray(value))
    }

    pub fn put_number_array(&self, key: &str, value: Vec<f64>) -> TrellisResult<()> {
        self.put_value(key, Value::DoubleArray(value))
    }

    pub fn put_string_array(&self, key: &str, value: Vec<String>) -> TrellisResult<()> {
        self.put_value(key, Value::StringArray(value))
    }

    /// Boolean at `key`, or `default` if absent or of another type.
    pub fn get_boolean(&self, key: &str, default: bool) -> bool {
        self.get_value(key)
            .and_then(|v| v.as_boolean())
            .unwrap_or(default)
    }

    /// Number at `key`, or `default` if absent or of another type.
    pub fn get_number(&self, key: &str, default: f64) -> f64 {
        self.get_value(key)
            .and_then(|v| v.as_double())
            .unwrap_or(default)
    }

    /// String at `key`, or `default` if absent or of another type.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.get_value(key) {
            Some(Value::String(s)) => s,
            _ => default.to_string(),
        }
    }

    /// Boolean array at `key`, or `default` if absent or of another type.
    pub fn get_boolean_array(&self, key: &str, default: Vec<bool>) -> Vec<bool> {
        match self.get_value(key) {
            Some(Value::BooleanArray(v)) => v,
            _ => default,
        }
    }

    /// Number array at `key`, or `default` if absent or of another type.
    pub fn get_number_array(&self, key: &str, default: Vec<f64>) -> Vec<f64> {
        match self.get_value(key) {
            Some(Value::DoubleArray(v)) => v,
            _ => default,
        }
    }

    /// String array at `key`, or `default` if absent or of another type.
    pub fn get_string_array(&self, key: &str, default: Vec<String>) -> Vec<String> {
        match self.get_value(key) {
            Some(Value::StringArray(v)) => v,
            _ => default,
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Listen to every change of this table's immediate keys.
    ///
    /// With `immediate_notify`, existing entries are replayed as NEW
    /// events to this listener only. Events carry the full key path.
    pub fn add_table_listener(
        &self,
        callback: ListenerCallback,
        immediate_notify: bool,
    ) -> ListenerId {
        self.add_table_listener_masked(callback, NotifyKind::all(), immediate_notify)
    }

    /// Listen to this table's immediate keys with an explicit kind filter.
    pub fn add_table_listener_masked(
        &self,
        callback: ListenerCallback,
        mask: NotifyKind,
        immediate_notify: bool,
    ) -> ListenerId {
        self.storage.add_listener(
            Selector::Table {
                prefix: self.path.clone(),
            },
            mask,
            immediate_notify,
            callback,
        )
    }

    /// Listen to changes of a single key of this table.
    pub fn add_key_listener(
        &self,
        key: &str,
        callback: ListenerCallback,
        mask: NotifyKind,
        immediate_notify: bool,
    ) -> ListenerId {
        self.storage.add_listener(
            Selector::Key {
                key: self.full_key(key),
            },
            mask,
            immediate_notify,
            callback,
        )
    }

    /// Listen for sub-tables appearing under or disappearing from this
    /// table. Existing sub-tables are announced immediately. With
    /// `local_notify` unset, only remotely originated changes are
    /// reported.
    pub fn add_sub_table_listener(
        &self,
        callback: ListenerCallback,
        local_notify: bool,
    ) -> ListenerId {
        self.storage.add_listener(
            Selector::SubTable {
                prefix: self.path.clone(),
                local_notify,
            },
            NotifyKind::NEW | NotifyKind::DELETE,
            true,
            callback,
        )
    }

    /// Remove every registration held by this callback. A no-op for an
    /// unregistered callback.
    pub fn remove_table_listener(&self, callback: &ListenerCallback) {
        self.storage.remove_listener_by_callback(callback);
    }

    /// Remove a single registration by id.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.storage.remove_listener(id)
    }
}
