//! Listener delivery semantics.

mod common;

use common::{test_storage, wait_until_sync, EventLog, CONVERGE};
use std::sync::Arc;
use trellis::config::StoreConfig;
use trellis::{NotifyKind, Storage, Table, Value};

#[test]
fn test_immediate_replay_counts_existing_entries_once() {
    let storage = test_storage();
    let table = Table::root(storage);
    table.put_number("a", 1.0).unwrap();
    table.put_number("b", 2.0).unwrap();

    let log = EventLog::new();
    table.add_table_listener(log.callback(), true);

    // Exactly the two existing entries replay as NEW.
    assert!(log.wait_len(2, CONVERGE));
    let events = log.snapshot();
    assert!(events.iter().all(|e| e.kind == NotifyKind::NEW));
    let mut keys: Vec<_> = events.iter().map(|e| e.key.clone()).collect();
    keys.sort();
    assert_eq!(keys, vec!["/a", "/b"]);

    // A later write produces exactly one more event.
    table.put_number("c", 3.0).unwrap();
    assert!(log.wait_len(3, CONVERGE));
    assert_eq!(log.snapshot()[2].key, "/c");
    assert_eq!(log.len(), 3);
}

#[test]
fn test_replay_targets_only_the_new_registration() {
    let storage = test_storage();
    let table = Table::root(storage);
    table.put_number("a", 1.0).unwrap();

    let first = EventLog::new();
    table.add_table_listener(first.callback(), true);
    assert!(first.wait_len(1, CONVERGE));

    // The second registration's replay must not reach the first.
    let second = EventLog::new();
    table.add_table_listener(second.callback(), true);
    assert!(second.wait_len(1, CONVERGE));
    assert_eq!(first.len(), 1);
}

#[test]
fn test_events_delivered_in_mutation_order() {
    let storage = test_storage();
    let table = Table::root(storage);

    let log = EventLog::new();
    table.add_table_listener(log.callback(), false);

    for i in 0..20 {
        table.put_number("x", i as f64).unwrap();
    }
    assert!(log.wait_len(20, CONVERGE));
    let seqs: Vec<u32> = log.snapshot().iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort();
    assert_eq!(seqs, sorted);
}

#[test]
fn test_key_listener_with_delete_mask() {
    let storage = test_storage();
    let table = Table::root(storage);

    let log = EventLog::new();
    table.add_key_listener("x", log.callback(), NotifyKind::DELETE, false);

    table.put_number("x", 1.0).unwrap();
    table.put_number("x", 2.0).unwrap();
    table.put_number("y", 3.0).unwrap();
    table.delete("x");

    assert!(log.wait_len(1, CONVERGE));
    let events = log.snapshot();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, NotifyKind::DELETE);
    assert_eq!(events[0].key, "/x");
    // The deleted value rides along on the event.
    assert_eq!(events[0].value, Value::Double(2.0));
}

#[test]
fn test_table_listener_ignores_nested_keys() {
    let storage = test_storage();
    let table = Table::root(storage);

    let log = EventLog::new();
    table.add_table_listener(log.callback(), false);

    table.put_number("direct", 1.0).unwrap();
    table.put_number("sub/nested", 2.0).unwrap();
    table.put_number("direct", 3.0).unwrap();

    assert!(log.wait_len(2, CONVERGE));
    assert!(log.snapshot().iter().all(|e| e.key == "/direct"));
}

#[test]
fn test_queued_event_not_replayed_twice() {
    let storage = test_storage();
    let table = Table::root(storage);

    // Park the dispatch thread inside a callback so later events stay
    // queued while a new listener registers.
    let gate = Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));
    let gate2 = gate.clone();
    table.add_key_listener(
        "block",
        Arc::new(move |_| {
            let (lock, cvar) = &*gate2;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
        }),
        NotifyKind::all(),
        false,
    );
    table.put_number("block", 1.0).unwrap();
    table.put_number("a", 1.0).unwrap();

    // Registers with both entries present; its replay already covers
    // the still-queued event for "/a".
    let log = EventLog::new();
    table.add_table_listener(log.callback(), true);

    let (lock, cvar) = &*gate;
    *lock.lock().unwrap() = true;
    cvar.notify_all();

    assert!(log.wait_len(2, CONVERGE));
    table.put_number("fresh", 1.0).unwrap();
    assert!(log.wait_len(3, CONVERGE));
    std::thread::sleep(std::time::Duration::from_millis(100));

    let a_events: Vec<_> = log
        .snapshot()
        .into_iter()
        .filter(|e| e.key == "/a")
        .collect();
    assert_eq!(a_events.len(), 1);
    assert_eq!(a_events[0].kind, NotifyKind::NEW);
    assert_eq!(log.len(), 3);
}

#[test]
fn test_callback_may_write_back_into_the_table() {
    let storage = test_storage();
    let table = Table::root(storage);

    let writer = table.clone();
    table.add_key_listener(
        "trigger",
        Arc::new(move |event| {
            if event.kind == NotifyKind::NEW || event.kind == NotifyKind::UPDATE {
                let doubled = event.value.as_double().unwrap_or(0.0) * 2.0;
                let _ = writer.put_number("derived", doubled);
            }
        }),
        NotifyKind::all(),
        false,
    );

    table.put_number("trigger", 21.0).unwrap();
    assert!(wait_until_sync(CONVERGE, || {
        table.get_number("derived", 0.0) == 42.0
    }));
}

#[test]
fn test_removed_listener_receives_nothing_more() {
    let storage = test_storage();
    let table = Table::root(storage);

    let log = EventLog::new();
    let id = table.add_table_listener(log.callback(), false);

    table.put_number("x", 1.0).unwrap();
    assert!(log.wait_len(1, CONVERGE));

    assert!(table.remove_listener(id));
    table.put_number("x", 2.0).unwrap();
    table.put_number("y", 3.0).unwrap();

    // Give dispatch a moment; the count must not move.
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(log.len(), 1);
}

#[test]
fn test_remove_unregistered_callback_is_noop() {
    let storage = test_storage();
    let table = Table::root(storage);

    let log = EventLog::new();
    let registered = log.callback();
    let never_registered = EventLog::new().callback();
    table.add_table_listener(registered.clone(), false);

    table.remove_table_listener(&never_registered);
    table.put_number("x", 1.0).unwrap();
    assert!(log.wait_len(1, CONVERGE));

    table.remove_table_listener(&registered);
    table.put_number("x", 2.0).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(log.len(), 1);
}

#[test]
fn test_sub_table_listener_announces_each_child_once() {
    let storage = test_storage();
    let table = Table::root(storage);
    table.put_number("wing/span", 1.0).unwrap();

    let log = EventLog::new();
    table.add_sub_table_listener(log.callback(), true);

    // Existing child announced immediately.
    assert!(log.wait_len(1, CONVERGE));
    assert_eq!(log.snapshot()[0].key, "/wing");

    // More keys in the same child are not re-announced.
    table.put_number("wing/chord", 2.0).unwrap();
    // A new child is.
    table.put_number("tail/span", 3.0).unwrap();
    assert!(log.wait_len(2, CONVERGE));
    assert_eq!(log.snapshot()[1].key, "/tail");
    assert_eq!(log.len(), 2);

    // Child disappears when its last key is deleted.
    table.delete("tail/span");
    assert!(log.wait_len(3, CONVERGE));
    let events = log.snapshot();
    assert_eq!(events[2].key, "/tail");
    assert_eq!(events[2].kind, NotifyKind::DELETE);
}

#[test]
fn test_unchanged_write_is_silent_when_configured() {
    let storage = Storage::new(StoreConfig {
        notify_on_unchanged: false,
        ..StoreConfig::default()
    })
    .unwrap();
    let table = Table::root(storage);

    let log = EventLog::new();
    table.add_table_listener(log.callback(), false);

    table.put_number("x", 1.0).unwrap();
    table.put_number("x", 1.0).unwrap(); // no-op
    table.put_number("x", 2.0).unwrap();

    assert!(log.wait_len(2, CONVERGE));
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(log.len(), 2);
    // The silent write also leaves the sequence untouched.
    assert_eq!(log.snapshot()[1].seq, 2);
}

#[test]
fn test_unchanged_write_notifies_by_default() {
    let storage = test_storage();
    let table = Table::root(storage);

    let log = EventLog::new();
    table.add_table_listener(log.callback(), false);

    table.put_number("x", 1.0).unwrap();
    table.put_number("x", 1.0).unwrap();

    assert!(log.wait_len(2, CONVERGE));
    assert_eq!(log.snapshot()[1].kind, NotifyKind::UPDATE);
}
