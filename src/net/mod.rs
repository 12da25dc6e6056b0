//! TCP replication layer: wire codec, acceptor, server and client roles.

pub mod acceptor;
pub mod client;
pub mod server;
pub mod wire;

pub use acceptor::Acceptor;
pub use client::{ClientHandle, ConnState};
pub use server::ServerHandle;
pub use wire::PROTOCOL_VERSION;

use crate::notify::{EntryEvent, EventOrigin, ListenerCallback, NotifyKind};
use crate::storage::{EntrySnapshot, UNASSIGNED_ID};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use wire::Message;

/// Build the store-side event sink for one connection: translates entry
/// events into outbound messages, suppressing the echo of changes that
/// arrived over this same connection.
pub(crate) fn event_sink(outbound: UnboundedSender<Message>, conn: u64) -> ListenerCallback {
    Arc::new(move |event: &EntryEvent| {
        if event.origin == EventOrigin::Remote(conn) {
            return;
        }
        if let Some(message) = event_to_message(event) {
            let _ = outbound.send(message);
        }
    })
}

/// Translate one entry event into its wire message, if it has one.
///
/// An entry without a wire id is announced key-addressed with the
/// unassigned sentinel; deletes and flag changes of id-less entries have
/// no wire form and are skipped (the entry was never announced).
pub(crate) fn event_to_message(event: &EntryEvent) -> Option<Message> {
    if event.kind == NotifyKind::NEW {
        Some(Message::EntryAssign {
            key: event.key.clone(),
            id: event.entry_id.unwrap_or(UNASSIGNED_ID),
            seq: event.seq,
            flags: event.flags,
            value: event.value.clone(),
        })
    } else if event.kind == NotifyKind::UPDATE {
        match event.entry_id {
            Some(id) => Some(Message::EntryUpdate {
                id,
                seq: event.seq,
                value: event.value.clone(),
            }),
            None => Some(Message::EntryAssign {
                key: event.key.clone(),
                id: UNASSIGNED_ID,
                seq: event.seq,
                flags: event.flags,
                value: event.value.clone(),
            }),
        }
    } else if event.kind == NotifyKind::FLAGS {
        event.entry_id.map(|id| Message::FlagsUpdate {
            id,
            seq: event.seq,
            flags: event.flags,
        })
    } else if event.kind == NotifyKind::DELETE {
        event.entry_id.map(|id| Message::EntryDelete { id })
    } else {
        None
    }
}

/// The EntryAssign announcing one snapshot entry.
pub(crate) fn snapshot_to_assign(snap: &EntrySnapshot) -> Message {
    Message::EntryAssign {
        key: snap.key.clone(),
        id: snap.id.unwrap_or(UNASSIGNED_ID),
        seq: snap.seq,
        flags: snap.flags,
        value: snap.value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{EntryFlags, Value};

    fn event(kind: NotifyKind, id: Option<u16>) -> EntryEvent {
        EntryEvent {
            key: "/k".to_string(),
            value: Value::Double(1.0),
            flags: EntryFlags::empty(),
            seq: 3,
            entry_id: id,
            kind,
            origin: EventOrigin::Local,
            target: None,
        }
    }

    #[test]
    fn test_update_with_id_is_entry_update() {
        let message = event_to_message(&event(NotifyKind::UPDATE, Some(5))).unwrap();
        assert!(matches!(message, Message::EntryUpdate { id: 5, seq: 3, .. }));
    }

    #[test]
    fn test_update_without_id_falls_back_to_assign() {
        let message = event_to_message(&event(NotifyKind::UPDATE, None)).unwrap();
        assert!(matches!(
            message,
            Message::EntryAssign {
                id: UNASSIGNED_ID,
                ..
            }
        ));
    }

    #[test]
    fn test_delete_without_id_is_skipped() {
        assert!(event_to_message(&event(NotifyKind::DELETE, None)).is_none());
        assert!(event_to_message(&event(NotifyKind::FLAGS, None)).is_none());
    }

    #[test]
    fn test_echo_suppression() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = event_sink(tx, 7);

        let mut ev = event(NotifyKind::NEW, Some(1));
        ev.origin = EventOrigin::Remote(7);
        sink(&ev);
        assert!(rx.try_recv().is_err());

        ev.origin = EventOrigin::Remote(8);
        sink(&ev);
        assert!(rx.try_recv().is_ok());

        ev.origin = EventOrigin::Local;
        sink(&ev);
        assert!(rx.try_recv().is_ok());
    }
}
