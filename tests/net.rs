//! Wire-level server behavior, exercised with a hand-rolled peer.

mod common;

use common::{start_server, test_storage};
use tokio::net::TcpStream;
use trellis::net::wire::{FrameReader, FrameWriter, Message, PROTOCOL_VERSION};
use trellis::storage::UNASSIGNED_ID;
use trellis::{EntryFlags, Table, Value};

type Peer = (
    FrameReader<tokio::net::tcp::OwnedReadHalf>,
    FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
);

async fn raw_peer(addr: std::net::SocketAddr) -> Peer {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, write) = stream.into_split();
    (FrameReader::new(read), FrameWriter::new(write))
}

#[tokio::test]
async fn test_unsupported_version_is_rejected() {
    let server = start_server(test_storage()).await;
    let (mut reader, mut writer) = raw_peer(server.local_addr()).await;

    writer
        .send(&Message::ClientHello { version: 0x0200 })
        .await
        .unwrap();
    let reply = reader.read_message().await.unwrap();
    assert_eq!(
        reply,
        Message::ProtoUnsupported {
            supported: PROTOCOL_VERSION
        }
    );
    // The server hangs up after rejecting.
    assert!(reader.read_message().await.is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_lists_every_entry_and_ends_with_done() {
    let storage = test_storage();
    let table = Table::root(storage.clone());
    table.put_number("speed", 1.5).unwrap();
    table.put_string("mode", "auto").unwrap();
    table.set_persistent("mode");

    let server = start_server(storage).await;
    let (mut reader, mut writer) = raw_peer(server.local_addr()).await;
    writer
        .send(&Message::ClientHello {
            version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();

    let mut assigns = Vec::new();
    loop {
        match reader.read_message().await.unwrap() {
            Message::EntryAssign {
                key,
                id,
                seq,
                flags,
                value,
            } => assigns.push((key, id, seq, flags, value)),
            Message::ServerHelloDone => break,
            Message::KeepAlive => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }

    assigns.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(assigns.len(), 2);

    let (key, id, seq, flags, value) = &assigns[0];
    assert_eq!(key, "/mode");
    assert_ne!(*id, UNASSIGNED_ID);
    assert_eq!(*seq, 2); // put then set_persistent
    assert!(flags.contains(EntryFlags::PERSISTENT));
    assert_eq!(*value, Value::from("auto"));

    let (key, id, ..) = &assigns[1];
    assert_eq!(key, "/speed");
    assert_ne!(*id, assigns[0].1);
    assert_ne!(*id, UNASSIGNED_ID);

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_assign_receives_allocated_id() {
    let storage = test_storage();
    let server = start_server(storage.clone()).await;
    let (mut reader, mut writer) = raw_peer(server.local_addr()).await;

    writer
        .send(&Message::ClientHello {
            version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();
    assert_eq!(
        reader.read_message().await.unwrap(),
        Message::ServerHelloDone
    );

    writer
        .send(&Message::EntryAssign {
            key: "/from-peer".to_string(),
            id: UNASSIGNED_ID,
            seq: 1,
            flags: EntryFlags::empty(),
            value: Value::Boolean(true),
        })
        .await
        .unwrap();

    // The server answers the originator with the real id.
    match reader.read_message().await.unwrap() {
        Message::EntryAssign { key, id, seq, .. } => {
            assert_eq!(key, "/from-peer");
            assert_ne!(id, UNASSIGNED_ID);
            assert_eq!(seq, 1);
        }
        other => panic!("unexpected message: {other:?}"),
    }
    assert_eq!(storage.get_value("/from-peer"), Some(Value::Boolean(true)));

    server.shutdown().await;
}

#[tokio::test]
async fn test_stale_update_draws_a_correction() {
    let storage = test_storage();
    let table = Table::root(storage.clone());
    table.put_number("x", 1.0).unwrap();
    table.put_number("x", 2.0).unwrap(); // seq 2

    let server = start_server(storage).await;
    let (mut reader, mut writer) = raw_peer(server.local_addr()).await;
    writer
        .send(&Message::ClientHello {
            version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();

    let id = loop {
        match reader.read_message().await.unwrap() {
            Message::EntryAssign { id, .. } => break id,
            Message::ServerHelloDone => panic!("snapshot was empty"),
            _ => {}
        }
    };
    assert_eq!(
        reader.read_message().await.unwrap(),
        Message::ServerHelloDone
    );

    writer
        .send(&Message::EntryUpdate {
            id,
            seq: 1,
            value: Value::Double(99.0),
        })
        .await
        .unwrap();

    match reader.read_message().await.unwrap() {
        Message::EntryAssign { key, seq, value, .. } => {
            assert_eq!(key, "/x");
            assert_eq!(seq, 2);
            assert_eq!(value, Value::Double(2.0));
        }
        other => panic!("unexpected message: {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_no_incremental_messages_before_snapshot_done() {
    let storage = test_storage();
    let table = Table::root(storage.clone());
    for i in 0..20 {
        table.put_number(&format!("k{i}"), 0.0).unwrap();
    }
    let server = start_server(storage).await;

    // Keep the store busy while the peer connects; none of these
    // id-addressed updates may reach the wire ahead of ServerHelloDone.
    let load = tokio::spawn(async move {
        for i in 0..500 {
            table.put_number("k0", i as f64).unwrap();
            tokio::task::yield_now().await;
        }
    });

    let (mut reader, mut writer) = raw_peer(server.local_addr()).await;
    writer
        .send(&Message::ClientHello {
            version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();
    loop {
        match reader.read_message().await.unwrap() {
            Message::EntryAssign { .. } | Message::KeepAlive => {}
            Message::ServerHelloDone => break,
            other => panic!("incremental message before snapshot end: {other:?}"),
        }
    }

    load.await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_drops_the_connection() {
    use tokio::io::AsyncWriteExt;

    let storage = test_storage();
    let server = start_server(storage.clone()).await;

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);

    writer
        .send(&Message::ClientHello {
            version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();
    assert_eq!(
        reader.read_message().await.unwrap(),
        Message::ServerHelloDone
    );

    // An unknown tag byte ends the session.
    writer.get_mut().write_all(&[0x7F]).await.unwrap();
    assert!(reader.read_message().await.is_err());

    server.shutdown().await;
}
