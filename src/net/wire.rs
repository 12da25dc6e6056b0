//! Wire framing and message codec.
//!
//! Each message is a type tag byte followed by its payload. Integers are
//! big-endian. Variable-length payloads (strings, raw bytes, arrays)
//! carry an explicit length prefix, capped at [`MAX_PAYLOAD`]. Before the
//! hello exchange completes entries travel by key (EntryAssign); after
//! it, by the server-assigned 2-byte id.

use crate::core::error::{TrellisError, TrellisResult};
use crate::value::{EntryFlags, EntryType, Value};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u16 = 0x0300;

/// Upper bound for any length-prefixed payload or array element count.
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

mod tag {
    pub const KEEP_ALIVE: u8 = 0x00;
    pub const CLIENT_HELLO: u8 = 0x01;
    pub const PROTO_UNSUPPORTED: u8 = 0x02;
    pub const SERVER_HELLO_DONE: u8 = 0x03;
    pub const ENTRY_ASSIGN: u8 = 0x10;
    pub const ENTRY_UPDATE: u8 = 0x11;
    pub const FLAGS_UPDATE: u8 = 0x12;
    pub const ENTRY_DELETE: u8 = 0x13;
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Connection liveness filler; ignored on receipt.
    KeepAlive,
    /// Client's opening message: the protocol version it speaks.
    ClientHello { version: u16 },
    /// Server's rejection of an unsupported client version.
    ProtoUnsupported { supported: u16 },
    /// End of the server's full snapshot.
    ServerHelloDone,
    /// New entry announcement, key-addressed. The server uses real ids;
    /// a client announcing a locally created entry uses 0xFFFF.
    EntryAssign {
        key: String,
        id: u16,
        seq: u32,
        flags: EntryFlags,
        value: Value,
    },
    /// Value change for an id-addressed entry.
    EntryUpdate { id: u16, seq: u32, value: Value },
    /// Flags replacement for an id-addressed entry.
    FlagsUpdate { id: u16, seq: u32, flags: EntryFlags },
    /// Entry removal.
    EntryDelete { id: u16 },
}

// ----------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------

/// Append a message's wire encoding to `buf`.
pub fn encode_message(message: &Message, buf: &mut BytesMut) {
    match message {
        Message::KeepAlive => buf.put_u8(tag::KEEP_ALIVE),
        Message::ClientHello { version } => {
            buf.put_u8(tag::CLIENT_HELLO);
            buf.put_u16(*version);
        }
        Message::ProtoUnsupported { supported } => {
            buf.put_u8(tag::PROTO_UNSUPPORTED);
            buf.put_u16(*supported);
        }
        Message::ServerHelloDone => buf.put_u8(tag::SERVER_HELLO_DONE),
        Message::EntryAssign {
            key,
            id,
            seq,
            flags,
            value,
        } => {
            buf.put_u8(tag::ENTRY_ASSIGN);
            encode_string(key, buf);
            buf.put_u16(*id);
            buf.put_u32(*seq);
            buf.put_u8(flags.bits());
            encode_value(value, buf);
        }
        Message::EntryUpdate { id, seq, value } => {
            buf.put_u8(tag::ENTRY_UPDATE);
            buf.put_u16(*id);
            buf.put_u32(*seq);
            encode_value(value, buf);
        }
        Message::FlagsUpdate { id, seq, flags } => {
            buf.put_u8(tag::FLAGS_UPDATE);
            buf.put_u16(*id);
            buf.put_u32(*seq);
            buf.put_u8(flags.bits());
        }
        Message::EntryDelete { id } => {
            buf.put_u8(tag::ENTRY_DELETE);
            buf.put_u16(*id);
        }
    }
}

fn encode_string(s: &str, buf: &mut BytesMut) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn encode_value(value: &Value, buf: &mut BytesMut) {
    buf.put_u8(value.entry_type() as u8);
    match value {
        Value::Boolean(v) => buf.put_u8(u8::from(*v)),
        Value::Double(v) => buf.put_f64(*v),
        Value::String(v) => encode_string(v, buf),
        Value::Raw(v) | Value::RpcDefinition(v) => {
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        Value::BooleanArray(v) => {
            buf.put_u32(v.len() as u32);
            for b in v {
                buf.put_u8(u8::from(*b));
            }
        }
        Value::DoubleArray(v) => {
            buf.put_u32(v.len() as u32);
            for d in v {
                buf.put_f64(*d);
            }
        }
        Value::StringArray(v) => {
            buf.put_u32(v.len() as u32);
            for s in v {
                encode_string(s, buf);
            }
        }
    }
}

// ----------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------

/// Buffered message writer over one stream half.
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Access the underlying stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Encode and write one message.
    pub async fn send(&mut self, message: &Message) -> TrellisResult<()> {
        self.buf.clear();
        encode_message(message, &mut self.buf);
        self.inner
            .write_all(&self.buf)
            .await
            .map_err(|e| TrellisError::transport(format!("write failed: {e}")))?;
        self.inner
            .flush()
            .await
            .map_err(|e| TrellisError::transport(format!("flush failed: {e}")))?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------

/// Message reader over one stream half. Reads exact byte counts; a closed
/// stream or short read surfaces as a transport error, malformed content
/// as a protocol error.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next message.
    pub async fn read_message(&mut self) -> TrellisResult<Message> {
        let tag = self.read_u8().await?;
        match tag {
            tag::KEEP_ALIVE => Ok(Message::KeepAlive),
            tag::CLIENT_HELLO => Ok(Message::ClientHello {
                version: self.read_u16().await?,
            }),
            tag::PROTO_UNSUPPORTED => Ok(Message::ProtoUnsupported {
                supported: self.read_u16().await?,
            }),
            tag::SERVER_HELLO_DONE => Ok(Message::ServerHelloDone),
            tag::ENTRY_ASSIGN => {
                let key = self.read_string().await?;
                let id = self.read_u16().await?;
                let seq = self.read_u32().await?;
                let flags = EntryFlags::from_bits_truncate(self.read_u8().await?);
                let value = self.read_value().await?;
                Ok(Message::EntryAssign {
                    key,
                    id,
                    seq,
                    flags,
                    value,
                })
            }
            tag::ENTRY_UPDATE => {
                let id = self.read_u16().await?;
                let seq = self.read_u32().await?;
                let value = self.read_value().await?;
                Ok(Message::EntryUpdate { id, seq, value })
            }
            tag::FLAGS_UPDATE => Ok(Message::FlagsUpdate {
                id: self.read_u16().await?,
                seq: self.read_u32().await?,
                flags: EntryFlags::from_bits_truncate(self.read_u8().await?),
            }),
            tag::ENTRY_DELETE => Ok(Message::EntryDelete {
                id: self.read_u16().await?,
            }),
            other => Err(TrellisError::protocol(format!(
                "unknown message tag {other:#04x}"
            ))),
        }
    }

    async fn read_value(&mut self) -> TrellisResult<Value> {
        let tag = self.read_u8().await?;
        let ty = EntryType::from_tag(tag)
            .ok_or_else(|| TrellisError::protocol(format!("unknown value tag {tag:#04x}")))?;
        match ty {
            EntryType::Boolean => Ok(Value::Boolean(self.read_bool().await?)),
            EntryType::Double => Ok(Value::Double(self.read_f64().await?)),
            EntryType::String => Ok(Value::String(self.read_string().await?)),
            EntryType::Raw => Ok(Value::Raw(self.read_bytes().await?.into())),
            EntryType::RpcDefinition => Ok(Value::RpcDefinition(self.read_bytes().await?.into())),
            EntryType::BooleanArray => {
                let count = self.read_len().await?;
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    out.push(self.read_bool().await?);
                }
                Ok(Value::BooleanArray(out))
            }
            EntryType::DoubleArray => {
                let count = self.read_len().await?;
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    out.push(self.read_f64().await?);
                }
                Ok(Value::DoubleArray(out))
            }
            EntryType::StringArray => {
                let count = self.read_len().await?;
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    out.push(self.read_string().await?);
                }
                Ok(Value::StringArray(out))
            }
        }
    }

    async fn read_u8(&mut self) -> TrellisResult<u8> {
        self.inner.read_u8().await.map_err(read_err)
    }

    async fn read_bool(&mut self) -> TrellisResult<bool> {
        match self.read_u8().await? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(TrellisError::protocol(format!(
                "invalid boolean byte {other:#04x}"
            ))),
        }
    }

    async fn read_u16(&mut self) -> TrellisResult<u16> {
        self.inner.read_u16().await.map_err(read_err)
    }

    async fn read_u32(&mut self) -> TrellisResult<u32> {
        self.inner.read_u32().await.map_err(read_err)
    }

    async fn read_f64(&mut self) -> TrellisResult<f64> {
        self.inner.read_f64().await.map_err(read_err)
    }

    async fn read_len(&mut self) -> TrellisResult<usize> {
        let len = self.read_u32().await?;
        if len > MAX_PAYLOAD {
            return Err(TrellisError::protocol(format!(
                "length {len} exceeds maximum {MAX_PAYLOAD}"
            )));
        }
        Ok(len as usize)
    }

    async fn read_bytes(&mut self) -> TrellisResult<Vec<u8>> {
        let len = self.read_len().await?;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await.map_err(read_err)?;
        Ok(buf)
    }

    async fn read_string(&mut self) -> TrellisResult<String> {
        let bytes = self.read_bytes().await?;
        String::from_utf8(bytes)
            .map_err(|_| TrellisError::protocol("string payload is not valid UTF-8"))
    }
}

fn read_err(e: std::io::Error) -> TrellisError {
    TrellisError::transport(format!("read failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn round_trip(message: Message) {
        let mut buf = BytesMut::new();
        encode_message(&message, &mut buf);
        let mut reader = FrameReader::new(&buf[..]);
        let decoded = reader.read_message().await.unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_control_messages() {
        round_trip(Message::KeepAlive).await;
        round_trip(Message::ClientHello {
            version: PROTOCOL_VERSION,
        })
        .await;
        round_trip(Message::ProtoUnsupported { supported: 0x0300 }).await;
        round_trip(Message::ServerHelloDone).await;
        round_trip(Message::EntryDelete { id: 17 }).await;
        round_trip(Message::FlagsUpdate {
            id: 3,
            seq: 9,
            flags: EntryFlags::PERSISTENT,
        })
        .await;
    }

    #[tokio::test]
    async fn test_entry_assign_with_each_value_shape() {
        for value in [
            Value::Boolean(true),
            Value::Double(-2.25),
            Value::String("grid/cell".to_string()),
            Value::Raw(Bytes::from_static(b"\x00\x01\x02")),
            Value::BooleanArray(vec![true, false, true]),
            Value::DoubleArray(vec![0.5, -1.0]),
            Value::StringArray(vec!["a".to_string(), String::new()]),
            Value::RpcDefinition(Bytes::from_static(b"rpc")),
        ] {
            round_trip(Message::EntryAssign {
                key: "/status/mode".to_string(),
                id: 42,
                seq: 7,
                flags: EntryFlags::PERSISTENT,
                value,
            })
            .await;
        }
    }

    #[tokio::test]
    async fn test_multiple_messages_in_sequence() {
        let mut buf = BytesMut::new();
        encode_message(&Message::KeepAlive, &mut buf);
        encode_message(
            &Message::EntryUpdate {
                id: 1,
                seq: 2,
                value: Value::Double(3.0),
            },
            &mut buf,
        );
        let mut reader = FrameReader::new(&buf[..]);
        assert_eq!(reader.read_message().await.unwrap(), Message::KeepAlive);
        assert!(matches!(
            reader.read_message().await.unwrap(),
            Message::EntryUpdate { id: 1, seq: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_message_tag_is_protocol_error() {
        let buf = [0x7Fu8];
        let mut reader = FrameReader::new(&buf[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, TrellisError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_unknown_value_tag_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x11); // EntryUpdate
        buf.put_u16(1);
        buf.put_u32(1);
        buf.put_u8(0x03); // not a value tag
        let mut reader = FrameReader::new(&buf[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, TrellisError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_oversized_length_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x10); // EntryAssign
        buf.put_u32(MAX_PAYLOAD + 1); // key length
        let mut reader = FrameReader::new(&buf[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, TrellisError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x10); // EntryAssign
        buf.put_u32(2);
        buf.put_slice(&[0xFF, 0xFE]);
        buf.put_u16(0);
        buf.put_u32(1);
        buf.put_u8(0);
        buf.put_u8(0x01); // boolean
        buf.put_u8(1);
        let mut reader = FrameReader::new(&buf[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, TrellisError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_truncated_message_is_transport_error() {
        let mut full = BytesMut::new();
        encode_message(
            &Message::EntryUpdate {
                id: 1,
                seq: 2,
                value: Value::Double(3.0),
            },
            &mut full,
        );
        let truncated = &full[..full.len() - 3];
        let mut reader = FrameReader::new(truncated);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, TrellisError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_invalid_boolean_byte_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x11); // EntryUpdate
        buf.put_u16(1);
        buf.put_u32(1);
        buf.put_u8(0x01); // boolean value
        buf.put_u8(2);
        let mut reader = FrameReader::new(&buf[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, TrellisError::Protocol { .. }));
    }
}
