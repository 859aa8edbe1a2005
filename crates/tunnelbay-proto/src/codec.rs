//! Codec for encoding/decoding control messages
//!
//! Wire format (little-endian):
//!
//! ```text
//! header:             version: u8, type: u8
//! Handshake:          hw_id: u64, name_len: u8, name
//! TunnelRequest:      communicate_port: u16, proto: u8, ssl: u8,
//!                       proto 0 (TCP):    port: u16, host_len: u8, host
//!                       proto 1 (Serial): baudrate: u32, name_len: u8, name
//! ConnectionRequest:  tunnel_id: u16
//! TunnelClosed:       tunnel_id: u16
//! ```
//!
//! There is no overall length prefix. [`ControlCodec`] reassembles frames
//! from a byte stream by reading the self-describing layout instead.

use crate::messages::{check_name_len, ControlMessage, MessageType, TunnelTarget};
use crate::{HEARTBEAT, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unknown tunnel target kind: {0}")]
    UnknownTargetKind(u8),

    #[error("Truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unexpected {0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("Name is too long: {0} bytes (max 255)")]
    NameTooLong(usize),

    #[error("Name is not valid UTF-8")]
    InvalidUtf8,

    #[error("Tunnel target needs either hostname and port, or serial name and baudrate")]
    InvalidParameters,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

const HEADER_LEN: usize = 2;

impl ControlMessage {
    /// Encode the message with its header
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 16);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.message_type() as u8);

        match self {
            ControlMessage::Handshake { hw_id, name } => {
                buf.put_u64_le(*hw_id);
                put_name(&mut buf, name)?;
            }
            ControlMessage::TunnelRequest {
                communicate_port,
                ssl,
                target,
            } => {
                buf.put_u16_le(*communicate_port);
                buf.put_u8(target.proto());
                buf.put_u8(u8::from(*ssl));
                match target {
                    TunnelTarget::Tcp { hostname, port } => {
                        buf.put_u16_le(*port);
                        put_name(&mut buf, hostname)?;
                    }
                    TunnelTarget::Serial { name, baudrate } => {
                        buf.put_u32_le(*baudrate);
                        put_name(&mut buf, name)?;
                    }
                }
            }
            ControlMessage::ConnectionRequest { tunnel_id }
            | ControlMessage::TunnelClosed { tunnel_id } => {
                buf.put_u16_le(*tunnel_id);
            }
        }

        Ok(buf.freeze())
    }

    /// Decode exactly one message.
    ///
    /// The slice must hold the whole message and nothing else. A version
    /// mismatch is logged but not rejected.
    pub fn decode(bytes: &[u8]) -> Result<ControlMessage, CodecError> {
        let mut reader = Reader::new(bytes);
        let version = reader.u8()?;
        let kind = MessageType::try_from(reader.u8()?)?;

        if version != PROTOCOL_VERSION {
            tracing::warn!(
                remote_version = version,
                local_version = PROTOCOL_VERSION,
                "Control protocol version mismatch"
            );
        }

        let message = match kind {
            MessageType::Handshake => {
                let hw_id = reader.u64()?;
                let name = reader.string()?;
                ControlMessage::Handshake { hw_id, name }
            }
            MessageType::TunnelRequest => {
                let communicate_port = reader.u16()?;
                let proto = reader.u8()?;
                let ssl = reader.u8()? != 0;
                let target = match proto {
                    TunnelTarget::PROTO_TCP => {
                        let port = reader.u16()?;
                        let hostname = reader.string()?;
                        TunnelTarget::Tcp { hostname, port }
                    }
                    TunnelTarget::PROTO_SERIAL => {
                        let baudrate = reader.u32()?;
                        let name = reader.string()?;
                        TunnelTarget::Serial { name, baudrate }
                    }
                    other => return Err(CodecError::UnknownTargetKind(other)),
                };
                ControlMessage::TunnelRequest {
                    communicate_port,
                    ssl,
                    target,
                }
            }
            MessageType::ConnectionRequest => ControlMessage::ConnectionRequest {
                tunnel_id: reader.u16()?,
            },
            MessageType::TunnelClosed => ControlMessage::TunnelClosed {
                tunnel_id: reader.u16()?,
            },
        };

        match reader.remaining() {
            0 => Ok(message),
            extra => Err(CodecError::TrailingBytes(extra)),
        }
    }
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<(), CodecError> {
    check_name_len(name)?;
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    Ok(())
}

/// Bounds-checked little-endian reader over a byte slice
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(bytes))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

/// Length of the message at the start of `buf`.
///
/// Returns `Ok(None)` while not enough bytes have arrived to tell, and an
/// error when the header or target kind can never form a valid message.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    // Offsets below are absolute positions in the frame.
    let len = match MessageType::try_from(buf[1])? {
        MessageType::Handshake => match buf.get(10) {
            Some(name_len) => 11 + *name_len as usize,
            None => return Ok(None),
        },
        MessageType::TunnelRequest => match buf.get(4) {
            Some(&TunnelTarget::PROTO_TCP) => match buf.get(8) {
                Some(host_len) => 9 + *host_len as usize,
                None => return Ok(None),
            },
            Some(&TunnelTarget::PROTO_SERIAL) => match buf.get(10) {
                Some(name_len) => 11 + *name_len as usize,
                None => return Ok(None),
            },
            Some(other) => return Err(CodecError::UnknownTargetKind(*other)),
            None => return Ok(None),
        },
        MessageType::ConnectionRequest | MessageType::TunnelClosed => HEADER_LEN + 2,
    };

    Ok(Some(len))
}

/// One item read from a command connection
#[derive(Debug)]
pub enum Inbound {
    /// Liveness ping carrying no message
    Heartbeat,
    /// A decoded control message
    Message(ControlMessage),
    /// Bytes that could not be decoded. They have been discarded.
    Malformed(CodecError),
}

/// Stream decoder for command connections.
///
/// Malformed input never ends the stream: the buffered bytes are dropped
/// and [`Inbound::Malformed`] is yielded so the caller can log it and keep
/// reading.
#[derive(Debug, Default)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ControlCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, CodecError> {
        if src.starts_with(HEARTBEAT) {
            src.advance(HEARTBEAT.len());
            return Ok(Some(Inbound::Heartbeat));
        }

        match frame_len(src) {
            Ok(None) => Ok(None),
            Ok(Some(len)) if src.len() < len => {
                src.reserve(len - src.len());
                Ok(None)
            }
            Ok(Some(len)) => {
                let frame = src.split_to(len);
                match ControlMessage::decode(&frame) {
                    Ok(message) => Ok(Some(Inbound::Message(message))),
                    Err(e) => Ok(Some(Inbound::Malformed(e))),
                }
            }
            Err(e) => {
                src.clear();
                Ok(Some(Inbound::Malformed(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<ControlMessage> {
        vec![
            ControlMessage::handshake(0, "").unwrap(),
            ControlMessage::handshake(u64::MAX, "n".repeat(255)).unwrap(),
            ControlMessage::handshake(1235, "test device").unwrap(),
            ControlMessage::tunnel_request(0, false, TunnelTarget::tcp("", 0).unwrap()),
            ControlMessage::tunnel_request(
                u16::MAX,
                true,
                TunnelTarget::tcp("h".repeat(255), u16::MAX).unwrap(),
            ),
            ControlMessage::tunnel_request(666, false, TunnelTarget::serial("com21", 321).unwrap()),
            ControlMessage::tunnel_request(
                3001,
                true,
                TunnelTarget::serial("/dev/ttyUSB0", u32::MAX).unwrap(),
            ),
            ControlMessage::tunnel_request(3001, false, TunnelTarget::serial("", 0).unwrap()),
            ControlMessage::ConnectionRequest { tunnel_id: 0 },
            ControlMessage::ConnectionRequest {
                tunnel_id: u16::MAX,
            },
            ControlMessage::TunnelClosed { tunnel_id: 12345 },
            ControlMessage::TunnelClosed {
                tunnel_id: u16::MAX,
            },
        ]
    }

    #[test]
    fn test_encode_decode() {
        for msg in all_variants() {
            let encoded = msg.encode().unwrap();
            let decoded = ControlMessage::decode(&encoded).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_known_layouts() {
        let encoded = ControlMessage::TunnelClosed { tunnel_id: 0x1234 }
            .encode()
            .unwrap();
        assert_eq!(&encoded[..], &[PROTOCOL_VERSION, 3, 0x34, 0x12]);

        let encoded = ControlMessage::handshake(1, "ab").unwrap().encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[PROTOCOL_VERSION, 0, 1, 0, 0, 0, 0, 0, 0, 0, 2, b'a', b'b']
        );

        let encoded = ControlMessage::tunnel_request(
            3000,
            true,
            TunnelTarget::tcp("h", 22).unwrap(),
        )
        .encode()
        .unwrap();
        assert_eq!(
            &encoded[..],
            &[PROTOCOL_VERSION, 1, 0xB8, 0x0B, 0, 1, 22, 0, 1, b'h']
        );
    }

    #[test]
    fn test_encode_rejects_long_name() {
        let msg = ControlMessage::Handshake {
            hw_id: 7,
            name: "x".repeat(256),
        };
        assert!(matches!(msg.encode(), Err(CodecError::NameTooLong(256))));

        let msg = ControlMessage::TunnelRequest {
            communicate_port: 3000,
            ssl: false,
            target: TunnelTarget::Tcp {
                hostname: "x".repeat(300),
                port: 22,
            },
        };
        assert!(matches!(msg.encode(), Err(CodecError::NameTooLong(300))));
    }

    #[test]
    fn test_decode_rejects_every_truncation() {
        for msg in all_variants() {
            let encoded = msg.encode().unwrap();
            for cut in 0..encoded.len() {
                let result = ControlMessage::decode(&encoded[..cut]);
                assert!(
                    matches!(result, Err(CodecError::Truncated { .. })),
                    "prefix of {} bytes of {:?} decoded as {:?}",
                    cut,
                    msg,
                    result
                );
            }
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = ControlMessage::TunnelClosed { tunnel_id: 1 }
            .encode()
            .unwrap()
            .to_vec();
        bytes.push(0);
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_target() {
        assert!(matches!(
            ControlMessage::decode(&[PROTOCOL_VERSION, 9, 0, 0]),
            Err(CodecError::UnknownMessageType(9))
        ));

        let bytes = [PROTOCOL_VERSION, 1, 0xB8, 0x0B, 7, 0, 22, 0, 0];
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(CodecError::UnknownTargetKind(7))
        ));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let bytes = [PROTOCOL_VERSION, 0, 1, 0, 0, 0, 0, 0, 0, 0, 2, 0xFF, 0xFE];
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(CodecError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_decode_tolerates_version_mismatch() {
        let bytes = [PROTOCOL_VERSION + 1, 2, 0x39, 0x30];
        let decoded = ControlMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, ControlMessage::ConnectionRequest { tunnel_id: 12345 });
    }

    #[test]
    fn test_frame_len_matches_encoding() {
        for msg in all_variants() {
            let encoded = msg.encode().unwrap();
            assert_eq!(frame_len(&encoded).unwrap(), Some(encoded.len()));
        }
    }

    #[test]
    fn test_stream_decoder_reassembles_split_frames() {
        let first = ControlMessage::tunnel_request(
            3005,
            false,
            TunnelTarget::tcp("10.0.0.5", 22).unwrap(),
        );
        let second = ControlMessage::TunnelClosed { tunnel_id: 3005 };

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&first.encode().unwrap());
        wire.extend_from_slice(HEARTBEAT);
        wire.extend_from_slice(&second.encode().unwrap());

        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        let mut items = Vec::new();

        // Feed one byte at a time
        for byte in wire.iter() {
            buf.put_u8(*byte);
            while let Some(item) = codec.decode(&mut buf).unwrap() {
                items.push(item);
            }
        }

        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], Inbound::Message(m) if *m == first));
        assert!(matches!(&items[1], Inbound::Heartbeat));
        assert!(matches!(&items[2], Inbound::Message(m) if *m == second));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stream_decoder_drops_garbage_and_continues() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from(&[PROTOCOL_VERSION, 42, 1, 2, 3][..]);

        let item = codec.decode(&mut buf).unwrap();
        assert!(matches!(
            item,
            Some(Inbound::Malformed(CodecError::UnknownMessageType(42)))
        ));
        assert!(buf.is_empty());

        let valid = ControlMessage::ConnectionRequest { tunnel_id: 3100 };
        buf.extend_from_slice(&valid.encode().unwrap());
        let item = codec.decode(&mut buf).unwrap();
        assert!(matches!(item, Some(Inbound::Message(m)) if m == valid));
    }

    #[test]
    fn test_stream_decoder_reports_bad_utf8_without_losing_next_frame() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from(&[PROTOCOL_VERSION, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0xFF][..]);
        let closed = ControlMessage::TunnelClosed { tunnel_id: 9 };
        buf.extend_from_slice(&closed.encode().unwrap());

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Malformed(CodecError::InvalidUtf8))
        ));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Message(m)) if m == closed
        ));
    }
}
