//! Control message types exchanged over the command connection

use crate::codec::CodecError;
use std::fmt;

/// Maximum length in bytes of any length-prefixed string on the wire
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Wire identifiers for each message variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0,
    TunnelRequest = 1,
    ConnectionRequest = 2,
    TunnelClosed = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Handshake),
            1 => Ok(MessageType::TunnelRequest),
            2 => Ok(MessageType::ConnectionRequest),
            3 => Ok(MessageType::TunnelClosed),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

/// What the agent should connect to on its side of a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TunnelTarget {
    /// A TCP service reachable from the agent
    Tcp { hostname: String, port: u16 },
    /// A serial device attached to the agent
    Serial { name: String, baudrate: u32 },
}

impl TunnelTarget {
    pub(crate) const PROTO_TCP: u8 = 0;
    pub(crate) const PROTO_SERIAL: u8 = 1;

    /// Build a TCP target, rejecting names that do not fit the wire format
    pub fn tcp(hostname: impl Into<String>, port: u16) -> Result<Self, CodecError> {
        let hostname = hostname.into();
        check_name_len(&hostname)?;
        Ok(TunnelTarget::Tcp { hostname, port })
    }

    /// Build a serial target, rejecting names that do not fit the wire format
    pub fn serial(name: impl Into<String>, baudrate: u32) -> Result<Self, CodecError> {
        let name = name.into();
        check_name_len(&name)?;
        Ok(TunnelTarget::Serial { name, baudrate })
    }

    /// Build a target from loosely specified fields.
    ///
    /// Either `hostname` and `port`, or `serial_name` and `baudrate` must be
    /// present. Empty strings and zero values count as missing. When both
    /// groups are complete the TCP target wins.
    pub fn from_parts(
        hostname: Option<&str>,
        port: Option<u16>,
        serial_name: Option<&str>,
        baudrate: Option<u32>,
    ) -> Result<Self, CodecError> {
        let hostname = hostname.filter(|h| !h.is_empty());
        let port = port.filter(|p| *p != 0);
        let serial_name = serial_name.filter(|s| !s.is_empty());
        let baudrate = baudrate.filter(|b| *b != 0);

        match (hostname, port, serial_name, baudrate) {
            (Some(host), Some(port), _, _) => Self::tcp(host, port),
            (_, _, Some(name), Some(rate)) => Self::serial(name, rate),
            _ => Err(CodecError::InvalidParameters),
        }
    }

    pub(crate) fn proto(&self) -> u8 {
        match self {
            TunnelTarget::Tcp { .. } => Self::PROTO_TCP,
            TunnelTarget::Serial { .. } => Self::PROTO_SERIAL,
        }
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelTarget::Tcp { hostname, port } => write!(f, "tcp://{}:{}", hostname, port),
            TunnelTarget::Serial { name, baudrate } => write!(f, "serial://{}@{}", name, baudrate),
        }
    }
}

/// A control message carried on the command connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Sent once by an agent right after connecting
    Handshake { hw_id: u64, name: String },
    /// Broker asks the agent to open a tunnel. The communicate port is also the tunnel id.
    TunnelRequest {
        communicate_port: u16,
        ssl: bool,
        target: TunnelTarget,
    },
    /// Broker asks for one more connection pair under an open tunnel
    ConnectionRequest { tunnel_id: u16 },
    /// Either side announces a tunnel was torn down
    TunnelClosed { tunnel_id: u16 },
}

impl ControlMessage {
    /// Build a handshake, rejecting device names longer than 255 bytes
    pub fn handshake(hw_id: u64, name: impl Into<String>) -> Result<Self, CodecError> {
        let name = name.into();
        check_name_len(&name)?;
        Ok(ControlMessage::Handshake { hw_id, name })
    }

    pub fn tunnel_request(communicate_port: u16, ssl: bool, target: TunnelTarget) -> Self {
        ControlMessage::TunnelRequest {
            communicate_port,
            ssl,
            target,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            ControlMessage::Handshake { .. } => MessageType::Handshake,
            ControlMessage::TunnelRequest { .. } => MessageType::TunnelRequest,
            ControlMessage::ConnectionRequest { .. } => MessageType::ConnectionRequest,
            ControlMessage::TunnelClosed { .. } => MessageType::TunnelClosed,
        }
    }
}

pub(crate) fn check_name_len(name: &str) -> Result<(), CodecError> {
    if name.len() > MAX_NAME_LEN {
        return Err(CodecError::NameTooLong(name.len()));
    }
    Ok(())
}
