//! Tunnelbay Control Protocol
//!
//! This crate defines the binary control messages exchanged between the
//! broker and its agents, the stream decoder used to read them, and the
//! shared writer used to send them.

pub mod codec;
pub mod link;
pub mod messages;

pub use codec::{frame_len, CodecError, ControlCodec, Inbound};
pub use link::CommandLink;
pub use messages::*;

/// Protocol version carried in every message header
pub const PROTOCOL_VERSION: u8 = 10;

/// Liveness ping written on the command connection between messages
pub const HEARTBEAT: &[u8] = b"0\n";
