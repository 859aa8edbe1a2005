//! Shared writer for a command connection

use crate::codec::CodecError;
use crate::messages::ControlMessage;
use crate::HEARTBEAT;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a command connection.
///
/// Clones share the same socket. Writes are serialized so a heartbeat can
/// never interleave with a message.
#[derive(Clone)]
pub struct CommandLink {
    writer: Arc<Mutex<Writer>>,
    peer: SocketAddr,
}

impl CommandLink {
    pub fn new(writer: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self::from_writer(writer, peer)
    }

    /// Wrap any writer, e.g. one half of an in-memory duplex in tests
    pub fn from_writer<W>(writer: W, peer: SocketAddr) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Encode and write one message
    pub async fn send(&self, message: &ControlMessage) -> Result<(), CodecError> {
        let bytes = message.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(HEARTBEAT).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down the write side. The peer sees end of stream.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// True when both handles write to the same connection
    pub fn same_connection(&self, other: &CommandLink) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }
}

impl std::fmt::Debug for CommandLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLink")
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ControlCodec, Inbound};
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn test_send_and_heartbeat_are_read_back_in_order() {
        let (client, server) = tokio::io::duplex(1024);
        let link = CommandLink::from_writer(client, "127.0.0.1:1".parse().unwrap());

        link.send(&ControlMessage::ConnectionRequest { tunnel_id: 3001 })
            .await
            .unwrap();
        link.heartbeat().await.unwrap();
        link.send(&ControlMessage::TunnelClosed { tunnel_id: 3001 })
            .await
            .unwrap();
        link.shutdown().await;

        let mut reader = FramedRead::new(server, ControlCodec::new());
        assert!(matches!(
            reader.next().await,
            Some(Ok(Inbound::Message(ControlMessage::ConnectionRequest { tunnel_id: 3001 })))
        ));
        assert!(matches!(reader.next().await, Some(Ok(Inbound::Heartbeat))));
        assert!(matches!(
            reader.next().await,
            Some(Ok(Inbound::Message(ControlMessage::TunnelClosed { tunnel_id: 3001 })))
        ));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn test_clones_share_the_connection() {
        let (client, _server) = tokio::io::duplex(64);
        let link = CommandLink::from_writer(client, "127.0.0.1:1".parse().unwrap());
        let clone = link.clone();
        assert!(link.same_connection(&clone));

        let (other, _server2) = tokio::io::duplex(64);
        let other = CommandLink::from_writer(other, "127.0.0.1:2".parse().unwrap());
        assert!(!link.same_connection(&other));
    }
}
