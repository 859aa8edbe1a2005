//! Agent side of a tunnel: local target connections relayed to the broker

use crate::config::AgentConfig;
use crate::AgentError;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};
use tunnelbay_proto::TunnelTarget;
use tunnelbay_relay::{BoxedConnection, IdleCallback, Relay, RelayHandle};

/// A tunnel this agent serves, keyed by its id (the broker's communicate port)
#[derive(Debug, Clone)]
pub(crate) struct LocalTunnel {
    id: u16,
    target: TunnelTarget,
    relay: RelayHandle,
}

impl LocalTunnel {
    /// Open the local target and start a relay with no pairs yet. The
    /// caller registers the tunnel before [`connect`](Self::connect) dials
    /// back, so broker messages reacting to the dial-back find it.
    pub(crate) async fn prepare(
        config: &AgentConfig,
        id: u16,
        target: TunnelTarget,
        on_idle: IdleCallback,
    ) -> Result<(Self, BoxedConnection), AgentError> {
        info!(tunnel_id = id, %target, "Opening local tunnel");

        let local = connect_target(config, &target).await?;
        let relay = Relay::spawn(config.relay_config(), Some(on_idle));
        Ok((Self { id, target, relay }, local))
    }

    /// Dial the broker and relay it with `local`
    pub(crate) async fn connect(
        &self,
        config: &AgentConfig,
        local: BoxedConnection,
    ) -> Result<(), AgentError> {
        let remote = connect_broker(config, self.id).await?;
        self.relay.add_pair(remote, local)?;

        debug!(tunnel_id = self.id, "Local tunnel relaying");
        Ok(())
    }

    /// Serve one more customer on this tunnel
    pub(crate) async fn add_connection(&self, config: &AgentConfig) -> Result<(), AgentError> {
        if let TunnelTarget::Serial { name, .. } = &self.target {
            return Err(AgentError::SerialBusy(name.clone()));
        }

        let local = connect_target(config, &self.target).await?;
        self.connect(config, local).await?;

        debug!(
            tunnel_id = self.id,
            connections = self.relay.connection_count(),
            "Added tunnel connection"
        );
        Ok(())
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    /// Serial targets carry exactly one connection
    pub(crate) fn is_single_connection(&self) -> bool {
        matches!(self.target, TunnelTarget::Serial { .. })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.relay.is_closed()
    }

    /// Resolves once every relayed pair has closed, or the relay has
    pub(crate) async fn drained(&self) {
        self.relay.emptied().await;
    }

    /// Forced close; the idle callback does not run
    pub(crate) fn close(&self) {
        self.relay.close();
    }
}

async fn connect_target(
    config: &AgentConfig,
    target: &TunnelTarget,
) -> Result<BoxedConnection, AgentError> {
    match target {
        TunnelTarget::Tcp { hostname, port } => {
            let address = format!("{hostname}:{port}");
            let stream = dial(&address, config).await?;
            Ok(Box::new(stream))
        }
        TunnelTarget::Serial { name, baudrate } => {
            let port = tokio_serial::new(name.as_str(), *baudrate)
                .open_native_async()
                .map_err(|source| AgentError::Serial {
                    name: name.clone(),
                    source,
                })?;
            Ok(Box::new(port))
        }
    }
}

async fn connect_broker(config: &AgentConfig, port: u16) -> Result<BoxedConnection, AgentError> {
    let address = format!("{}:{}", config.broker_host, port);
    let stream = dial(&address, config).await?;
    Ok(Box::new(stream))
}

pub(crate) async fn dial(address: &str, config: &AgentConfig) -> Result<TcpStream, AgentError> {
    let connect_failed = |source| AgentError::ConnectionFailed {
        address: address.to_string(),
        source,
    };

    let stream = timeout(config.connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            connect_failed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })?
        .map_err(connect_failed)?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
