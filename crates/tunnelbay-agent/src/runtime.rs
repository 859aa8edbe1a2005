//! Command connection lifecycle and message dispatch

use crate::backoff::Backoff;
use crate::config::AgentConfig;
use crate::tunnel::{self, LocalTunnel};
use crate::AgentError;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tunnelbay_proto::{CommandLink, ControlCodec, ControlMessage, Inbound, TunnelTarget};
use tunnelbay_relay::IdleCallback;

type Frames = FramedRead<OwnedReadHalf, ControlCodec>;

enum Disconnect {
    Shutdown,
    Lost(String),
}

/// The agent: one command connection to the broker plus the local tunnels
/// it serves. Local tunnels outlive a lost command connection.
#[derive(Clone)]
pub struct AgentRuntime {
    shared: Arc<Shared>,
}

struct Shared {
    config: AgentConfig,
    hw_id: u64,
    name: String,
    handshake: ControlMessage,
    link: Mutex<Option<CommandLink>>,
    tunnels: DashMap<u16, LocalTunnel>,
}

impl AgentRuntime {
    /// Fails if the agent name does not fit in a handshake
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let hw_id = config.resolved_hw_id();
        let name = config.resolved_name();
        let handshake = ControlMessage::handshake(hw_id, name.clone())?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                hw_id,
                name,
                handshake,
                link: Mutex::new(None),
                tunnels: DashMap::new(),
            }),
        })
    }

    pub fn hw_id(&self) -> u64 {
        self.shared.hw_id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_connected(&self) -> bool {
        self.shared.current_link().is_some()
    }

    /// Ids of the local tunnels being served, ascending
    pub fn tunnel_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.shared.tunnels.iter().map(|t| *t.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Stay connected to the broker until `shutdown` is cancelled, then close
    /// every local tunnel.
    pub async fn run(&self, shutdown: CancellationToken) {
        let config = &self.shared.config;
        let mut backoff = Backoff::new(config.reconnect.clone());
        info!(
            hw_id = self.shared.hw_id,
            name = %self.shared.name,
            broker = %config.broker_addr(),
            "Agent starting"
        );

        loop {
            let connected = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(frames) => {
                    backoff.reset();
                    let disconnect = self.serve(frames, &shutdown).await;
                    self.shared.drop_link().await;
                    match disconnect {
                        Disconnect::Shutdown => break,
                        Disconnect::Lost(reason) => {
                            warn!(%reason, "Lost connection to broker");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt = backoff.attempt() + 1,
                        "Failed to connect to broker"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = backoff.wait() => {}
            }
        }

        self.shared.drop_link().await;
        self.shared.close_all();
        info!(hw_id = self.shared.hw_id, "Agent stopped");
    }

    async fn connect(&self) -> Result<Frames, AgentError> {
        let config = &self.shared.config;
        let address = config.broker_addr();

        let stream = tunnel::dial(&address, config).await?;
        let peer = stream
            .peer_addr()
            .map_err(|source| AgentError::ConnectionFailed { address, source })?;
        let (reader, writer) = stream.into_split();

        let link = CommandLink::new(writer, peer);
        link.send(&self.shared.handshake).await?;
        *self.shared.link.lock().unwrap_or_else(|e| e.into_inner()) = Some(link);

        info!(hw_id = self.shared.hw_id, %peer, "Connected to broker");
        Ok(FramedRead::new(reader, ControlCodec::new()))
    }

    async fn serve(&self, mut frames: Frames, shutdown: &CancellationToken) -> Disconnect {
        let session = shutdown.child_token();
        let _stop_heartbeat = session.clone().drop_guard();
        if let Some(link) = self.shared.current_link() {
            tokio::spawn(heartbeat(
                link,
                self.shared.config.heartbeat_interval,
                session,
            ));
        }

        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Disconnect::Shutdown,
                frame = frames.next() => frame,
            };

            match frame {
                None => return Disconnect::Lost("connection closed by broker".to_string()),
                Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                Some(Ok(Inbound::Heartbeat)) => trace!("Heartbeat from broker"),
                Some(Ok(Inbound::Malformed(e))) => {
                    warn!(error = %e, "Dropping malformed message from broker");
                }
                Some(Ok(Inbound::Message(message))) => self.dispatch(message),
            }
        }
    }

    fn dispatch(&self, message: ControlMessage) {
        match message {
            ControlMessage::TunnelRequest {
                communicate_port,
                ssl,
                target,
            } => {
                if ssl {
                    warn!(
                        tunnel_id = communicate_port,
                        "TLS requested but not supported by this agent, relaying plain bytes"
                    );
                }
                let shared = self.shared.clone();
                tokio::spawn(async move { shared.open_tunnel(communicate_port, target).await });
            }
            ControlMessage::ConnectionRequest { tunnel_id } => {
                let tunnel = self
                    .shared
                    .tunnels
                    .get(&tunnel_id)
                    .map(|t| t.clone())
                    .filter(|t| !t.is_closed());
                let Some(tunnel) = tunnel else {
                    warn!(tunnel_id, "Connection requested for unknown tunnel");
                    return;
                };
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    match tunnel.add_connection(&shared.config).await {
                        Ok(()) => {}
                        Err(AgentError::SerialBusy(name)) => {
                            debug!(tunnel_id, port = %name, "Ignoring connection request for serial tunnel");
                        }
                        Err(e) => {
                            warn!(tunnel_id, error = %e, "Failed to add tunnel connection");
                        }
                    }
                });
            }
            ControlMessage::TunnelClosed { tunnel_id } => {
                match self.shared.tunnels.remove(&tunnel_id) {
                    Some((_, tunnel)) => {
                        tunnel.close();
                        info!(tunnel_id, "Tunnel closed by broker");
                    }
                    None => debug!(tunnel_id, "Broker closed a tunnel we do not serve"),
                }
            }
            ControlMessage::Handshake { hw_id, .. } => {
                warn!(hw_id, "Ignoring handshake sent by broker");
            }
        }
    }
}

impl Shared {
    fn current_link(&self) -> Option<CommandLink> {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn drop_link(&self) {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(link) = link {
            link.shutdown().await;
        }
    }

    async fn open_tunnel(self: Arc<Self>, id: u16, target: TunnelTarget) {
        let weak = Arc::downgrade(&self);
        let on_idle: IdleCallback = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                tokio::spawn(async move { shared.finished(id).await });
            }
        });

        let (tunnel, local) = match LocalTunnel::prepare(&self.config, id, target, on_idle).await
        {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(tunnel_id = id, error = %e, "Tunnel setup failed");
                self.notify_closed(id).await;
                return;
            }
        };

        if let Some(stale) = self.tunnels.insert(id, tunnel.clone()) {
            stale.close();
        }

        if let Err(e) = tunnel.connect(&self.config, local).await {
            if tunnel.is_closed() {
                debug!(tunnel_id = id, "Tunnel closed during setup");
            } else {
                warn!(tunnel_id = id, error = %e, "Tunnel setup failed");
                tunnel.close();
            }
            self.finished(id).await;
            return;
        }
        info!(tunnel_id = id, "Tunnel open");

        if tunnel.is_single_connection() {
            tokio::spawn(async move {
                tunnel.drained().await;
                tunnel.close();
                self.finished(id).await;
            });
        }
    }

    /// Drop a tunnel whose relay has closed and tell the broker. Does
    /// nothing if the tunnel is already gone, e.g. closed by the broker.
    async fn finished(&self, id: u16) {
        if self
            .tunnels
            .remove_if(&id, |_, tunnel| tunnel.is_closed())
            .is_some()
        {
            info!(tunnel_id = id, "Tunnel ended");
            self.notify_closed(id).await;
        }
    }

    async fn notify_closed(&self, id: u16) {
        let Some(link) = self.current_link() else {
            debug!(tunnel_id = id, "Not connected, cannot report closed tunnel");
            return;
        };
        if let Err(e) = link.send(&ControlMessage::TunnelClosed { tunnel_id: id }).await {
            warn!(tunnel_id = id, error = %e, "Failed to report closed tunnel");
        }
    }

    fn close_all(&self) {
        let ids: Vec<u16> = self.tunnels.iter().map(|t| *t.key()).collect();
        for id in ids {
            if let Some((_, tunnel)) = self.tunnels.remove(&id) {
                tunnel.close();
            }
        }
    }
}

/// Send a heartbeat every `period` until `stop` is cancelled or the link fails
async fn heartbeat(link: CommandLink, period: std::time::Duration, stop: CancellationToken) {
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = ticks.tick() => {
                if let Err(e) = link.heartbeat().await {
                    debug!(error = %e, "Heartbeat failed");
                    return;
                }
                trace!("Heartbeat sent");
            }
        }
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("hw_id", &self.shared.hw_id)
            .field("name", &self.shared.name)
            .field("connected", &self.is_connected())
            .field("tunnels", &self.tunnel_ids())
            .finish()
    }
}
