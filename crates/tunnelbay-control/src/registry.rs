//! Agent registry for tracking agents and the tunnels opened to them
//!
//! Agents connect to the broker, introduce themselves with a handshake and
//! keep the command connection open. The registry tracks each agent's
//! liveness, routes control messages coming from it, and exposes the
//! administrative operations (open/close tunnels, list/remove agents).

use crate::agent::{AgentEntry, AgentRecord, AgentStatus, StatusChange};
use crate::config::BrokerConfig;
use crate::context::BrokerContext;
use crate::options::{TunnelInfo, TunnelOptions};
use crate::store::{AgentStore, StoreError};
use crate::tunnel::{Tunnel, TunnelClosedCallback, TunnelError, TunnelStatus};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};
use tunnelbay_proto::{CodecError, CommandLink, ControlCodec, ControlMessage, Inbound};

#[derive(Debug, Error)]
pub enum OpenTunnelError {
    #[error("Unknown agent {0}")]
    UnknownAgent(u64),

    #[error("Agent {0} is offline")]
    AgentOffline(u64),

    #[error("Invalid tunnel target: {0}")]
    InvalidTarget(#[from] CodecError),

    #[error("Tunnel setup failed: {0}")]
    Failed(#[from] TunnelError),
}

/// An open tunnel as reported to administrative callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenTunnel {
    pub id: u16,
    pub port: u16,
    pub options: TunnelOptions,
    pub connections: usize,
}

type CommandReader = FramedRead<OwnedReadHalf, ControlCodec>;

/// Registry of agents and open tunnels.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct AgentRegistry {
    ctx: Arc<BrokerContext>,
}

impl AgentRegistry {
    /// Build a registry knowing every agent in `store`. All start offline.
    pub async fn load(
        config: BrokerConfig,
        store: Arc<dyn AgentStore>,
    ) -> Result<Self, StoreError> {
        let records = store.load_agents().await?;
        let ctx = BrokerContext::new(config, store);

        for record in records {
            ctx.agents.insert(record.hw_id, AgentEntry::offline(record));
        }
        info!(agents = ctx.agents.len(), "Agent registry loaded");

        Ok(Self { ctx: Arc::new(ctx) })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    /// Bind the command listener from the configuration
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = SocketAddr::new(self.ctx.config.bind_host, self.ctx.config.listen_port);
        TcpListener::bind(addr).await
    }

    /// Accept agents until [`shutdown`](Self::shutdown) is called
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Accepting agents");
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "New command connection");
                    let registry = self.clone();
                    tokio::spawn(async move {
                        registry.accept_agent(stream).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept command connection");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }

        info!("Agent listener stopped");
    }

    /// Run the handshake on a fresh command connection and, if it succeeds,
    /// start serving the agent in the background.
    ///
    /// Returns the agent's hardware id, or `None` if the connection was
    /// dropped because no valid handshake arrived in time.
    pub async fn accept_agent(&self, stream: TcpStream) -> Option<u64> {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                debug!(error = %e, "Command connection lost before handshake");
                return None;
            }
        };
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, ControlCodec::new());

        let (hw_id, name) = match timeout(self.ctx.config.handshake_timeout, reader.next()).await {
            Ok(Some(Ok(Inbound::Message(ControlMessage::Handshake { hw_id, name })))) => {
                (hw_id, name)
            }
            Ok(other) => {
                warn!(%peer, received = ?other, "Expected handshake, dropping connection");
                return None;
            }
            Err(_) => {
                warn!(%peer, "Handshake timed out");
                return None;
            }
        };

        let link = CommandLink::new(write_half, peer);
        let (record, session, replaced) = {
            let mut entry = self
                .ctx
                .agents
                .entry(hw_id)
                .or_insert_with(|| AgentEntry::offline(AgentRecord::new(hw_id, name.clone())));
            entry.record.name = name;
            entry.record.status = AgentStatus::Online;
            entry.record.last_seen = Utc::now();
            entry.session += 1;
            let replaced = entry.link.replace(link);
            (entry.record.clone(), entry.session, replaced)
        };

        if let Some(old) = replaced {
            info!(hw_id, old_peer = %old.peer_addr(), "Replacing previous command connection");
            old.shutdown().await;
        }

        info!(hw_id, name = %record.name, %peer, "Agent connected");
        self.ctx.record_status(&record).await;

        let registry = self.clone();
        tokio::spawn(async move {
            registry.agent_loop(reader, hw_id, session).await;
        });

        Some(hw_id)
    }

    async fn agent_loop(&self, mut reader: CommandReader, hw_id: u64, session: u64) {
        let idle_timeout = self.ctx.config.agent_idle_timeout;

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => break "broker shutting down",
                next = timeout(idle_timeout, reader.next()) => next,
            };

            match next {
                Err(_) => break "idle timeout",
                Ok(None) => break "connection closed",
                Ok(Some(Err(e))) => {
                    debug!(hw_id, error = %e, "Command connection read failed");
                    break "read error";
                }
                Ok(Some(Ok(inbound))) => {
                    if !self.touch(hw_id, session).await {
                        break "session replaced";
                    }
                    match inbound {
                        Inbound::Heartbeat => {}
                        Inbound::Message(message) => self.dispatch(hw_id, message),
                        Inbound::Malformed(e) => {
                            warn!(hw_id, error = %e, "Dropping malformed control message");
                        }
                    }
                }
            }
        };

        self.mark_offline(hw_id, session, reason).await;
    }

    /// Refresh `last_seen`. Returns false if the session is no longer current.
    async fn touch(&self, hw_id: u64, session: u64) -> bool {
        let record = {
            let Some(mut entry) = self.ctx.agents.get_mut(&hw_id) else {
                return false;
            };
            if entry.session != session {
                return false;
            }
            entry.record.last_seen = Utc::now();
            entry.record.clone()
        };
        self.ctx.persist(&record).await;
        true
    }

    fn dispatch(&self, hw_id: u64, message: ControlMessage) {
        match message {
            ControlMessage::TunnelClosed { tunnel_id } => {
                let removed = self
                    .ctx
                    .tunnels
                    .remove_if(&tunnel_id, |_, tunnel| tunnel.hw_id() == hw_id);
                match removed {
                    Some((_, tunnel)) => {
                        info!(hw_id, tunnel_id, "Agent closed tunnel");
                        tunnel.close();
                    }
                    None => debug!(hw_id, tunnel_id, "Agent closed unknown tunnel"),
                }
            }
            ControlMessage::Handshake { .. }
            | ControlMessage::TunnelRequest { .. }
            | ControlMessage::ConnectionRequest { .. } => {
                debug!(hw_id, message_type = ?message.message_type(), "Ignoring message from agent");
            }
        }
    }

    async fn mark_offline(&self, hw_id: u64, session: u64, reason: &str) {
        let record = {
            let Some(mut entry) = self.ctx.agents.get_mut(&hw_id) else {
                return;
            };
            if entry.session != session {
                debug!(hw_id, session, "Stale command connection ended");
                return;
            }
            entry.record.status = AgentStatus::Offline;
            entry.link.take();
            entry.record.clone()
        };

        info!(hw_id, reason, "Agent offline");
        self.ctx.record_status(&record).await;
    }

    /// Open a tunnel to the agent named in `options`, or return the one
    /// already open with identical options.
    ///
    /// Waits until the tunnel is ready for a customer or has failed.
    /// Two concurrent calls with identical options may both start a
    /// tunnel; the later one to become ready replaces the earlier in the
    /// dedup lookup.
    pub async fn open_tunnel(&self, options: TunnelOptions) -> Result<TunnelInfo, OpenTunnelError> {
        let hw_id = options.id;
        let target = options.tunnel_target()?;

        match self.ctx.agents.get(&hw_id) {
            None => return Err(OpenTunnelError::UnknownAgent(hw_id)),
            Some(entry) if !entry.record.status.is_online() || entry.link.is_none() => {
                return Err(OpenTunnelError::AgentOffline(hw_id));
            }
            Some(_) => {}
        }

        if let Some(info) = self.find_open(&options) {
            debug!(hw_id, tunnel_id = info.id, "Requested tunnel already open");
            return Ok(info);
        }

        let tunnel = Tunnel::new(self.ctx.clone(), options, target, self.closed_callback());
        let mut status = tunnel.subscribe();
        tunnel.start();

        let reached = status
            .wait_for(|s| matches!(s, TunnelStatus::Ready | TunnelStatus::Error))
            .await
            .map(|s| *s)
            .unwrap_or(TunnelStatus::Error);

        if reached == TunnelStatus::Error {
            return Err(tunnel.take_failure().unwrap_or(TunnelError::Closed).into());
        }

        let info = tunnel.info().ok_or(TunnelError::Closed)?;
        self.ctx.tunnels.insert(info.id, tunnel.clone());

        // Lost a race with the tunnel's own teardown
        if tunnel.is_closed() {
            self.ctx.tunnels.remove_if(&info.id, |_, t| Arc::ptr_eq(t, &tunnel));
            return Err(tunnel.take_failure().unwrap_or(TunnelError::Closed).into());
        }

        info!(hw_id, tunnel_id = info.id, customer_port = info.port, "Tunnel opened");
        Ok(info)
    }

    fn find_open(&self, options: &TunnelOptions) -> Option<TunnelInfo> {
        self.ctx
            .tunnels
            .iter()
            .find(|entry| !entry.is_closed() && entry.options() == options)
            .and_then(|entry| entry.info())
    }

    fn closed_callback(&self) -> TunnelClosedCallback {
        let ctx = Arc::downgrade(&self.ctx);
        Arc::new(move |tunnel_id| {
            if let Some(ctx) = ctx.upgrade() {
                ctx.tunnels.remove_if(&tunnel_id, |_, tunnel| tunnel.is_closed());
            }
        })
    }

    /// Close an open tunnel and tell its agent. Returns false if no tunnel
    /// has this id.
    pub async fn close_tunnel(&self, tunnel_id: u16) -> bool {
        let Some((_, tunnel)) = self.ctx.tunnels.remove(&tunnel_id) else {
            return false;
        };

        if let Some(link) = self.ctx.agent_link(tunnel.hw_id()) {
            if let Err(e) = link.send(&ControlMessage::TunnelClosed { tunnel_id }).await {
                debug!(tunnel_id, error = %e, "Could not notify agent of tunnel close");
            }
        }
        tunnel.close();
        true
    }

    pub fn agent_status(&self, hw_id: u64) -> Option<AgentStatus> {
        self.ctx.agents.get(&hw_id).map(|entry| entry.record.status)
    }

    pub fn agent(&self, hw_id: u64) -> Option<AgentRecord> {
        self.ctx.agents.get(&hw_id).map(|entry| entry.record.clone())
    }

    /// Every known agent, online or not, ordered by hardware id
    pub fn list_agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self
            .ctx
            .agents
            .iter()
            .map(|entry| entry.record.clone())
            .collect();
        agents.sort_by_key(|record| record.hw_id);
        agents
    }

    /// Forget an agent: drop its connection, close its tunnels and delete it
    /// from the store. Returns whether the agent was known.
    pub async fn remove_agent(&self, hw_id: u64) -> Result<bool, StoreError> {
        let removed = self.ctx.agents.remove(&hw_id);

        let tunnel_ids: Vec<u16> = self
            .ctx
            .tunnels
            .iter()
            .filter(|entry| entry.hw_id() == hw_id)
            .map(|entry| *entry.key())
            .collect();
        for tunnel_id in tunnel_ids {
            if let Some((_, tunnel)) = self.ctx.tunnels.remove(&tunnel_id) {
                tunnel.close();
            }
        }

        if let Some((_, entry)) = &removed {
            if let Some(link) = &entry.link {
                link.shutdown().await;
            }
        }

        let deleted = self.ctx.store.delete_agent(hw_id).await?;
        info!(hw_id, "Agent removed");
        Ok(removed.is_some() || deleted)
    }

    pub fn open_tunnels(&self) -> Vec<OpenTunnel> {
        let mut tunnels: Vec<OpenTunnel> = self
            .ctx
            .tunnels
            .iter()
            .filter_map(|entry| {
                let info = entry.info()?;
                Some(OpenTunnel {
                    id: info.id,
                    port: info.port,
                    options: entry.options().clone(),
                    connections: entry.connection_count(),
                })
            })
            .collect();
        tunnels.sort_by_key(|tunnel| tunnel.id);
        tunnels
    }

    /// Status history of an agent, oldest first
    pub async fn status_log(&self, hw_id: u64) -> Result<Vec<StatusChange>, StoreError> {
        self.ctx.store.status_log(hw_id).await
    }

    /// Stop accepting agents, close every tunnel and command connection
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();

        let tunnel_ids: Vec<u16> = self.ctx.tunnels.iter().map(|entry| *entry.key()).collect();
        for tunnel_id in tunnel_ids {
            if let Some((_, tunnel)) = self.ctx.tunnels.remove(&tunnel_id) {
                tunnel.close();
            }
        }

        let links: Vec<CommandLink> = self
            .ctx
            .agents
            .iter()
            .filter_map(|entry| entry.link.clone())
            .collect();
        for link in links {
            link.shutdown().await;
        }

        info!("Agent registry shut down");
    }
}
