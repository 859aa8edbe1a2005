//! Tunnel state machine
//!
//! A tunnel binds a communicate port (which doubles as its id), asks the
//! agent to dial back to it, then binds a customer port and relays every
//! customer connection to a fresh agent connection.
//!
//! ```text
//! Started --bind--> Opened --agent dials back, customer port bound--> Ready
//!    \                 \                                               \
//!     +-----------------+----------------> Error <---------------------+
//! ```

use crate::agent::AgentStatus;
use crate::context::BrokerContext;
use crate::options::{TunnelInfo, TunnelOptions};
use crate::ports::PortError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnelbay_proto::{CodecError, ControlMessage, TunnelTarget};
use tunnelbay_relay::{Relay, RelayError, RelayHandle};

/// Called with the tunnel id when a tunnel tears itself down
pub type TunnelClosedCallback = Arc<dyn Fn(u16) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Started,
    Opened,
    Ready,
    /// Reserved. No transition leads here.
    Waiting,
    Error,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Agent {0} has no command connection")]
    AgentUnavailable(u64),

    #[error("Failed to send tunnel request: {0}")]
    Send(#[source] CodecError),

    #[error("Agent did not connect back within {0:?}")]
    AgentTimeout(Duration),

    #[error("No customer connected within {0:?}")]
    CustomerTimeout(Duration),

    #[error("Accept failed: {0}")]
    Accept(#[from] io::Error),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Tunnel closed")]
    Closed,
}

pub struct Tunnel {
    ctx: Arc<BrokerContext>,
    options: TunnelOptions,
    target: TunnelTarget,
    ssl: bool,
    status: watch::Sender<TunnelStatus>,
    id: OnceLock<u16>,
    customer_port: OnceLock<u16>,
    relay: OnceLock<RelayHandle>,
    failure: Mutex<Option<TunnelError>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    on_closed: TunnelClosedCallback,
}

impl Tunnel {
    pub(crate) fn new(
        ctx: Arc<BrokerContext>,
        options: TunnelOptions,
        target: TunnelTarget,
        on_closed: TunnelClosedCallback,
    ) -> Arc<Self> {
        let ssl = options.ssl && ctx.config.tls_enabled;
        if options.ssl && !ssl {
            debug!(hw_id = options.id, "SSL requested but disabled on this broker");
        }

        Arc::new(Self {
            ctx,
            options,
            target,
            ssl,
            status: watch::Sender::new(TunnelStatus::Started),
            id: OnceLock::new(),
            customer_port: OnceLock::new(),
            relay: OnceLock::new(),
            failure: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            on_closed,
        })
    }

    /// Run the state machine in the background
    pub(crate) fn start(self: &Arc<Self>) {
        let tunnel = self.clone();
        tokio::spawn(async move { tunnel.run().await });
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }

    /// Tunnel id, known once the communicate port is bound
    pub fn id(&self) -> Option<u16> {
        self.id.get().copied()
    }

    pub fn customer_port(&self) -> Option<u16> {
        self.customer_port.get().copied()
    }

    pub fn info(&self) -> Option<TunnelInfo> {
        Some(TunnelInfo {
            port: self.customer_port()?,
            id: self.id()?,
        })
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.options
    }

    pub fn hw_id(&self) -> u64 {
        self.options.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Live relayed connections (two per customer)
    pub fn connection_count(&self) -> usize {
        self.relay.get().map_or(0, RelayHandle::connection_count)
    }

    /// Why the tunnel went to `Error`, if it did. Taken once.
    pub(crate) fn take_failure(&self) -> Option<TunnelError> {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Close from outside. Does not fire the closed callback.
    pub fn close(&self) {
        if self.teardown() {
            info!(tunnel_id = ?self.id(), hw_id = self.hw_id(), "Tunnel closed");
        }
    }

    /// Close from inside and tell the owner
    pub(crate) fn terminate(&self) {
        if self.teardown() {
            info!(tunnel_id = ?self.id(), hw_id = self.hw_id(), "Tunnel terminated");
            if let Some(id) = self.id() {
                (self.on_closed)(id);
            }
        }
    }

    /// Returns false if the tunnel was already torn down
    fn teardown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.cancel.cancel();
        if let Some(relay) = self.relay.get() {
            relay.close();
        }
        true
    }

    /// Runs once setup can no longer change the agent's status
    async fn restore_agent_status(&self) {
        if let Some(port) = self.customer_port() {
            self.ctx
                .update_agent_status(self.hw_id(), |current| {
                    (current == AgentStatus::Tunnel(port)).then_some(AgentStatus::Online)
                })
                .await;
        }
    }

    fn fail(&self, error: TunnelError) {
        match &error {
            TunnelError::Closed => debug!(tunnel_id = ?self.id(), "Tunnel setup cancelled"),
            e => warn!(
                tunnel_id = ?self.id(),
                hw_id = self.hw_id(),
                error = %e,
                "Tunnel failed"
            ),
        }

        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
        self.status.send_replace(TunnelStatus::Error);
        self.terminate();
    }

    fn set_status(&self, status: TunnelStatus) {
        debug!(tunnel_id = ?self.id(), ?status, "Tunnel status");
        self.status.send_replace(status);
    }

    async fn run(self: Arc<Self>) {
        let setup = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TunnelError::Closed),
            result = self.setup() => result,
        };

        match setup {
            Ok((communicate, customer)) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {}
                    _ = self.accept_customers(&communicate, &customer) => {
                        // Keep both ports bound so the id stays unique until close
                        self.cancel.cancelled().await;
                    }
                }
                debug!(tunnel_id = ?self.id(), "Tunnel listeners released");
            }
            Err(e) => self.fail(e),
        }

        self.restore_agent_status().await;
    }

    /// Steps up to the first relayed pair. Returns the still-bound
    /// communicate and customer listeners.
    async fn setup(self: &Arc<Self>) -> Result<(TcpListener, TcpListener), TunnelError> {
        let config = &self.ctx.config;

        let (communicate, id) = self.ctx.ports.bind().await?;
        let _ = self.id.set(id);
        self.set_status(TunnelStatus::Opened);

        let link = self
            .ctx
            .agent_link(self.hw_id())
            .ok_or(TunnelError::AgentUnavailable(self.hw_id()))?;
        let request = ControlMessage::tunnel_request(id, self.ssl, self.target.clone());

        let deadline = Instant::now() + config.agent_accept_timeout;
        match timeout_at(deadline, link.send(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TunnelError::Send(e)),
            Err(_) => return Err(TunnelError::AgentTimeout(config.agent_accept_timeout)),
        }
        debug!(tunnel_id = id, target = %self.target, "Tunnel request sent");

        let (agent_conn, _) = timeout_at(deadline, communicate.accept())
            .await
            .map_err(|_| TunnelError::AgentTimeout(config.agent_accept_timeout))??;

        let (customer, customer_port) = self.ctx.ports.bind().await?;
        let _ = self.customer_port.set(customer_port);
        self.set_status(TunnelStatus::Ready);
        info!(
            tunnel_id = id,
            customer_port,
            hw_id = self.hw_id(),
            "Tunnel ready"
        );

        let (customer_conn, customer_addr) =
            timeout(config.customer_accept_timeout, customer.accept())
                .await
                .map_err(|_| TunnelError::CustomerTimeout(config.customer_accept_timeout))??;
        debug!(tunnel_id = id, %customer_addr, "Customer connected");

        let relay = self.spawn_relay();
        relay.add_pair(customer_conn, agent_conn)?;
        if self.cancel.is_cancelled() {
            relay.close();
            return Err(TunnelError::Closed);
        }

        self.ctx
            .update_agent_status(self.hw_id(), |current| {
                current.is_online().then_some(AgentStatus::Tunnel(customer_port))
            })
            .await;

        Ok((communicate, customer))
    }

    fn spawn_relay(self: &Arc<Self>) -> RelayHandle {
        let weak: Weak<Tunnel> = Arc::downgrade(self);
        let relay = Relay::spawn(
            self.ctx.config.relay.clone(),
            Some(Box::new(move || {
                if let Some(tunnel) = weak.upgrade() {
                    tunnel.terminate();
                }
            })),
        );
        let _ = self.relay.set(relay.clone());
        relay
    }

    /// Pair every further customer with a new agent connection. Returns
    /// when the agent can no longer be asked for connections.
    async fn accept_customers(&self, communicate: &TcpListener, customer: &TcpListener) {
        let Some(id) = self.id() else {
            return;
        };
        let Some(relay) = self.relay.get() else {
            return;
        };
        let extra_timeout = self.ctx.config.extra_connection_timeout;

        loop {
            let (customer_conn, customer_addr) = match customer.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(tunnel_id = id, error = %e, "Customer accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            debug!(tunnel_id = id, %customer_addr, "Additional customer connected");

            let Some(link) = self.ctx.agent_link(self.hw_id()) else {
                warn!(tunnel_id = id, "Agent gone, no longer accepting customers");
                return;
            };
            if let Err(e) = link
                .send(&ControlMessage::ConnectionRequest { tunnel_id: id })
                .await
            {
                warn!(tunnel_id = id, error = %e, "Failed to request connection");
                return;
            }

            match timeout(extra_timeout, communicate.accept()).await {
                Ok(Ok((agent_conn, _))) => {
                    if relay.add_pair(customer_conn, agent_conn).is_err() {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    warn!(tunnel_id = id, error = %e, "Agent accept failed");
                }
                Err(_) => {
                    warn!(
                        tunnel_id = id,
                        %customer_addr,
                        "Agent did not connect back, dropping customer"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id())
            .field("customer_port", &self.customer_port())
            .field("status", &self.status())
            .field("options", &self.options)
            .finish()
    }
}
