//! State shared by the registry and its tunnels

use crate::agent::{AgentEntry, AgentRecord, AgentStatus};
use crate::config::BrokerConfig;
use crate::ports::PortAllocator;
use crate::store::AgentStore;
use crate::tunnel::Tunnel;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunnelbay_proto::CommandLink;

/// Everything a broker component needs, passed explicitly instead of
/// living in globals
pub struct BrokerContext {
    pub config: BrokerConfig,
    pub store: Arc<dyn AgentStore>,
    pub(crate) ports: PortAllocator,
    pub(crate) agents: DashMap<u64, AgentEntry>,
    pub(crate) tunnels: DashMap<u16, Arc<Tunnel>>,
    pub(crate) shutdown: CancellationToken,
}

impl BrokerContext {
    pub fn new(config: BrokerConfig, store: Arc<dyn AgentStore>) -> Self {
        let ports = PortAllocator::new(
            config.bind_host,
            config.port_range.clone(),
            config.port_attempts,
        );
        Self {
            config,
            store,
            ports,
            agents: DashMap::new(),
            tunnels: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Current command connection of an agent
    pub(crate) fn agent_link(&self, hw_id: u64) -> Option<CommandLink> {
        self.agents.get(&hw_id).and_then(|entry| entry.link.clone())
    }

    /// Apply `change` to the agent's status; the new status is logged and
    /// persisted when `change` returns one.
    pub(crate) async fn update_agent_status(
        &self,
        hw_id: u64,
        change: impl FnOnce(AgentStatus) -> Option<AgentStatus>,
    ) {
        let record = {
            let Some(mut entry) = self.agents.get_mut(&hw_id) else {
                return;
            };
            match change(entry.record.status) {
                Some(status) if status != entry.record.status => {
                    entry.record.status = status;
                    entry.record.clone()
                }
                _ => return,
            }
        };

        debug!(hw_id, status = %record.status, "Agent status changed");
        self.record_status(&record).await;
    }

    /// Log the record's current status and save it
    pub(crate) async fn record_status(&self, record: &AgentRecord) {
        if let Err(e) = self
            .store
            .log_status_change(record.hw_id, record.status, Utc::now())
            .await
        {
            warn!(hw_id = record.hw_id, error = %e, "Failed to log status change");
        }
        self.persist(record).await;
    }

    pub(crate) async fn persist(&self, record: &AgentRecord) {
        if let Err(e) = self.store.save_agent(record).await {
            warn!(hw_id = record.hw_id, error = %e, "Failed to save agent");
        }
    }
}
