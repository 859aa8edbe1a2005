//! Agent records as seen by the broker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tunnelbay_proto::CommandLink;

/// Liveness of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Offline,
    Online,
    /// Online and serving a tunnel on this customer port
    Tunnel(u16),
}

impl AgentStatus {
    pub fn is_online(&self) -> bool {
        !matches!(self, AgentStatus::Offline)
    }

    /// Compact numeric form: 0 offline, 1 online, otherwise the customer port
    pub fn code(&self) -> u16 {
        match self {
            AgentStatus::Offline => 0,
            AgentStatus::Online => 1,
            AgentStatus::Tunnel(port) => *port,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Tunnel(port) => write!(f, "tunnel:{}", port),
        }
    }
}

/// Persistent part of an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub hw_id: u64,
    pub name: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(hw_id: u64, name: impl Into<String>) -> Self {
        Self {
            hw_id,
            name: name.into(),
            status: AgentStatus::Offline,
            last_seen: Utc::now(),
        }
    }
}

/// One entry of an agent's status history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: AgentStatus,
    pub timestamp: DateTime<Utc>,
}

/// Registry entry: the record plus the live command connection, if any
#[derive(Debug, Clone)]
pub(crate) struct AgentEntry {
    pub record: AgentRecord,
    pub link: Option<CommandLink>,
    /// Bumped on every handshake so a replaced connection's loop can tell
    /// it no longer owns the entry
    pub session: u64,
}

impl AgentEntry {
    pub fn offline(record: AgentRecord) -> Self {
        Self {
            record: AgentRecord {
                status: AgentStatus::Offline,
                ..record
            },
            link: None,
            session: 0,
        }
    }
}
