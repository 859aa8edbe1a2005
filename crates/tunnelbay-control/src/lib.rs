//! Broker side of tunnelbay: agent registry and tunnel orchestration
pub mod agent;
pub mod config;
pub mod context;
pub mod options;
pub mod ports;
pub mod registry;
pub mod store;
pub mod tunnel;

pub use agent::{AgentRecord, AgentStatus, StatusChange};
pub use config::BrokerConfig;
pub use context::BrokerContext;
pub use options::{OpenTunnelReply, TargetOptions, TunnelInfo, TunnelOptions};
pub use ports::{PortAllocator, PortError};
pub use registry::{AgentRegistry, OpenTunnel, OpenTunnelError};
pub use store::{AgentStore, JsonFileStore, MemoryStore, StoreError};
pub use tunnel::{Tunnel, TunnelClosedCallback, TunnelError, TunnelStatus};
pub use tunnelbay_relay::RelayConfig;
