//! Broker configuration

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;
use tunnelbay_relay::RelayConfig;

/// Settings shared by the agent registry and every tunnel it starts
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address tunnel listeners bind to
    pub bind_host: IpAddr,
    /// Port agents connect their command connection to
    pub listen_port: u16,
    /// Ports handed out for communicate and customer listeners
    pub port_range: RangeInclusive<u16>,
    /// Random probes before giving up on finding a free port
    pub port_attempts: u32,
    /// Time an agent has to send its handshake after connecting
    pub handshake_timeout: Duration,
    /// Time the agent has to dial back after a tunnel request
    pub agent_accept_timeout: Duration,
    /// Time the first customer has to connect once the tunnel is ready
    pub customer_accept_timeout: Duration,
    /// Time the agent has to dial back for each additional customer
    pub extra_connection_timeout: Duration,
    /// Silence on a command connection before the agent is marked offline
    pub agent_idle_timeout: Duration,
    /// Relay settings for every tunnel
    pub relay: RelayConfig,
    /// Whether tunnels may ask the agent for SSL
    pub tls_enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 5555,
            port_range: 3000..=3999,
            port_attempts: 100,
            handshake_timeout: Duration::from_secs(5),
            agent_accept_timeout: Duration::from_secs(15),
            customer_accept_timeout: Duration::from_secs(60),
            extra_connection_timeout: Duration::from_secs(5),
            agent_idle_timeout: Duration::from_secs(30),
            relay: RelayConfig::default(),
            tls_enabled: false,
        }
    }
}
