//! Agent configuration and identity

use crate::backoff::{self, BackoffConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tunnelbay_relay::RelayConfig;

const FALLBACK_NAME: &str = "tunnelbay-agent";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker host; tunnel connections dial back to the same host
    pub broker_host: String,
    /// Broker command port
    pub broker_port: u16,
    /// Derived from the host name when unset
    pub hw_id: Option<u64>,
    /// Defaults to the host name
    pub name: Option<String>,
    #[serde(with = "backoff::secs")]
    pub heartbeat_interval: Duration,
    /// Bound on dialing the broker or a local TCP target
    #[serde(with = "backoff::secs")]
    pub connect_timeout: Duration,
    /// Local relays close after this long without traffic
    #[serde(with = "backoff::secs")]
    pub tunnel_idle_timeout: Duration,
    pub reconnect: BackoffConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 5555,
            hw_id: None,
            name: None,
            heartbeat_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            tunnel_idle_timeout: RelayConfig::default().idle_timeout,
            reconnect: BackoffConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(broker_host: impl Into<String>, broker_port: u16) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port,
            ..Self::default()
        }
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }

    pub fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(host_name)
    }

    pub fn resolved_hw_id(&self) -> u64 {
        self.hw_id
            .unwrap_or_else(|| hw_id_from_name(&self.resolved_name()))
    }

    pub(crate) fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            idle_timeout: self.tunnel_idle_timeout,
            ..RelayConfig::default()
        }
    }
}

/// Host name of this machine, or a fixed fallback
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// First 8 bytes of the SHA-256 of `name`, little-endian
pub fn hw_id_from_name(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_id_is_stable() {
        assert_eq!(hw_id_from_name("device-A"), hw_id_from_name("device-A"));
        assert_ne!(hw_id_from_name("device-A"), hw_id_from_name("device-B"));
    }

    #[test]
    fn test_explicit_identity_wins() {
        let config = AgentConfig {
            hw_id: Some(42),
            name: Some("device-A".to_string()),
            ..AgentConfig::default()
        };
        assert_eq!(config.resolved_hw_id(), 42);
        assert_eq!(config.resolved_name(), "device-A");
    }

    #[test]
    fn test_hw_id_derived_from_name() {
        let config = AgentConfig {
            name: Some("device-A".to_string()),
            ..AgentConfig::default()
        };
        assert_eq!(config.resolved_hw_id(), hw_id_from_name("device-A"));
    }

    #[test]
    fn test_yaml_partial_overrides() {
        let yaml = r#"
broker_host: broker.example.com
hw_id: 7
heartbeat_interval: 2
reconnect:
  initial: 3
  max: 30
  multiplier: 1.5
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.broker_addr(), "broker.example.com:5555");
        assert_eq!(config.hw_id, Some(7));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.tunnel_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.reconnect.max, Duration::from_secs(30));
    }
}
