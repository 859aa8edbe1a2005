//! Tunnelbay agent
//!
//! Keeps one command connection to the broker alive, answers tunnel
//! requests by dialing local targets and connecting back, and relays bytes
//! between the two.

pub mod backoff;
pub mod config;
mod runtime;
mod tunnel;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{host_name, hw_id_from_name, AgentConfig};
pub use runtime::AgentRuntime;

use thiserror::Error;
use tunnelbay_proto::CodecError;
use tunnelbay_relay::RelayError;

/// Errors that can occur in the agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open serial port {name}: {source}")]
    Serial {
        name: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("Serial port {0} serves a single connection")]
    SerialBusy(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}
