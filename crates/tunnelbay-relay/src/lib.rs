//! Byte relay between paired connections
//!
//! One [`Relay`] runs a single task that streams bytes in both directions
//! between any number of connection pairs. Each direction holds at most one
//! chunk in flight: a connection is not read while its peer still has
//! unwritten data.

mod engine;
mod reactor;

pub use engine::{IdleCallback, Relay, RelayHandle};

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Anything the relay can stream through: TCP sockets, serial ports, pipes
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedConnection = Box<dyn Connection>;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay is closed")]
    Closed,
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Close the relay when no read succeeds for this long
    pub idle_timeout: Duration,
    /// Maximum bytes read from a connection at once
    pub chunk_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            chunk_size: 16 * 1024,
        }
    }
}
