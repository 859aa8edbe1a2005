//! Random port probing for tunnel listeners

use rand::Rng;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("No free port in {start}-{end} after {attempts} attempts")]
    Exhausted { start: u16, end: u16, attempts: u32 },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Binds listeners on random ports drawn from a range.
///
/// Nothing is reserved up front: a port is taken by binding it, so two
/// tunnels starting at once can never end up with the same port. A port
/// that is already in use is skipped and another one is drawn.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
    range: RangeInclusive<u16>,
    attempts: u32,
}

impl PortAllocator {
    pub fn new(host: IpAddr, range: RangeInclusive<u16>, attempts: u32) -> Self {
        Self {
            host,
            range,
            attempts,
        }
    }

    /// Bind a listener on a free port in range
    pub async fn bind(&self) -> Result<(TcpListener, u16), PortError> {
        for attempt in 1..=self.attempts {
            let port = self.random_port();
            let addr = SocketAddr::new(self.host, port);

            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    debug!(port, attempt, "Bound tunnel listener");
                    return Ok((listener, port));
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    trace!(port, "Port in use, probing another");
                }
                Err(source) => return Err(PortError::Bind { addr, source }),
            }
        }

        Err(PortError::Exhausted {
            start: *self.range.start(),
            end: *self.range.end(),
            attempts: self.attempts,
        })
    }

    fn random_port(&self) -> u16 {
        rand::thread_rng().gen_range(self.range.clone())
    }
}
