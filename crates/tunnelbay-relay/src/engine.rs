//! Relay task and its handle

use crate::reactor::{Occupancy, Reactor};
use crate::{BoxedConnection, Connection, RelayConfig, RelayError};
use std::future::poll_fn;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Called once when the relay closes itself after going idle
pub type IdleCallback = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    AddPair(BoxedConnection, BoxedConnection),
}

/// Entry point for starting relays
pub struct Relay;

impl Relay {
    /// Start a relay task.
    ///
    /// `on_idle` runs when the relay shuts itself down because no read
    /// succeeded within `config.idle_timeout`. It never runs for
    /// [`RelayHandle::close`].
    pub fn spawn(config: RelayConfig, on_idle: Option<IdleCallback>) -> RelayHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let done = CancellationToken::new();
        let (occupancy_tx, occupancy) = watch::channel(Occupancy::default());

        tokio::spawn(run(
            config,
            rx,
            shutdown.clone(),
            done.clone(),
            occupancy_tx,
            on_idle,
        ));

        RelayHandle {
            commands,
            shutdown,
            done,
            occupancy,
        }
    }
}

/// Handle to a running relay. Clones control the same relay.
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    done: CancellationToken,
    occupancy: watch::Receiver<Occupancy>,
}

impl RelayHandle {
    /// Stream bytes between `a` and `b` until either side closes
    pub fn add_pair<A, B>(&self, a: A, b: B) -> Result<(), RelayError>
    where
        A: Connection,
        B: Connection,
    {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.commands
            .send(Command::AddPair(Box::new(a), Box::new(b)))
            .map_err(|_| RelayError::Closed)
    }

    /// Stop the relay and drop every connection without running the idle callback
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.done.is_cancelled()
    }

    /// Wait until the relay task has exited and released its connections
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// Number of live connections (two per pair)
    pub fn connection_count(&self) -> usize {
        self.occupancy.borrow().live
    }

    /// Wait until at least one pair was added and none is left. Also
    /// returns once the relay has closed.
    pub async fn emptied(&self) {
        let mut occupancy = self.occupancy.clone();
        let _ = occupancy
            .wait_for(|o| o.pairs_added > 0 && o.live == 0)
            .await;
    }

    /// True when both handles control the same relay
    pub fn same_relay(&self, other: &RelayHandle) -> bool {
        self.commands.same_channel(&other.commands)
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("closed", &self.is_closed())
            .field("connections", &self.connection_count())
            .finish()
    }
}

enum Exit {
    Forced,
    Idle,
}

async fn run(
    config: RelayConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    done: CancellationToken,
    occupancy: watch::Sender<Occupancy>,
    on_idle: Option<IdleCallback>,
) {
    let _done = done.clone().drop_guard();
    let mut reactor = Reactor::new(config.chunk_size, occupancy);
    let mut last_read = Instant::now();
    let mut accepting = true;

    let exit = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break Exit::Forced,

            command = commands.recv(), if accepting => match command {
                Some(Command::AddPair(a, b)) => {
                    reactor.add_pair(a, b);
                    // A fresh pair gets a full idle window
                    last_read = Instant::now();
                }
                None => accepting = false,
            },

            _ = sleep_until(last_read + config.idle_timeout) => break Exit::Idle,

            progress = poll_fn(|cx| reactor.poll_io(cx)) => {
                if progress.read {
                    last_read = Instant::now();
                }
            }
        }
    };

    commands.close();
    let remaining = reactor.len();
    reactor.clear();
    // Closed before the callback runs, so it observes `is_closed()`
    done.cancel();

    match exit {
        Exit::Forced => {
            debug!(connections = remaining, "Relay closed");
        }
        Exit::Idle => {
            info!(
                idle_secs = config.idle_timeout.as_secs(),
                connections = remaining,
                "Relay idle, closing"
            );
            if let Some(callback) = on_idle {
                callback();
            }
        }
    }
}
