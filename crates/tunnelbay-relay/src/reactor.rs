//! Readiness-driven pair bookkeeping

use crate::BoxedConnection;
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tracing::{debug, trace};

pub(crate) type ConnId = u64;

/// Published after every change to the tracked connections
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Occupancy {
    /// Live connections, two per pair
    pub live: usize,
    /// Pairs ever added
    pub pairs_added: u64,
}

/// What one sweep over the connections achieved
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    pub read: bool,
    pub wrote: bool,
    pub terminated: bool,
}

impl Progress {
    fn any(&self) -> bool {
        self.read || self.wrote || self.terminated
    }
}

pub(crate) struct Reactor {
    conns: HashMap<ConnId, BoxedConnection>,
    /// Symmetric: `peers[a] == b` iff `peers[b] == a`
    peers: HashMap<ConnId, ConnId>,
    /// Bytes waiting to be written, keyed by destination
    pending: HashMap<ConnId, Bytes>,
    scratch: Vec<u8>,
    next_id: ConnId,
    occupancy: watch::Sender<Occupancy>,
}

impl Reactor {
    pub fn new(chunk_size: usize, occupancy: watch::Sender<Occupancy>) -> Self {
        Self {
            conns: HashMap::new(),
            peers: HashMap::new(),
            pending: HashMap::new(),
            scratch: vec![0u8; chunk_size.max(1)],
            next_id: 0,
            occupancy,
        }
    }

    pub fn add_pair(&mut self, a: BoxedConnection, b: BoxedConnection) -> (ConnId, ConnId) {
        let a_id = self.next_id;
        let b_id = self.next_id + 1;
        self.next_id += 2;

        self.conns.insert(a_id, a);
        self.conns.insert(b_id, b);
        self.peers.insert(a_id, b_id);
        self.peers.insert(b_id, a_id);
        let live = self.conns.len();
        self.occupancy.send_modify(|o| {
            o.live = live;
            o.pairs_added += 1;
        });

        debug!(a = a_id, b = b_id, "Pair added to relay");
        (a_id, b_id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// One pass over every connection: flush pending writes, then read
    /// from connections whose peer has room.
    ///
    /// Returns `Pending` only when nothing moved, in which case every
    /// connection that can make progress has registered a waker.
    pub fn poll_io(&mut self, cx: &mut Context<'_>) -> Poll<Progress> {
        let mut progress = Progress::default();
        let mut doomed = Vec::new();
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();

        for &id in &ids {
            let Some(buf) = self.pending.get_mut(&id) else {
                continue;
            };
            let Some(conn) = self.conns.get_mut(&id) else {
                continue;
            };

            match Pin::new(&mut *conn).poll_write(cx, &buf[..]) {
                Poll::Ready(Ok(0)) => doomed.push(id),
                Poll::Ready(Ok(n)) => {
                    buf.advance(n);
                    progress.wrote = true;
                    if buf.is_empty() {
                        self.pending.remove(&id);
                        if let Poll::Ready(Err(e)) = Pin::new(&mut *conn).poll_flush(cx) {
                            trace!(conn = id, error = %e, "Flush failed");
                            doomed.push(id);
                        }
                    }
                }
                Poll::Ready(Err(e)) => {
                    trace!(conn = id, error = %e, "Write failed");
                    doomed.push(id);
                }
                Poll::Pending => {}
            }
        }

        for &id in &ids {
            if doomed.contains(&id) {
                continue;
            }
            let Some(&peer) = self.peers.get(&id) else {
                continue;
            };
            // Backpressure: the peer has not drained the last chunk yet
            if self.pending.contains_key(&peer) {
                continue;
            }
            let Some(conn) = self.conns.get_mut(&id) else {
                continue;
            };

            let mut read_buf = ReadBuf::new(&mut self.scratch);
            match Pin::new(conn).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        trace!(conn = id, "Connection closed by peer");
                        doomed.push(id);
                    } else {
                        self.pending.insert(peer, Bytes::copy_from_slice(filled));
                        progress.read = true;
                    }
                }
                Poll::Ready(Err(e)) => {
                    trace!(conn = id, error = %e, "Read failed");
                    doomed.push(id);
                }
                Poll::Pending => {}
            }
        }

        for id in doomed {
            self.terminate(id);
            progress.terminated = true;
        }

        if progress.any() {
            Poll::Ready(progress)
        } else {
            Poll::Pending
        }
    }

    /// Close `id` and everything paired with it. Unknown ids are ignored.
    pub fn terminate(&mut self, id: ConnId) {
        let mut worklist = vec![id];

        while let Some(id) = worklist.pop() {
            // Already gone: nothing to do, and its peer was queued when it went
            let Some(conn) = self.conns.remove(&id) else {
                continue;
            };
            drop(conn);
            self.pending.remove(&id);

            if let Some(peer) = self.peers.remove(&id) {
                self.peers.remove(&peer);
                worklist.push(peer);
            }
            debug!(conn = id, "Connection terminated");
        }

        self.sync_count();
    }

    /// Drop every connection and all state
    pub fn clear(&mut self) {
        self.conns.clear();
        self.peers.clear();
        self.pending.clear();
        self.sync_count();
    }

    fn sync_count(&self) {
        let live = self.conns.len();
        self.occupancy.send_if_modified(|o| {
            let changed = o.live != live;
            o.live = live;
            changed
        });
    }

    #[cfg(test)]
    fn is_symmetric(&self) -> bool {
        self.peers
            .iter()
            .all(|(a, b)| self.peers.get(b) == Some(a) && a != b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reactor() -> Reactor {
        Reactor::new(1024, watch::Sender::new(Occupancy::default()))
    }

    fn pipe() -> (BoxedConnection, tokio::io::DuplexStream) {
        let (inner, outer) = tokio::io::duplex(64);
        (Box::new(inner), outer)
    }

    #[tokio::test]
    async fn test_terminate_removes_both_sides() {
        let mut reactor = reactor();
        let (a, _a_user) = pipe();
        let (b, _b_user) = pipe();
        let (c, _c_user) = pipe();
        let (d, _d_user) = pipe();

        let (a_id, b_id) = reactor.add_pair(a, b);
        let (c_id, d_id) = reactor.add_pair(c, d);
        assert_eq!(reactor.len(), 4);
        assert!(reactor.is_symmetric());

        reactor.terminate(b_id);
        assert_eq!(reactor.len(), 2);
        assert!(!reactor.conns.contains_key(&a_id));
        assert!(reactor.conns.contains_key(&c_id));
        assert!(reactor.conns.contains_key(&d_id));
        assert!(reactor.is_symmetric());
        assert_eq!(
            *reactor.occupancy.borrow(),
            Occupancy {
                live: 2,
                pairs_added: 2
            }
        );
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut reactor = reactor();
        let (a, _a_user) = pipe();
        let (b, _b_user) = pipe();
        let (a_id, b_id) = reactor.add_pair(a, b);
        reactor.pending.insert(a_id, Bytes::from_static(b"left over"));

        reactor.terminate(a_id);
        reactor.terminate(a_id);
        reactor.terminate(b_id);
        reactor.terminate(999);

        assert_eq!(reactor.len(), 0);
        assert!(reactor.peers.is_empty());
        assert!(reactor.pending.is_empty());
    }

    #[tokio::test]
    async fn test_peer_sees_eof_after_terminate() {
        use tokio::io::AsyncReadExt;

        let mut reactor = reactor();
        let (a, _a_user) = pipe();
        let (b, mut b_user) = pipe();
        let (a_id, _) = reactor.add_pair(a, b);

        reactor.terminate(a_id);

        let mut buf = [0u8; 8];
        let n = b_user.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
