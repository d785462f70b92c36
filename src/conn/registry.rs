//! Connection registry
//!
//! Process-scoped table of live connections, keyed by id and by
//! (peer address, protocol). Lookup and creation hand out reference-counted
//! handles; release drives reclamation and tells the dispatcher what
//! follow-up the release implies (close, async-write follow-up, or a
//! dispose notice to the owning worker).

use std::net::{IpAddr, SocketAddr};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::object::{ConnHandle, ConnId, ConnInfo, ConnState, Connection, Owner};
use super::stats::ConnStats;
use crate::error::RegistryError;
use crate::proto::ProtoId;

/// Lookup key for [`Registry::acquire`]
#[derive(Debug, Clone, Copy)]
pub enum ConnKey {
    /// By numeric connection id
    Id(ConnId),
    /// By peer address and protocol, for outbound connection reuse
    Peer {
        ip: IpAddr,
        port: u16,
        proto: ProtoId,
    },
}

/// Result of [`Registry::acquire`]
#[derive(Debug)]
pub enum AcquireOutcome {
    /// Found; refcount incremented, caller must release
    Acquired(Arc<Connection>),
    /// No such connection
    NotFound,
    /// The connection exists but is mid-handoff (or still connecting) and
    /// did not settle within the caller's timeout
    Busy,
}

/// How a holder lets go of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Normal release; `pending_write` requests an async-write follow-up
    /// instead of teardown
    Normal { pending_write: bool },
    /// Peer closed its side
    Eof,
    /// Fault: forces the close path regardless of other holders
    Error,
}

/// What the caller of [`Registry::release`] must do next
///
/// The registry never touches handoff channels itself; it reports the
/// required side effect and the dispatcher executes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    /// Other holders remain; nothing to do
    Noop,
    /// The entry is gone and any local fd was closed
    Removed,
    /// Schedule a write-direction assignment for the pending data
    AsyncWriteFollowup,
    /// The entry is gone but the fd lives in a worker: send it a dispose
    /// notice so both ends agree the connection no longer exists
    NotifyWorker { worker: u16 },
}

/// Process-wide table of live connections
pub struct Registry {
    conns: DashMap<u32, Arc<Connection>>,
    by_peer: DashMap<(IpAddr, u16, u8), u32>,
    next_id: AtomicU32,
    max_connections: usize,
    stats: Arc<ConnStats>,
    /// Wakes acquire() waiters when a handoff settles or an entry dies
    settle_lock: Mutex<()>,
    settle_cv: Condvar,
}

impl Registry {
    /// Create a registry bounded at `max_connections` live entries
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            conns: DashMap::new(),
            by_peer: DashMap::new(),
            next_id: AtomicU32::new(0),
            max_connections,
            stats: Arc::new(ConnStats::new()),
            settle_lock: Mutex::new(()),
            settle_cv: Condvar::new(),
        }
    }

    /// Allocate a Connection Object around a freshly accepted or connected
    /// socket
    ///
    /// The socket is switched to non-blocking mode; the new entry starts
    /// with refcount 1, owned by the dispatch side.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when the table is at capacity.
    pub fn create(
        &self,
        fd: OwnedFd,
        local: SocketAddr,
        peer: SocketAddr,
        proto: ProtoId,
        initial_state: ConnState,
    ) -> Result<Arc<Connection>, RegistryError> {
        if self.conns.len() >= self.max_connections {
            self.stats.record_rejected();
            return Err(RegistryError::exhausted(
                self.conns.len(),
                self.max_connections,
            ));
        }

        if let Err(e) = Connection::init_sock_opts(&fd) {
            warn!(%peer, "failed to set socket options: {}", e);
        }

        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let conn = Arc::new(Connection::new(
            id,
            fd,
            local,
            peer,
            proto,
            initial_state,
            Owner::Dispatch,
        ));

        self.conns.insert(id.0, Arc::clone(&conn));
        if let Some(prev) = self.by_peer.insert((peer.ip(), peer.port(), proto.0), id.0) {
            debug!(%peer, prev, new = id.0, "peer key remapped to newer connection");
        }
        self.stats.record_created();

        debug!(conn = %id, %local, %peer, proto = proto.0, "connection created");
        Ok(conn)
    }

    /// Look up a connection and take a reference to it
    ///
    /// Waits up to `timeout` for an entry that is mid-handoff (or an
    /// outbound connect that has not settled) before reporting `Busy`;
    /// this is what prevents duplicate outbound connections to one peer.
    pub fn acquire(&self, key: ConnKey, timeout: Duration) -> AcquireOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(conn) = self.lookup(key) else {
                return AcquireOutcome::NotFound;
            };

            let settled = conn.owner() != Owner::InTransit
                && !(conn.state() == ConnState::Connecting && !conn.has_fd());
            if settled {
                conn.ref_inc();
                trace!(conn = %conn.id(), refcnt = conn.refcount(), "acquired");
                return AcquireOutcome::Acquired(conn);
            }

            let now = Instant::now();
            if now >= deadline {
                return AcquireOutcome::Busy;
            }
            let mut guard = self.settle_lock.lock();
            self.settle_cv.wait_for(&mut guard, deadline - now);
        }
    }

    /// Drop a reference, resolving what must happen to the connection
    ///
    /// An `Error` outcome forces the close path regardless of other
    /// holders. A normal release with pending write data asks for an
    /// async-write follow-up instead of teardown. When the last holder of
    /// a worker-owned connection drains, the returned action carries the
    /// dispose notice that keeps both ends agreed the object is gone.
    pub fn release(&self, conn: &Arc<Connection>, outcome: ReleaseOutcome) -> ReleaseAction {
        match outcome {
            ReleaseOutcome::Error => {
                conn.transition(ConnState::Bad);
                conn.ref_dec();
                self.tear_down(conn, outcome)
            }
            ReleaseOutcome::Normal { pending_write: true } => {
                conn.ref_dec();
                self.stats.record_async_write();
                ReleaseAction::AsyncWriteFollowup
            }
            ReleaseOutcome::Normal {
                pending_write: false,
            }
            | ReleaseOutcome::Eof => {
                if conn.ref_dec() > 0 {
                    return ReleaseAction::Noop;
                }
                self.tear_down(conn, outcome)
            }
        }
    }

    /// Mark a connection detached for transfer; bumps the generation
    ///
    /// The returned handle is what rides the Assign record. Acquire
    /// callers observe `Busy` until [`Registry::finish_handoff`] or
    /// [`Registry::abort_handoff`].
    pub fn begin_handoff(&self, conn: &Arc<Connection>) -> ConnHandle {
        conn.set_owner(Owner::InTransit);
        conn.next_generation()
    }

    /// The Assign message was sent: the named worker owns the fd now
    pub fn finish_handoff(&self, conn: &Arc<Connection>, worker: u16) {
        conn.set_owner(Owner::Worker(worker));
        self.stats.record_assigned();
        self.settle_cv.notify_all();
    }

    /// The Assign could not be sent: ownership stays with dispatch
    pub fn abort_handoff(&self, conn: &Arc<Connection>) {
        conn.set_owner(Owner::Dispatch);
        self.settle_cv.notify_all();
    }

    /// Number of live connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the registry holds no connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Lifecycle statistics
    #[must_use]
    pub fn stats(&self) -> Arc<ConnStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of every live connection, for the admin socket
    #[must_use]
    pub fn list(&self) -> Vec<ConnInfo> {
        self.conns.iter().map(|entry| entry.value().info()).collect()
    }

    /// Fetch a connection without touching its refcount
    ///
    /// Dispatcher-internal: Return processing needs the entry to complete
    /// bookkeeping that the Assign already accounted for.
    pub(crate) fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.conns.get(&id.0).map(|e| Arc::clone(e.value()))
    }

    /// Every connection whose fd lives in the given worker
    ///
    /// Used when a worker dies: its connections are unrecoverable.
    pub(crate) fn owned_by(&self, worker: u16) -> Vec<Arc<Connection>> {
        self.conns
            .iter()
            .filter(|e| e.value().owner() == Owner::Worker(worker))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    fn lookup(&self, key: ConnKey) -> Option<Arc<Connection>> {
        match key {
            ConnKey::Id(id) => self.get(id),
            ConnKey::Peer { ip, port, proto } => {
                let id = *self.by_peer.get(&(ip, port, proto.0))?;
                self.get(ConnId(id))
            }
        }
    }

    /// Remove the entry, close any locally held fd, and resolve whether a
    /// worker still needs to be told
    fn tear_down(&self, conn: &Arc<Connection>, outcome: ReleaseOutcome) -> ReleaseAction {
        let id = conn.id();
        let removed = self.conns.remove(&id.0).is_some();
        let peer = conn.peer_addr();
        self.by_peer
            .remove_if(&(peer.ip(), peer.port(), conn.proto().0), |_, v| *v == id.0);

        let prior = conn.owner();
        drop(conn.take_fd());
        conn.transition(ConnState::Closed);
        conn.set_owner(Owner::Gone);
        self.settle_cv.notify_all();

        if !removed {
            trace!(conn = %id, "tear down on already-removed entry");
            return ReleaseAction::Removed;
        }
        match outcome {
            ReleaseOutcome::Error => self.stats.record_released_error(),
            ReleaseOutcome::Eof => self.stats.record_released_eof(),
            ReleaseOutcome::Normal { .. } => self.stats.record_released_normal(),
        }
        debug!(conn = %id, ?prior, "connection removed");
        match prior {
            Owner::Worker(worker) => ReleaseAction::NotifyWorker { worker },
            _ => ReleaseAction::Removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn sock() -> OwnedFd {
        let (a, _b) = UnixStream::pair().unwrap();
        a.into()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn create(registry: &Registry, peer: &str) -> Arc<Connection> {
        registry
            .create(
                sock(),
                addr("127.0.0.1:5060"),
                addr(peer),
                ProtoId(0),
                ConnState::Established,
            )
            .unwrap()
    }

    #[test]
    fn test_create_and_acquire_by_id() {
        let registry = Registry::new(16);
        let conn = create(&registry, "192.0.2.1:1000");
        assert_eq!(registry.len(), 1);
        assert_eq!(conn.refcount(), 1);

        match registry.acquire(ConnKey::Id(conn.id()), Duration::from_millis(10)) {
            AcquireOutcome::Acquired(c) => {
                assert_eq!(c.id(), conn.id());
                assert_eq!(c.refcount(), 2);
            }
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[test]
    fn test_acquire_by_peer() {
        let registry = Registry::new(16);
        let conn = create(&registry, "192.0.2.7:2000");

        let key = ConnKey::Peer {
            ip: addr("192.0.2.7:2000").ip(),
            port: 2000,
            proto: ProtoId(0),
        };
        assert!(matches!(
            registry.acquire(key, Duration::from_millis(10)),
            AcquireOutcome::Acquired(_)
        ));
        // refcount raised by the acquire above
        assert_eq!(conn.refcount(), 2);
    }

    #[test]
    fn test_acquire_not_found() {
        let registry = Registry::new(16);
        assert!(matches!(
            registry.acquire(ConnKey::Id(ConnId(99)), Duration::from_millis(5)),
            AcquireOutcome::NotFound
        ));
    }

    #[test]
    fn test_acquire_busy_while_in_transit() {
        let registry = Registry::new(16);
        let conn = create(&registry, "192.0.2.2:1001");
        registry.begin_handoff(&conn);

        assert!(matches!(
            registry.acquire(ConnKey::Id(conn.id()), Duration::from_millis(20)),
            AcquireOutcome::Busy
        ));

        registry.finish_handoff(&conn, 0);
        assert!(matches!(
            registry.acquire(ConnKey::Id(conn.id()), Duration::from_millis(20)),
            AcquireOutcome::Acquired(_)
        ));
    }

    #[test]
    fn test_capacity_exhausted() {
        let registry = Registry::new(1);
        let _conn = create(&registry, "192.0.2.3:1002");

        let err = registry
            .create(
                sock(),
                addr("127.0.0.1:5060"),
                addr("192.0.2.3:1003"),
                ProtoId(0),
                ConnState::Established,
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::ResourceExhausted { .. }));
        assert_eq!(registry.stats().snapshot().rejected, 1);
    }

    #[test]
    fn test_release_last_holder_removes() {
        let registry = Registry::new(16);
        let conn = create(&registry, "192.0.2.4:1004");

        let action = registry.release(
            &conn,
            ReleaseOutcome::Normal {
                pending_write: false,
            },
        );
        assert_eq!(action, ReleaseAction::Removed);
        assert!(registry.is_empty());
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(!conn.has_fd());
    }

    #[test]
    fn test_release_with_other_holders_is_noop() {
        let registry = Registry::new(16);
        let conn = create(&registry, "192.0.2.5:1005");
        conn.ref_inc();

        assert_eq!(
            registry.release(
                &conn,
                ReleaseOutcome::Normal {
                    pending_write: false
                }
            ),
            ReleaseAction::Noop
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_error_release_forces_teardown_despite_holders() {
        let registry = Registry::new(16);
        let conn = create(&registry, "192.0.2.6:1006");
        conn.ref_inc();
        conn.ref_inc();

        let action = registry.release(&conn, ReleaseOutcome::Error);
        assert_eq!(action, ReleaseAction::Removed);
        assert!(registry.is_empty());
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_release_of_worker_owned_conn_notifies() {
        let registry = Registry::new(16);
        let conn = create(&registry, "192.0.2.8:1008");
        registry.begin_handoff(&conn);
        registry.finish_handoff(&conn, 3);
        // Worker holds the fd now
        drop(conn.take_fd());

        let action = registry.release(&conn, ReleaseOutcome::Error);
        assert_eq!(action, ReleaseAction::NotifyWorker { worker: 3 });
    }

    #[test]
    fn test_async_write_release_keeps_entry() {
        let registry = Registry::new(16);
        let conn = create(&registry, "192.0.2.9:1009");
        conn.ref_inc();

        let action = registry.release(
            &conn,
            ReleaseOutcome::Normal {
                pending_write: true,
            },
        );
        assert_eq!(action, ReleaseAction::AsyncWriteFollowup);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().snapshot().async_write_returns, 1);
    }
}
