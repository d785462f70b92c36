//! Connection object
//!
//! The unit of ownership in connmux: one TCP connection, its transport fd,
//! lifecycle state, refcount, timeout deadline, and the opaque extension
//! slot owned by the protocol binding.
//!
//! The fd is a move-only resource: it lives in a locked `Option<OwnedFd>`
//! slot and leaves the object only through [`Connection::take_fd`], which is
//! how a handoff detaches it for transfer. Exactly one process holds the
//! live fd at any instant.

use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::proto::ProtoId;

/// Numeric connection identifier, unique while the connection is live
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub u32);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire handle for a connection: id plus handoff generation
///
/// The generation is bumped on every handoff, so a stale Assign or Return
/// referring to an earlier transfer of the same id is detected and
/// rejected instead of corrupting the live entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnHandle {
    pub id: ConnId,
    pub generation: u32,
}

impl ConnHandle {
    /// Pack into the wire representation
    #[must_use]
    pub fn to_wire(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.id.0)
    }

    /// Unpack from the wire representation
    #[must_use]
    pub fn from_wire(word: u64) -> Self {
        Self {
            id: ConnId((word & 0xffff_ffff) as u32),
            generation: (word >> 32) as u32,
        }
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

/// Connection lifecycle state
///
/// Transitions are monotonic: `Connecting` becomes `Established`, which may
/// become `Eof` or `Bad`; all three of `Eof`, `Bad`, `Closed` are terminal
/// with respect to further I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnState {
    /// Outbound connect in progress
    Connecting = 0,
    /// Live, traffic allowed
    Established = 1,
    /// Peer closed its write side
    Eof = 2,
    /// Protocol or transport fault
    Bad = 3,
    /// Fully torn down
    Closed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Established,
            2 => Self::Eof,
            3 => Self::Bad,
            _ => Self::Closed,
        }
    }

    /// Terminal states forbid further reactor registration
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Eof | Self::Bad | Self::Closed)
    }

    /// Whether `self -> to` is a legal transition
    #[must_use]
    pub const fn can_become(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Connecting, Self::Established | Self::Bad | Self::Closed)
                | (Self::Established, Self::Eof | Self::Bad | Self::Closed)
                | (Self::Eof | Self::Bad, Self::Closed)
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Established => "established",
            Self::Eof => "eof",
            Self::Bad => "bad",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Which side currently holds the live fd
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The dispatch process
    Dispatch,
    /// A specific worker
    Worker(u16),
    /// Detached, riding a handoff message
    InTransit,
    /// Released; no live fd exists
    Gone,
}

impl Owner {
    fn encode(self) -> u32 {
        match self {
            Self::Dispatch => 0,
            Self::Worker(idx) => (1 << 16) | u32::from(idx),
            Self::InTransit => 2 << 16,
            Self::Gone => 3 << 16,
        }
    }

    fn decode(v: u32) -> Self {
        match v >> 16 {
            0 => Self::Dispatch,
            1 => Self::Worker((v & 0xffff) as u16),
            2 => Self::InTransit,
            _ => Self::Gone,
        }
    }
}

/// Read-only view of one live connection, for external tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnInfo {
    pub id: u32,
    pub local: SocketAddr,
    pub peer: SocketAddr,
    pub state: ConnState,
    pub age_secs: u64,
    pub proto: u8,
    /// Masked external identifier, present when masking is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masked_id: Option<String>,
}

/// One TCP connection and everything the core tracks about it
pub struct Connection {
    id: ConnId,
    proto: ProtoId,
    local: SocketAddr,
    peer: SocketAddr,
    state: AtomicU8,
    generation: AtomicU32,
    refcnt: AtomicU32,
    owner: AtomicU32,
    /// Absolute deadline in worker ticks; past it the connection is
    /// idle-expired
    deadline: AtomicU64,
    /// Reads attempted on a partially received message
    read_attempts: AtomicU32,
    fd: Mutex<Option<OwnedFd>>,
    /// Serializes writes to the fd across readiness events
    write_lock: Mutex<()>,
    /// Owned and interpreted by the protocol binding only
    extension: Mutex<Option<Box<dyn Any + Send>>>,
    created: Instant,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        fd: OwnedFd,
        local: SocketAddr,
        peer: SocketAddr,
        proto: ProtoId,
        initial_state: ConnState,
        owner: Owner,
    ) -> Self {
        Self {
            id,
            proto,
            local,
            peer,
            state: AtomicU8::new(initial_state as u8),
            generation: AtomicU32::new(0),
            refcnt: AtomicU32::new(1),
            owner: AtomicU32::new(owner.encode()),
            deadline: AtomicU64::new(u64::MAX),
            read_attempts: AtomicU32::new(0),
            fd: Mutex::new(Some(fd)),
            write_lock: Mutex::new(()),
            extension: Mutex::new(None),
            created: Instant::now(),
        }
    }

    /// Switch the socket to non-blocking mode and disable Nagle
    ///
    /// Non-blocking failure is reported; the nodelay option is best-effort
    /// since it only applies to TCP sockets.
    pub(crate) fn init_sock_opts(fd: &OwnedFd) -> io::Result<()> {
        let sock = socket2::SockRef::from(fd);
        sock.set_nonblocking(true)?;
        if let Err(e) = sock.set_nodelay(true) {
            trace!("set_nodelay not applicable: {}", e);
        }
        Ok(())
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn proto(&self) -> ProtoId {
        self.proto
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt a state transition, enforcing legality
    ///
    /// Returns `false` (and logs) when the transition is illegal, e.g. any
    /// move out of a terminal state other than to `Closed`.
    pub fn transition(&self, to: ConnState) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let from = ConnState::from_u8(cur);
            if from == to {
                return true;
            }
            if !from.can_become(to) {
                warn!(conn = %self.id, %from, %to, "illegal state transition rejected");
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Current wire handle (id + generation)
    pub fn handle(&self) -> ConnHandle {
        ConnHandle {
            id: self.id,
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    /// Adopt the generation carried by an Assign (worker side), so local
    /// Returns echo the handle the dispatcher expects
    pub(crate) fn set_generation(&self, generation: u32) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Bump the generation for a new handoff and return the new handle
    pub(crate) fn next_generation(&self) -> ConnHandle {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        ConnHandle {
            id: self.id,
            generation,
        }
    }

    /// Increment the holder refcount
    pub fn ref_inc(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the holder refcount, returning the new count
    pub fn ref_dec(&self) -> u32 {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcount underflow on conn {}", self.id);
        prev.saturating_sub(1)
    }

    /// Current holder refcount
    pub fn refcount(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Owner {
        Owner::decode(self.owner.load(Ordering::Acquire))
    }

    pub(crate) fn set_owner(&self, owner: Owner) {
        self.owner.store(owner.encode(), Ordering::Release);
    }

    /// Absolute expiry deadline in ticks
    pub fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Acquire)
    }

    /// Move the expiry deadline; called on assignment and whenever
    /// application traffic is observed
    pub fn set_deadline(&self, ticks: u64) {
        self.deadline.store(ticks, Ordering::Release);
    }

    /// Reads attempted on the current partially received message
    pub fn read_attempts(&self) -> u32 {
        self.read_attempts.load(Ordering::Acquire)
    }

    /// Record one read attempt on an incomplete message
    ///
    /// Called by protocol bindings that buffered a partial message; the
    /// sweep treats an expired connection with attempts recorded as a
    /// stalled peer rather than an idle one.
    pub fn note_read_attempt(&self) -> u32 {
        self.read_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reset the attempt counter, on assignment or message completion
    pub fn clear_read_attempts(&self) {
        self.read_attempts.store(0, Ordering::Release);
    }

    /// Whether this object currently holds the live fd
    pub fn has_fd(&self) -> bool {
        self.fd.lock().is_some()
    }

    /// Raw fd for reactor registration; `None` once detached
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.lock().as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Detach the fd for transfer; the object no longer owns it
    pub fn take_fd(&self) -> Option<OwnedFd> {
        self.fd.lock().take()
    }

    /// Attach a transferred fd; any previously held fd is dropped closed
    pub fn attach_fd(&self, fd: OwnedFd) {
        let mut slot = self.fd.lock();
        if slot.is_some() {
            warn!(conn = %self.id, "replacing an fd that was never detached");
        }
        *slot = Some(fd);
    }

    /// Non-blocking read from the transport
    ///
    /// # Errors
    ///
    /// `WouldBlock` when no data is queued; `NotConnected` when the fd has
    /// been detached.
    pub fn read_nb(&self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.fd.lock();
        let fd = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection has no fd"))?;
        let sock = socket2::SockRef::from(fd);
        // SAFETY: viewing initialized bytes as MaybeUninit is sound; recv
        // only writes into the slice.
        let uninit = unsafe {
            &mut *(buf as *mut [u8] as *mut [std::mem::MaybeUninit<u8>])
        };
        sock.recv(uninit)
    }

    /// Non-blocking write to the transport
    ///
    /// Callers serialize through [`Connection::write_guard`].
    ///
    /// # Errors
    ///
    /// `WouldBlock` when the send buffer is full; `NotConnected` when the
    /// fd has been detached.
    pub fn write_nb(&self, buf: &[u8]) -> io::Result<usize> {
        let guard = self.fd.lock();
        let fd = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection has no fd"))?;
        socket2::SockRef::from(fd).send(buf)
    }

    /// Take the per-connection write-serialization lock
    pub fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Install the protocol binding's private state
    pub fn set_extension(&self, ext: Box<dyn Any + Send>) {
        *self.extension.lock() = Some(ext);
    }

    /// Run a closure over the extension state if it is of type `T`
    pub fn with_extension<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.extension.lock();
        guard.as_mut()?.downcast_mut::<T>().map(f)
    }

    /// Remove and return the extension state
    pub fn take_extension(&self) -> Option<Box<dyn Any + Send>> {
        self.extension.lock().take()
    }

    /// Snapshot for administrative introspection
    pub fn info(&self) -> ConnInfo {
        ConnInfo {
            id: self.id.0,
            local: self.local,
            peer: self.peer,
            state: self.state(),
            age_secs: self.age().as_secs(),
            proto: self.proto.0,
            masked_id: None,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("refcnt", &self.refcount())
            .field("owner", &self.owner())
            .field("has_fd", &self.has_fd())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn test_conn() -> Connection {
        let (a, _b) = UnixStream::pair().unwrap();
        Connection::new(
            ConnId(7),
            a.into(),
            "127.0.0.1:5060".parse().unwrap(),
            "192.0.2.1:49152".parse().unwrap(),
            ProtoId(0),
            ConnState::Established,
            Owner::Dispatch,
        )
    }

    #[test]
    fn test_handle_wire_roundtrip() {
        let handle = ConnHandle {
            id: ConnId(0xdead_beef),
            generation: 42,
        };
        assert_eq!(ConnHandle::from_wire(handle.to_wire()), handle);
    }

    #[test]
    fn test_state_transitions() {
        let conn = test_conn();
        assert_eq!(conn.state(), ConnState::Established);

        assert!(conn.transition(ConnState::Eof));
        assert!(conn.state().is_terminal());

        // Terminal states only move to Closed
        assert!(!conn.transition(ConnState::Established));
        assert_eq!(conn.state(), ConnState::Eof);
        assert!(conn.transition(ConnState::Closed));
    }

    #[test]
    fn test_bad_is_terminal() {
        let conn = test_conn();
        assert!(conn.transition(ConnState::Bad));
        assert!(!conn.transition(ConnState::Established));
        assert!(!conn.transition(ConnState::Eof));
    }

    #[test]
    fn test_fd_is_move_only() {
        let conn = test_conn();
        assert!(conn.has_fd());

        let fd = conn.take_fd().unwrap();
        assert!(!conn.has_fd());
        assert!(conn.take_fd().is_none());
        assert!(conn.read_nb(&mut [0u8; 4]).is_err());

        conn.attach_fd(fd);
        assert!(conn.has_fd());
    }

    #[test]
    fn test_generation_bump() {
        let conn = test_conn();
        let first = conn.handle();
        assert_eq!(first.generation, 0);

        let assigned = conn.next_generation();
        assert_eq!(assigned.generation, 1);
        assert_eq!(conn.handle(), assigned);
    }

    #[test]
    fn test_refcount() {
        let conn = test_conn();
        assert_eq!(conn.refcount(), 1);
        assert_eq!(conn.ref_inc(), 2);
        assert_eq!(conn.ref_dec(), 1);
        assert_eq!(conn.ref_dec(), 0);
    }

    #[test]
    fn test_extension_slot() {
        struct BindingState {
            count: u32,
        }

        let conn = test_conn();
        assert!(conn.with_extension::<BindingState, _>(|_| ()).is_none());

        conn.set_extension(Box::new(BindingState { count: 3 }));
        let seen = conn.with_extension::<BindingState, u32>(|s| {
            s.count += 1;
            s.count
        });
        assert_eq!(seen, Some(4));

        assert!(conn.take_extension().is_some());
        assert!(conn.take_extension().is_none());
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let conn = test_conn();
        let mut buf = [0u8; 16];
        // init_sock_opts not applied in this unit test; pair() sockets are
        // blocking, so write a byte first and read it back instead
        let (a, b) = UnixStream::pair().unwrap();
        let fd: std::os::fd::OwnedFd = a.into();
        Connection::init_sock_opts(&fd).unwrap();
        let conn2 = Connection::new(
            ConnId(8),
            fd,
            conn.local_addr(),
            conn.peer_addr(),
            ProtoId(0),
            ConnState::Established,
            Owner::Dispatch,
        );
        let err = conn2.read_nb(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        use std::io::Write;
        (&b).write_all(b"ping").unwrap();
        assert_eq!(conn2.read_nb(&mut buf).unwrap(), 4);
    }
}
