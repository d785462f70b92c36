//! End-to-end lifecycle tests: dispatch and worker wired over real
//! socketpairs in one thread, driven deterministically through
//! `Worker::step`.

use std::io::Write;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use connmux::conn::{
    AcquireOutcome, ConnHandle, ConnId, ConnKey, ConnState, Connection, Owner, Registry,
    ReleaseOutcome,
};
use connmux::dispatch::{Dispatcher, PumpOutcome};
use connmux::handoff::{AssignRecord, Direction, HandoffChannel};
use connmux::proto::{BindingTable, ProtoBinding, ProtoId, RawBinding, ReadOutcome, WriteOutcome};
use connmux::worker::{Worker, WorkerSettings, WorkerState};
use connmux::WorkerError;

const RAW: ProtoId = ProtoId(0);
const FATAL_READ: ProtoId = ProtoId(1);
const PENDING_WRITE: ProtoId = ProtoId(2);
const PARTIAL_READ: ProtoId = ProtoId(3);

/// Binding whose read always reports a protocol fault
struct FatalReadBinding;

impl ProtoBinding for FatalReadBinding {
    fn read(&self, _conn: &Connection) -> ReadOutcome {
        ReadOutcome::Fatal
    }

    fn write(&self, _conn: &Connection) -> WriteOutcome {
        WriteOutcome::Fatal
    }
}

/// Binding whose write never completes
struct PendingWriteBinding;

impl ProtoBinding for PendingWriteBinding {
    fn read(&self, _conn: &Connection) -> ReadOutcome {
        ReadOutcome::WouldBlock
    }

    fn write(&self, _conn: &Connection) -> WriteOutcome {
        WriteOutcome::Pending
    }
}

/// Binding that consumes bytes but always treats the message as
/// incomplete, recording a read attempt each time
struct PartialReadBinding;

impl ProtoBinding for PartialReadBinding {
    fn read(&self, conn: &Connection) -> ReadOutcome {
        let mut buf = [0u8; 256];
        match conn.read_nb(&mut buf) {
            Ok(0) => {
                conn.transition(ConnState::Eof);
                ReadOutcome::Progressed(0)
            }
            Ok(n) => {
                conn.note_read_attempt();
                ReadOutcome::Progressed(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(_) => ReadOutcome::Fatal,
        }
    }

    fn write(&self, _conn: &Connection) -> WriteOutcome {
        WriteOutcome::Complete
    }
}

fn bindings() -> Arc<BindingTable> {
    let table = BindingTable::new();
    table.register(RAW, Arc::new(RawBinding::default()));
    table.register(FATAL_READ, Arc::new(FatalReadBinding));
    table.register(PENDING_WRITE, Arc::new(PendingWriteBinding));
    table.register(PARTIAL_READ, Arc::new(PartialReadBinding));
    Arc::new(table)
}

fn settings(tick_ms: u64, processing_ticks: u64) -> WorkerSettings {
    WorkerSettings {
        max_fds: 64,
        tick_interval: Duration::from_millis(tick_ms),
        max_processing_ticks: processing_ticks,
        max_read_attempts: 4,
    }
}

struct Harness {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    worker: Worker,
}

impl Harness {
    /// Slow ticks and a huge processing window: timeouts stay out of the way
    fn new() -> Self {
        Self::with_settings(settings(200, 1000))
    }

    fn with_settings(settings: WorkerSettings) -> Self {
        let registry = Arc::new(Registry::new(32));
        let mut dispatcher = Dispatcher::new(Arc::clone(&registry));
        let (dispatch_end, worker_end) = HandoffChannel::pair().unwrap();
        dispatcher.add_worker(dispatch_end);
        let worker = Worker::new(0, worker_end, bindings(), settings).unwrap();
        Self {
            registry,
            dispatcher,
            worker,
        }
    }

    /// Create a registry connection whose peer end the test keeps
    fn connect(&self, proto: ProtoId) -> (Arc<Connection>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let fd: OwnedFd = ours.into();
        let local: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let peer: SocketAddr = "192.0.2.1:40000".parse().unwrap();
        let conn = self
            .registry
            .create(fd, local, peer, proto, ConnState::Established)
            .unwrap();
        (conn, theirs)
    }

    /// Step worker and dispatcher until `cond` holds or `limit` elapses
    fn settle_until(&mut self, limit: Duration, mut cond: impl FnMut(&mut Self) -> bool) -> bool {
        let start = Instant::now();
        loop {
            if cond(self) {
                return true;
            }
            if start.elapsed() >= limit {
                return false;
            }
            let _ = self.worker.step(Duration::from_millis(10));
            self.dispatcher.pump_returns(0);
        }
    }
}

#[test]
fn scenario_a_successful_read_keeps_connection_assigned() {
    let mut harness = Harness::new();
    let (conn, mut peer) = harness.connect(RAW);

    harness.dispatcher.assign(&conn, Direction::READ).unwrap();
    assert!(harness.settle_until(Duration::from_secs(2), |h| h.worker.connection_count() == 1));
    assert_eq!(conn.owner(), Owner::Worker(0));

    // Peer sends data; the binding consumes it successfully
    peer.write_all(b"REGISTER sip:example.test").unwrap();
    // Give the worker several dispatch rounds to chew on it
    let saw_drop = harness.settle_until(Duration::from_millis(300), |h| {
        h.worker.connection_count() == 0 || h.registry.is_empty()
    });

    // No Return was sent: the connection stays in the worker's list
    assert!(!saw_drop);
    assert_eq!(harness.worker.connection_count(), 1);
    assert_eq!(harness.registry.len(), 1);
    assert_eq!(harness.registry.stats().snapshot().released_error, 0);
}

#[test]
fn scenario_b_fatal_read_becomes_error_return() {
    let mut harness = Harness::new();
    let (conn, mut peer) = harness.connect(FATAL_READ);

    harness.dispatcher.assign(&conn, Direction::READ).unwrap();
    assert!(harness.settle_until(Duration::from_secs(2), |h| h.worker.connection_count() == 1));

    // Any readable byte triggers the binding, which reports a fault
    peer.write_all(b"junk").unwrap();
    assert!(harness.settle_until(Duration::from_secs(2), |h| h.registry.is_empty()));

    assert_eq!(harness.worker.connection_count(), 0);
    assert_eq!(conn.state(), ConnState::Closed);
    let stats = harness.registry.stats().snapshot();
    assert_eq!(stats.released_error, 1);
    assert_eq!(stats.released_normal, 0);
}

#[test]
fn scenario_c_idle_timeout_is_a_normal_release() {
    // 25 ms ticks, expiry after 2 ticks
    let mut harness = Harness::with_settings(settings(25, 2));
    let (conn, _peer) = harness.connect(RAW);

    let assigned_at = Instant::now();
    harness.dispatcher.assign(&conn, Direction::READ).unwrap();
    assert!(harness.settle_until(Duration::from_secs(2), |h| h.registry.is_empty()));

    // Monotonicity: never reclaimed before the deadline could have passed
    assert!(
        assigned_at.elapsed() >= Duration::from_millis(40),
        "released before the idle deadline"
    );
    let stats = harness.registry.stats().snapshot();
    assert_eq!(stats.released_normal, 1, "pure idleness is not a fault");
    assert_eq!(stats.released_error, 0);
    assert_eq!(harness.worker.connection_count(), 0);
}

#[test]
fn scenario_c_variant_stalled_partial_message_is_an_error() {
    let mut harness = Harness::with_settings(settings(25, 2));
    let (conn, mut peer) = harness.connect(PARTIAL_READ);

    harness.dispatcher.assign(&conn, Direction::READ).unwrap();
    assert!(harness.settle_until(Duration::from_secs(2), |h| h.worker.connection_count() == 1));

    // Half a message, then silence: the sweep must treat the peer as
    // stalled, not idle
    peer.write_all(b"INVITE sip:half").unwrap();
    assert!(harness.settle_until(Duration::from_secs(2), |h| h.registry.is_empty()));

    let stats = harness.registry.stats().snapshot();
    assert_eq!(stats.released_error, 1);
    assert_eq!(stats.released_normal, 0);
    drop(conn);
}

#[test]
fn scenario_d_channel_death_drains_worker() {
    let mut harness = Harness::new();
    let (conn, _peer) = harness.connect(RAW);

    harness.dispatcher.assign(&conn, Direction::READ).unwrap();
    assert!(harness.settle_until(Duration::from_secs(2), |h| h.worker.connection_count() == 1));

    // The dispatch process "exits": every channel end closes
    harness.dispatcher.shutdown();

    let start = Instant::now();
    let mut fatal = None;
    while start.elapsed() < Duration::from_secs(2) {
        match harness.worker.step(Duration::from_millis(10)) {
            Ok(WorkerState::Exited) => break,
            Ok(_) => {}
            Err(e) => {
                fatal = Some(e);
                break;
            }
        }
    }

    assert!(matches!(fatal, Some(WorkerError::ChannelFatal(_))));
    assert_eq!(harness.worker.state(), WorkerState::Exited);
    assert_eq!(harness.worker.connection_count(), 0);
}

#[test]
fn eof_returns_eof_outcome() {
    let mut harness = Harness::new();
    let (conn, peer) = harness.connect(RAW);

    harness.dispatcher.assign(&conn, Direction::READ).unwrap();
    assert!(harness.settle_until(Duration::from_secs(2), |h| h.worker.connection_count() == 1));

    drop(peer);
    assert!(harness.settle_until(Duration::from_secs(2), |h| h.registry.is_empty()));

    let stats = harness.registry.stats().snapshot();
    assert_eq!(stats.released_eof, 1);
    assert_eq!(stats.released_error, 0);
}

#[test]
fn async_write_hands_the_fd_back() {
    let mut harness = Harness::new();
    let (conn, _peer) = harness.connect(PENDING_WRITE);

    harness.dispatcher.assign(&conn, Direction::WRITE).unwrap();
    assert!(!conn.has_fd());

    // Worker attempts the write once, cannot finish, ships the fd back
    assert!(harness.settle_until(Duration::from_secs(2), |h| {
        h.dispatcher.pump_returns(0) == PumpOutcome::Drained && conn.has_fd()
    }));

    assert_eq!(conn.owner(), Owner::Dispatch);
    assert_eq!(harness.registry.len(), 1);
    assert_eq!(harness.worker.connection_count(), 0);
    assert!(harness.registry.stats().snapshot().async_write_returns >= 1);
}

#[test]
fn handoff_is_refcount_neutral() {
    let mut harness = Harness::new();
    let (conn, _peer) = harness.connect(RAW);

    // A second holder, as a send path would take
    match harness
        .registry
        .acquire(ConnKey::Id(conn.id()), Duration::from_millis(50))
    {
        AcquireOutcome::Acquired(_) => {}
        other => panic!("expected Acquired, got {other:?}"),
    }
    let before_assign = conn.refcount();
    assert_eq!(before_assign, 2);

    // Write assign with nothing pending completes immediately: the worker
    // sends a Released return
    harness.dispatcher.assign(&conn, Direction::WRITE).unwrap();
    assert_eq!(conn.refcount(), before_assign, "assign must not touch the refcount");

    // Step the worker only, so the Return sits unprocessed on the channel.
    // A completed write assign never links into the worker list; two
    // rounds are enough for the return to be on the wire.
    let _ = harness.worker.step(Duration::from_millis(20));
    let _ = harness.worker.step(Duration::from_millis(20));
    assert_eq!(
        conn.refcount(),
        before_assign,
        "refcount after Return equals refcount before Assign"
    );

    // Processing the Return drops the base reference only
    harness.dispatcher.pump_returns(0);
    assert_eq!(conn.refcount(), 1);
    assert_eq!(harness.registry.len(), 1, "outstanding holder keeps the entry");

    harness.dispatcher.release(
        &conn,
        ReleaseOutcome::Normal {
            pending_write: false,
        },
    );
    assert!(harness.registry.is_empty());
}

#[test]
fn duplicate_assign_leaves_worker_list_unchanged() {
    // Manual channel, no dispatcher: full control of the records
    let (dispatch_end, worker_end) = HandoffChannel::pair().unwrap();
    let mut worker = Worker::new(0, worker_end, bindings(), settings(200, 1000)).unwrap();

    let handle = ConnHandle {
        id: ConnId(77),
        generation: 1,
    };
    let record = AssignRecord {
        handle,
        direction: Direction::READ,
        proto: RAW,
    };

    let (_keep_a, fd_a) = UnixStream::pair().unwrap();
    dispatch_end.send_assign(&record, Some(fd_a.into())).unwrap();
    let start = Instant::now();
    while worker.connection_count() < 1 && start.elapsed() < Duration::from_secs(2) {
        worker.step(Duration::from_millis(10)).unwrap();
    }
    assert_eq!(worker.connection_count(), 1);

    // Retransmitted handoff for the same handle, carrying its own fd
    let (dup_peer, fd_b) = UnixStream::pair().unwrap();
    dispatch_end.send_assign(&record, Some(fd_b.into())).unwrap();
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(300) {
        worker.step(Duration::from_millis(10)).unwrap();
    }

    // List size unchanged; the duplicate's fd was closed, not adopted
    assert_eq!(worker.connection_count(), 1);
    dup_peer.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 1];
    use std::io::Read;
    match (&dup_peer).read(&mut buf) {
        Ok(0) => {} // EOF: the worker closed the duplicate fd
        other => panic!("expected the duplicate fd closed, got {other:?}"),
    }
}

#[test]
fn exactly_one_owner_at_every_stage() {
    let mut harness = Harness::new();
    let (conn, _peer) = harness.connect(RAW);

    // Created: dispatch owns the fd
    assert_eq!(conn.owner(), Owner::Dispatch);
    assert!(conn.has_fd());

    harness.dispatcher.assign(&conn, Direction::READ).unwrap();
    // Assigned: the worker side owns it; dispatch holds nothing
    assert_eq!(conn.owner(), Owner::Worker(0));
    assert!(!conn.has_fd());

    // Forced dispatch-side release while the worker owns the fd sends a
    // dispose notice and the worker closes its copy
    harness.dispatcher.release(&conn, ReleaseOutcome::Error);
    assert_eq!(conn.owner(), Owner::Gone);
    assert!(harness.settle_until(Duration::from_secs(2), |h| {
        h.worker.connection_count() == 0
    }));
    assert!(!conn.has_fd());
}
