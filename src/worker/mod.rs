//! Worker loop
//!
//! Each worker runs a single-threaded reactor over its handoff channel and
//! the connections currently assigned to it. Three event sources drive it:
//! the periodic tick (timeout sweep), Assign messages on the channel, and
//! readiness on connection fds, which is dispatched to the protocol
//! binding for the connection's type.
//!
//! Ownership rules: an assigned connection is linked into the local table
//! *before* its fd is registered with the reactor, so a readiness event
//! racing the registration always finds the entry. Deregistration always
//! precedes closing the fd. A worker that loses its channel force-releases
//! everything and exits; the dispatch side restarts it.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::config::WorkerConfig;
use crate::conn::{ConnHandle, ConnState, Connection, Owner};
use crate::error::{ChannelError, WorkerError};
use crate::handoff::{AssignRecord, Direction, FinalState, HandoffChannel, ReturnRecord};
use crate::proto::{BindingTable, ReadOutcome, WriteOutcome};
use crate::reactor::{self, EventSink, FdKind, Reactor, ReadyEvent, RemoveReason, SinkFlow, TickClock};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, reactor not yet armed
    Starting,
    /// Serving events
    Running,
    /// Channel died; force-releasing local connections
    Draining,
    /// Done; the process should exit
    Exited,
}

/// Worker tuning knobs
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Reactor fd table capacity
    pub max_fds: usize,
    /// Timer tick interval
    pub tick_interval: Duration,
    /// Ticks a connection may sit without traffic before expiring
    pub max_processing_ticks: u64,
    /// Read attempts on one message before the peer counts as stalled
    pub max_read_attempts: u32,
}

impl WorkerSettings {
    /// Derive settings from the worker section of the config
    #[must_use]
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_fds: config.max_fds,
            tick_interval: config.tick_interval(),
            max_processing_ticks: config.max_processing_ticks(),
            max_read_attempts: config.max_read_attempts,
        }
    }
}

/// What the worker does with a connection after an I/O event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventDecision {
    /// Stay linked and armed, wait for more events
    Keep,
    /// Unlink, close the fd locally, report this final state
    Release(FinalState),
    /// Unlink and hand the fd back to dispatch with the async-write state
    ReturnToDispatch,
}

/// A connection linked into this worker's table
struct LocalConn {
    conn: Arc<Connection>,
    direction: Direction,
}

/// Per-worker event loop
pub struct Worker {
    reactor: Reactor,
    clock: TickClock,
    core: WorkerCore,
}

impl Worker {
    /// Create a worker around its end of a handoff channel
    ///
    /// # Errors
    ///
    /// Propagates reactor creation failure.
    pub fn new(
        id: u16,
        channel: HandoffChannel,
        bindings: Arc<BindingTable>,
        settings: WorkerSettings,
    ) -> Result<Self, WorkerError> {
        let reactor = Reactor::new(settings.max_fds)?;
        let clock = TickClock::new(settings.tick_interval);
        Ok(Self {
            reactor,
            clock: clock.clone(),
            core: WorkerCore {
                id,
                state: WorkerState::Starting,
                channel,
                conns: BTreeMap::new(),
                bindings,
                clock,
                settings,
                fatal: None,
            },
        })
    }

    /// Arm the reactor: the handoff channel becomes a permanent source
    ///
    /// # Errors
    ///
    /// Fatal when the channel cannot be watched.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        self.reactor
            .add_reader(self.core.channel.raw_fd(), FdKind::Channel(self.core.id))?;
        self.core.state = WorkerState::Running;
        info!(worker = self.core.id, "worker running");
        Ok(())
    }

    /// Run until the channel dies
    ///
    /// # Errors
    ///
    /// `ChannelFatal` after draining, or a reactor failure.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        if self.core.state == WorkerState::Starting {
            self.start()?;
        }
        reactor::run(&mut self.reactor, &mut self.clock, &mut self.core)?;
        self.finish()
    }

    /// Drive one poll-dispatch-tick cycle, waiting at most `max_wait`
    ///
    /// Embedding and test entry point; [`Worker::run`] is this in a loop.
    ///
    /// # Errors
    ///
    /// `ChannelFatal` once the worker has drained and exited, or a reactor
    /// failure.
    pub fn step(&mut self, max_wait: Duration) -> Result<WorkerState, WorkerError> {
        match self.core.state {
            WorkerState::Starting => self.start()?,
            WorkerState::Exited => return self.finish().map(|()| WorkerState::Exited),
            _ => {}
        }
        let flow = reactor::step(&mut self.reactor, &mut self.clock, &mut self.core, max_wait)?;
        if flow == SinkFlow::Stop {
            self.finish()?;
        }
        Ok(self.core.state)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.core.state
    }

    /// Connections currently linked into this worker
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.core.conns.len()
    }

    fn finish(&mut self) -> Result<(), WorkerError> {
        match self.core.fatal.take() {
            Some(e) => Err(WorkerError::ChannelFatal(e)),
            None => Ok(()),
        }
    }
}

struct WorkerCore {
    id: u16,
    state: WorkerState,
    channel: HandoffChannel,
    conns: BTreeMap<u32, LocalConn>,
    bindings: Arc<BindingTable>,
    clock: TickClock,
    settings: WorkerSettings,
    fatal: Option<ChannelError>,
}

impl EventSink for WorkerCore {
    fn on_ready(&mut self, reactor: &mut Reactor, event: ReadyEvent) -> SinkFlow {
        match event.kind {
            FdKind::Channel(_) => self.drain_channel(reactor),
            FdKind::Conn(id) => {
                if event.readable {
                    self.conn_readable(reactor, id.0);
                }
                if event.writable && self.conns.contains_key(&id.0) {
                    self.conn_writable(reactor, id.0);
                }
                SinkFlow::Continue
            }
            FdKind::Listener => {
                warn!(worker = self.id, "listener event in a worker reactor");
                SinkFlow::Continue
            }
        }
    }

    fn on_tick(&mut self, reactor: &mut Reactor) -> SinkFlow {
        self.sweep(reactor);
        SinkFlow::Continue
    }
}

impl WorkerCore {
    /// Pull every queued message off the channel
    fn drain_channel(&mut self, reactor: &mut Reactor) -> SinkFlow {
        loop {
            match self.channel.recv_assign() {
                Ok(Some((record, fd))) => self.handle_assign(reactor, record, fd),
                Ok(None) => return SinkFlow::Continue,
                Err(e) => {
                    error!(worker = self.id, "handoff channel failed: {}", e);
                    self.drain(reactor, e);
                    return SinkFlow::Stop;
                }
            }
        }
    }

    fn handle_assign(
        &mut self,
        reactor: &mut Reactor,
        record: AssignRecord,
        fd: Option<OwnedFd>,
    ) {
        let AssignRecord {
            handle,
            direction,
            proto,
        } = record;

        if direction.contains(Direction::DISPOSE) {
            self.handle_dispose(reactor, handle, fd);
            return;
        }

        // A handle already linked here is a protocol violation: a
        // retransmitted or stale handoff. Reject it without touching the
        // live entry.
        if self.conns.contains_key(&handle.id.0) {
            warn!(worker = self.id, conn = %handle, "duplicate handoff rejected");
            drop(fd);
            return;
        }

        let Some(fd) = fd else {
            error!(worker = self.id, conn = %handle, "assign arrived without an fd");
            self.send_return(
                ReturnRecord {
                    handle,
                    state: FinalState::Error,
                },
                None,
            );
            return;
        };

        if let Err(e) = Connection::init_sock_opts(&fd) {
            warn!(worker = self.id, conn = %handle, "socket options on attach: {}", e);
        }
        let (local, peer) = socket_addrs(&fd);
        let conn = Arc::new(Connection::new(
            handle.id,
            fd,
            local,
            peer,
            proto,
            ConnState::Established,
            Owner::Worker(self.id),
        ));
        conn.set_generation(handle.generation);
        // Fresh message: no attempts yet, full processing window
        conn.clear_read_attempts();
        conn.set_deadline(self.clock.now() + self.settings.max_processing_ticks);
        trace!(worker = self.id, conn = %handle, %peer, "assign received");

        if direction.contains(Direction::READ) {
            // Link before registering: the registration may race an
            // already-pending event for this fd, and a reentrant dispatch
            // must find the entry.
            self.conns.insert(
                handle.id.0,
                LocalConn {
                    conn: Arc::clone(&conn),
                    direction,
                },
            );
            let raw = conn.raw_fd().expect("fd attached above");
            let mut registered = reactor.add_reader(raw, FdKind::Conn(handle.id));
            if registered.is_ok() && direction.contains(Direction::WRITE) {
                registered = reactor.add_writer(raw, FdKind::Conn(handle.id));
            }
            if let Err(e) = registered {
                error!(worker = self.id, conn = %handle, "cannot watch assigned fd: {}", e);
                reactor.remove(raw, RemoveReason::Closing);
                self.conns.remove(&handle.id.0);
                conn.transition(ConnState::Bad);
                drop(conn.take_fd());
                self.send_return(
                    ReturnRecord {
                        handle,
                        state: FinalState::Error,
                    },
                    None,
                );
            }
        } else if direction.contains(Direction::WRITE) {
            // Write assigns are one-shot: try now, report the outcome
            self.attempt_assigned_write(&conn, handle);
        }
    }

    fn handle_dispose(&mut self, reactor: &mut Reactor, handle: ConnHandle, fd: Option<OwnedFd>) {
        if let Some(stray) = fd {
            warn!(worker = self.id, conn = %handle, "dispose notice carried an fd");
            drop(stray);
        }
        let Some(entry) = self.conns.remove(&handle.id.0) else {
            trace!(worker = self.id, conn = %handle, "dispose for unknown handle");
            return;
        };
        if entry.conn.handle().generation != handle.generation {
            warn!(worker = self.id, conn = %handle, "stale dispose rejected");
            self.conns.insert(handle.id.0, entry);
            return;
        }
        if let Some(raw) = entry.conn.raw_fd() {
            reactor.remove(raw, RemoveReason::Closing);
        }
        entry.conn.transition(ConnState::Bad);
        drop(entry.conn.take_fd());
        debug!(worker = self.id, conn = %handle, "connection disposed on dispatch request");
    }

    /// One write attempt under the connection's write lock
    fn attempt_assigned_write(&mut self, conn: &Arc<Connection>, handle: ConnHandle) {
        let Some(binding) = self.bindings.get(conn.proto()) else {
            warn!(worker = self.id, conn = %handle, proto = %conn.proto(), "no binding registered");
            conn.transition(ConnState::Bad);
            drop(conn.take_fd());
            self.send_return(
                ReturnRecord {
                    handle,
                    state: FinalState::Error,
                },
                None,
            );
            return;
        };

        let outcome = {
            let _guard = conn.write_guard();
            binding.write(conn)
        };
        match outcome {
            WriteOutcome::Fatal => {
                conn.transition(ConnState::Bad);
                drop(conn.take_fd());
                self.send_return(
                    ReturnRecord {
                        handle,
                        state: FinalState::Error,
                    },
                    None,
                );
            }
            WriteOutcome::Pending => {
                // Not done: ownership goes back to dispatch with the data
                let fd = conn.take_fd();
                self.send_return(
                    ReturnRecord {
                        handle,
                        state: FinalState::AsyncWrite,
                    },
                    fd,
                );
            }
            WriteOutcome::Complete => {
                drop(conn.take_fd());
                self.send_return(
                    ReturnRecord {
                        handle,
                        state: FinalState::Released,
                    },
                    None,
                );
            }
        }
    }

    fn conn_readable(&mut self, reactor: &mut Reactor, id: u32) {
        let Some(entry) = self.conns.get(&id) else {
            return;
        };
        let conn = Arc::clone(&entry.conn);

        let decision = match self.bindings.get(conn.proto()) {
            None => {
                warn!(worker = self.id, conn = %conn.id(), proto = %conn.proto(), "no binding registered");
                EventDecision::Release(FinalState::Error)
            }
            Some(binding) => match binding.read(&conn) {
                ReadOutcome::Fatal => EventDecision::Release(FinalState::Error),
                _ if conn.state() == ConnState::Eof => EventDecision::Release(FinalState::Eof),
                ReadOutcome::Progressed(n) => {
                    if n > 0 {
                        // Traffic observed: push the deadline out
                        conn.set_deadline(self.clock.now() + self.settings.max_processing_ticks);
                    }
                    self.check_attempt_bound(&conn)
                }
                ReadOutcome::WouldBlock => self.check_attempt_bound(&conn),
            },
        };
        self.apply(reactor, &conn, decision);
    }

    fn conn_writable(&mut self, reactor: &mut Reactor, id: u32) {
        let Some(entry) = self.conns.get(&id) else {
            return;
        };
        let conn = Arc::clone(&entry.conn);
        let direction = entry.direction;

        let Some(binding) = self.bindings.get(conn.proto()) else {
            self.apply(reactor, &conn, EventDecision::Release(FinalState::Error));
            return;
        };

        let outcome = {
            let _guard = conn.write_guard();
            binding.write(&conn)
        };
        let decision = match outcome {
            WriteOutcome::Fatal => EventDecision::Release(FinalState::Error),
            WriteOutcome::Pending => EventDecision::ReturnToDispatch,
            WriteOutcome::Complete => {
                if direction.contains(Direction::READ) {
                    // Flushed: drop write interest, keep reading
                    if let Some(raw) = conn.raw_fd() {
                        reactor.remove(raw, RemoveReason::Rearm);
                        if let Err(e) = reactor.add_reader(raw, FdKind::Conn(conn.id())) {
                            error!(worker = self.id, conn = %conn.id(), "rearm failed: {}", e);
                            self.apply(reactor, &conn, EventDecision::Release(FinalState::Error));
                            return;
                        }
                    }
                    EventDecision::Keep
                } else {
                    EventDecision::Release(FinalState::Released)
                }
            }
        };
        self.apply(reactor, &conn, decision);
    }

    /// A peer that keeps us holding a partial message too long is stalled
    fn check_attempt_bound(&self, conn: &Arc<Connection>) -> EventDecision {
        if conn.read_attempts() > self.settings.max_read_attempts {
            warn!(
                worker = self.id,
                conn = %conn.id(),
                attempts = conn.read_attempts(),
                "message stalled past attempt bound"
            );
            EventDecision::Release(FinalState::Error)
        } else {
            EventDecision::Keep
        }
    }

    fn apply(&mut self, reactor: &mut Reactor, conn: &Arc<Connection>, decision: EventDecision) {
        match decision {
            EventDecision::Keep => {}
            EventDecision::Release(state) => {
                self.unlink(reactor, conn);
                if state == FinalState::Error && !conn.state().is_terminal() {
                    conn.transition(ConnState::Bad);
                }
                let handle = conn.handle();
                drop(conn.take_fd());
                self.send_return(ReturnRecord { handle, state }, None);
            }
            EventDecision::ReturnToDispatch => {
                self.unlink(reactor, conn);
                let handle = conn.handle();
                let fd = conn.take_fd();
                self.send_return(
                    ReturnRecord {
                        handle,
                        state: FinalState::AsyncWrite,
                    },
                    fd,
                );
            }
        }
    }

    /// Deregister (before any close) and drop the table entry
    fn unlink(&mut self, reactor: &mut Reactor, conn: &Arc<Connection>) {
        if let Some(raw) = conn.raw_fd() {
            reactor.remove(raw, RemoveReason::Closing);
        }
        self.conns.remove(&conn.id().0);
    }

    /// Reclaim expired and broken connections; runs once per tick
    fn sweep(&mut self, reactor: &mut Reactor) {
        let now = self.clock.now();
        let ids: Vec<u32> = self.conns.keys().copied().collect();
        for id in ids {
            let Some(entry) = self.conns.get(&id) else {
                continue;
            };
            let conn = Arc::clone(&entry.conn);

            if conn.state() == ConnState::Bad || conn.state() == ConnState::Closed {
                debug!(worker = self.id, conn = %conn.id(), "sweeping bad connection");
                self.apply(reactor, &conn, EventDecision::Release(FinalState::Error));
                continue;
            }
            if conn.deadline() <= now {
                let stalled = conn.read_attempts() > 0;
                debug!(
                    worker = self.id,
                    conn = %conn.id(),
                    deadline = conn.deadline(),
                    now,
                    stalled,
                    "connection expired"
                );
                let state = if stalled {
                    FinalState::Error
                } else {
                    FinalState::Released
                };
                self.apply(reactor, &conn, EventDecision::Release(state));
            }
        }
    }

    /// Channel death: force-release everything and exit
    fn drain(&mut self, reactor: &mut Reactor, cause: ChannelError) {
        self.state = WorkerState::Draining;
        warn!(
            worker = self.id,
            conns = self.conns.len(),
            "draining after channel failure: {}",
            cause
        );

        let entries: Vec<LocalConn> = std::mem::take(&mut self.conns).into_values().collect();
        for entry in entries {
            let conn = entry.conn;
            if let Some(raw) = conn.raw_fd() {
                reactor.remove(raw, RemoveReason::Closing);
            }
            if !conn.state().is_terminal() {
                conn.transition(ConnState::Bad);
            }
            let handle = conn.handle();
            drop(conn.take_fd());
            // Best effort: the only path back is the channel that died
            let _ = self.channel.send_return(
                &ReturnRecord {
                    handle,
                    state: FinalState::Error,
                },
                None,
            );
        }

        reactor.remove(self.channel.raw_fd(), RemoveReason::Closing);
        self.state = WorkerState::Exited;
        self.fatal = Some(cause);
    }

    fn send_return(&self, record: ReturnRecord, fd: Option<OwnedFd>) {
        trace!(worker = self.id, conn = %record.handle, state = ?record.state, "return sent");
        if let Err(e) = self.channel.send_return(&record, fd) {
            error!(worker = self.id, conn = %record.handle, "failed to send return: {}", e);
        }
    }
}

/// Recover the address pair from the transferred socket itself
fn socket_addrs(fd: &OwnedFd) -> (SocketAddr, SocketAddr) {
    let sock = socket2::SockRef::from(fd);
    let local = sock
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .unwrap_or_else(unspecified_addr);
    let peer = sock
        .peer_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .unwrap_or_else(unspecified_addr);
    (local, peer)
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}
