//! Dispatch-side coordination
//!
//! The dispatcher owns one handoff channel per worker. It moves freshly
//! created connections to workers (round robin), processes their Return
//! messages back into registry bookkeeping, schedules async-write
//! follow-ups, and reclaims everything a dead worker owned.
//!
//! A handoff is atomic from the registry's point of view: the generation
//! is bumped, the fd is detached, and both ride a single Assign message.
//! Stale Returns (earlier generation) are rejected here the same way
//! workers reject stale Assigns.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::conn::{ConnId, Connection, Owner, Registry, ReleaseAction, ReleaseOutcome};
use crate::error::DispatchError;
use crate::handoff::{AssignRecord, Direction, FinalState, HandoffChannel, ReturnRecord};
use crate::reactor::{FdKind, Reactor, RemoveReason};

/// Result of draining one worker channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// All queued Returns processed
    Drained,
    /// The channel is dead; the worker's connections were reclaimed
    WorkerGone,
}

struct WorkerSlot {
    channel: HandoffChannel,
    alive: bool,
}

/// Dispatch-side connection coordinator
pub struct Dispatcher {
    registry: Arc<Registry>,
    workers: Vec<WorkerSlot>,
    next_worker: usize,
    pending_writes: VecDeque<ConnId>,
}

impl Dispatcher {
    /// Create a dispatcher over the given registry
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            workers: Vec::new(),
            next_worker: 0,
            pending_writes: VecDeque::new(),
        }
    }

    /// Register a worker's dispatch-side channel end; returns its index
    pub fn add_worker(&mut self, channel: HandoffChannel) -> u16 {
        self.workers.push(WorkerSlot {
            channel,
            alive: true,
        });
        let index = u16::try_from(self.workers.len() - 1).unwrap_or(u16::MAX);
        info!(worker = index, "worker channel registered");
        index
    }

    /// The registry this dispatcher serves
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Number of workers still reachable
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    /// Channel fd of a live worker, for reactor registration
    #[must_use]
    pub fn worker_channel_fd(&self, worker: u16) -> Option<RawFd> {
        self.workers
            .get(usize::from(worker))
            .filter(|w| w.alive)
            .map(|w| w.channel.raw_fd())
    }

    /// Watch every live worker channel on the given reactor
    ///
    /// # Errors
    ///
    /// Propagates reactor registration failure.
    pub fn register_channels(&self, reactor: &mut Reactor) -> Result<(), crate::error::ReactorError> {
        for (index, slot) in self.workers.iter().enumerate() {
            if slot.alive {
                let worker = u16::try_from(index).unwrap_or(u16::MAX);
                reactor.add_reader(slot.channel.raw_fd(), FdKind::Channel(worker))?;
            }
        }
        Ok(())
    }

    /// Hand a connection to the next live worker (round robin)
    ///
    /// # Errors
    ///
    /// `NoWorkers` when every worker is gone; otherwise whatever the
    /// chosen worker's assignment reports.
    pub fn assign(
        &mut self,
        conn: &Arc<Connection>,
        direction: Direction,
    ) -> Result<u16, DispatchError> {
        let total = self.workers.len();
        for _ in 0..total {
            let index = self.next_worker % total.max(1);
            self.next_worker = self.next_worker.wrapping_add(1);
            if self.workers.get(index).is_some_and(|w| w.alive) {
                let worker = u16::try_from(index).unwrap_or(u16::MAX);
                self.assign_to(worker, conn, direction)?;
                return Ok(worker);
            }
        }
        Err(DispatchError::NoWorkers)
    }

    /// Hand a connection to a specific worker
    ///
    /// On success the worker is the sole owner of the fd. On a send
    /// failure the fd is unrecoverable (the kernel already consumed the
    /// local copy), so the connection is released with an error outcome
    /// and the worker is marked dead.
    ///
    /// # Errors
    ///
    /// `WorkerLost` for a dead worker index, `Channel` for a send failure.
    pub fn assign_to(
        &mut self,
        worker: u16,
        conn: &Arc<Connection>,
        direction: Direction,
    ) -> Result<(), DispatchError> {
        let index = usize::from(worker);
        if !self.workers.get(index).is_some_and(|w| w.alive) {
            return Err(DispatchError::WorkerLost { index: worker });
        }

        let handle = self.registry.begin_handoff(conn);
        let Some(fd) = conn.take_fd() else {
            self.registry.abort_handoff(conn);
            return Err(DispatchError::Registry(
                crate::error::RegistryError::FdUnavailable { id: conn.id().0 },
            ));
        };

        let record = AssignRecord {
            handle,
            direction,
            proto: conn.proto(),
        };
        match self.workers[index].channel.send_assign(&record, Some(fd)) {
            Ok(()) => {
                self.registry.finish_handoff(conn, worker);
                debug!(conn = %handle, worker, "assigned");
                Ok(())
            }
            Err(e) => {
                warn!(conn = %handle, worker, "assign failed: {}", e);
                self.registry.abort_handoff(conn);
                self.worker_lost(worker);
                // The fd went down with the send; the connection is dead
                self.release(conn, ReleaseOutcome::Error);
                Err(DispatchError::Channel(e))
            }
        }
    }

    /// Drain queued Returns from one worker channel
    pub fn pump_returns(&mut self, worker: u16) -> PumpOutcome {
        let index = usize::from(worker);
        loop {
            let received = match self.workers.get_mut(index) {
                Some(slot) if slot.alive => slot.channel.recv_return(),
                _ => return PumpOutcome::WorkerGone,
            };
            match received {
                Ok(Some((record, fd))) => self.handle_return(worker, record, fd),
                Ok(None) => return PumpOutcome::Drained,
                Err(e) => {
                    warn!(worker, "worker channel failed: {}", e);
                    self.worker_lost(worker);
                    return PumpOutcome::WorkerGone;
                }
            }
        }
    }

    /// Reactor hook: a worker channel became readable
    ///
    /// Deregisters the channel when the worker turns out to be gone.
    pub fn on_channel_ready(&mut self, reactor: &mut Reactor, worker: u16) {
        let fd = self.worker_channel_fd(worker);
        if self.pump_returns(worker) == PumpOutcome::WorkerGone {
            if let Some(fd) = fd {
                reactor.remove(fd, RemoveReason::Closing);
            }
        }
    }

    /// Timer hook: send queued async-write follow-ups
    pub fn on_tick(&mut self) {
        self.flush_pending_writes();
    }

    /// Drop a reference taken via create/acquire, executing whatever
    /// side effect the registry resolves for it
    pub fn release(&mut self, conn: &Arc<Connection>, outcome: ReleaseOutcome) {
        match self.registry.release(conn, outcome) {
            ReleaseAction::Noop | ReleaseAction::Removed => {}
            ReleaseAction::AsyncWriteFollowup => {
                self.pending_writes.push_back(conn.id());
            }
            ReleaseAction::NotifyWorker { worker } => self.send_dispose(worker, conn),
        }
    }

    /// Send every queued async-write follow-up that is still sendable
    pub fn flush_pending_writes(&mut self) {
        let queued: Vec<ConnId> = self.pending_writes.drain(..).collect();
        for id in queued {
            let Some(conn) = self.registry.get(id) else {
                continue;
            };
            if !conn.has_fd() {
                trace!(conn = %id, "write follow-up skipped; fd not home");
                continue;
            }
            if let Err(e) = self.assign(&conn, Direction::WRITE) {
                warn!(conn = %id, "write follow-up failed: {}", e);
            }
        }
    }

    /// A worker died: reclaim every connection it owned
    pub fn worker_lost(&mut self, worker: u16) {
        let index = usize::from(worker);
        let Some(slot) = self.workers.get_mut(index) else {
            return;
        };
        if !slot.alive {
            return;
        }
        slot.alive = false;

        let lost = self.registry.owned_by(worker);
        warn!(worker, conns = lost.len(), "worker lost; reclaiming its connections");
        for conn in lost {
            // The fd died with the worker; nothing left to notify
            conn.set_owner(Owner::Gone);
            self.registry.release(&conn, ReleaseOutcome::Error);
        }
    }

    /// Close every worker channel; workers observe peer exit and drain
    pub fn shutdown(&mut self) {
        info!(workers = self.workers.len(), "closing worker channels");
        for slot in &mut self.workers {
            slot.alive = false;
        }
        self.workers.clear();
    }

    fn handle_return(&mut self, worker: u16, record: ReturnRecord, fd: Option<std::os::fd::OwnedFd>) {
        let ReturnRecord { handle, state } = record;
        let Some(conn) = self.registry.get(handle.id) else {
            warn!(worker, conn = %handle, "return for unknown connection");
            drop(fd);
            return;
        };
        if conn.handle().generation != handle.generation {
            warn!(
                worker,
                conn = %handle,
                current = conn.handle().generation,
                "stale return rejected"
            );
            drop(fd);
            return;
        }
        trace!(worker, conn = %handle, ?state, "return received");

        match state {
            FinalState::AsyncWrite => {
                let Some(fd) = fd else {
                    warn!(worker, conn = %handle, "async-write return without an fd");
                    conn.set_owner(Owner::Gone);
                    self.release(&conn, ReleaseOutcome::Error);
                    return;
                };
                conn.attach_fd(fd);
                conn.set_owner(Owner::Dispatch);
                self.registry.stats().record_async_write();
                self.pending_writes.push_back(conn.id());
            }
            FinalState::Released | FinalState::Eof | FinalState::Error => {
                if fd.is_some() {
                    warn!(worker, conn = %handle, "unexpected fd on terminal return");
                    drop(fd);
                }
                // The worker already closed its copy; nobody holds the fd
                conn.set_owner(Owner::Gone);
                let outcome = match state {
                    FinalState::Released => ReleaseOutcome::Normal {
                        pending_write: false,
                    },
                    FinalState::Eof => ReleaseOutcome::Eof,
                    _ => ReleaseOutcome::Error,
                };
                self.release(&conn, outcome);
            }
        }
    }

    fn send_dispose(&mut self, worker: u16, conn: &Arc<Connection>) {
        let index = usize::from(worker);
        let Some(slot) = self.workers.get(index) else {
            return;
        };
        if !slot.alive {
            return;
        }
        let record = AssignRecord {
            handle: conn.handle(),
            direction: Direction::DISPOSE,
            proto: conn.proto(),
        };
        if let Err(e) = slot.channel.send_assign(&record, None) {
            warn!(worker, conn = %conn.handle(), "dispose notice failed: {}", e);
        }
    }
}
