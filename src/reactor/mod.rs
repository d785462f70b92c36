//! Readiness reactor
//!
//! Per-process event multiplexer over a fixed-capacity fd table. Watched
//! fds carry a typed tag ([`FdKind`]) so the owning loop can route
//! readiness without side tables. The reactor never owns the fds it
//! watches; callers must deregister (`remove` with `Closing`) before
//! closing an fd, in that order, so no event is ever delivered for a dead
//! descriptor.
//!
//! The periodic timer is not a watched fd: [`run`] derives its poll
//! timeout from a [`TickClock`] and invokes the sink's `on_tick` once per
//! elapsed interval, which bounds timeout-sweep latency to one interval.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use crate::conn::ConnId;
use crate::error::ReactorError;

/// What a watched fd is, for event routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// A handoff channel (tagged with the peer worker index)
    Channel(u16),
    /// A connection's transport socket
    Conn(ConnId),
    /// A listening socket on the dispatch side
    Listener,
}

/// Why an fd is being deregistered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// The fd is about to be closed
    Closing,
    /// Interest is changing; the fd stays open
    Rearm,
}

/// One readiness notification
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub kind: FdKind,
    pub readable: bool,
    pub writable: bool,
}

/// Flow control returned by an [`EventSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    Stop,
}

/// Receiver of reactor dispatches
pub trait EventSink {
    /// One watched fd became ready; called at most once per fd per batch
    fn on_ready(&mut self, reactor: &mut Reactor, event: ReadyEvent) -> SinkFlow;

    /// One timer interval elapsed
    fn on_tick(&mut self, reactor: &mut Reactor) -> SinkFlow;
}

struct FdEntry {
    fd: RawFd,
    kind: FdKind,
    interest: Interest,
}

/// Fixed-capacity readiness multiplexer
pub struct Reactor {
    poller: Poll,
    events: Events,
    slots: Vec<Option<FdEntry>>,
    by_fd: HashMap<RawFd, usize>,
    free: Vec<usize>,
    capacity: usize,
}

impl Reactor {
    /// Create a reactor able to watch up to `capacity` fds
    ///
    /// # Errors
    ///
    /// Propagates poller creation failure.
    pub fn new(capacity: usize) -> Result<Self, ReactorError> {
        Ok(Self {
            poller: Poll::new()?,
            events: Events::with_capacity(capacity.clamp(8, 256)),
            slots: Vec::new(),
            by_fd: HashMap::new(),
            free: Vec::new(),
            capacity,
        })
    }

    /// Register read interest for `fd`
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` when the table is full.
    pub fn add_reader(&mut self, fd: RawFd, kind: FdKind) -> Result<(), ReactorError> {
        self.add(fd, kind, Interest::READABLE)
    }

    /// Register write interest for `fd`
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` when the table is full.
    pub fn add_writer(&mut self, fd: RawFd, kind: FdKind) -> Result<(), ReactorError> {
        self.add(fd, kind, Interest::WRITABLE)
    }

    fn add(&mut self, fd: RawFd, kind: FdKind, interest: Interest) -> Result<(), ReactorError> {
        if let Some(&slot) = self.by_fd.get(&fd) {
            // Same fd again: union the interest, refresh the tag
            let entry = self.slots[slot].as_mut().expect("slot consistent with index");
            let combined = entry.interest | interest;
            self.poller
                .registry()
                .reregister(&mut SourceFd(&fd), Token(slot), combined)?;
            if entry.kind != kind {
                debug!(fd, old = ?entry.kind, new = ?kind, "watched fd retagged");
                entry.kind = kind;
            }
            entry.interest = combined;
            return Ok(());
        }

        if self.by_fd.len() >= self.capacity {
            return Err(ReactorError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let slot = self.free.pop().unwrap_or(self.slots.len());
        self.poller
            .registry()
            .register(&mut SourceFd(&fd), Token(slot), interest)?;
        if slot == self.slots.len() {
            self.slots.push(None);
        }
        self.slots[slot] = Some(FdEntry { fd, kind, interest });
        self.by_fd.insert(fd, slot);
        trace!(fd, ?kind, "fd watched");
        Ok(())
    }

    /// Deregister `fd`; idempotent
    ///
    /// Returns `false` when the fd was not watched. With
    /// `RemoveReason::Closing` the caller closes the fd immediately after
    /// this returns.
    pub fn remove(&mut self, fd: RawFd, reason: RemoveReason) -> bool {
        let Some(slot) = self.by_fd.remove(&fd) else {
            trace!(fd, ?reason, "remove on unwatched fd ignored");
            return false;
        };
        if let Err(e) = self.poller.registry().deregister(&mut SourceFd(&fd)) {
            // Keep the table consistent even if the kernel-side dereg fails
            warn!(fd, "deregister failed: {}", e);
        }
        self.slots[slot] = None;
        self.free.push(slot);
        trace!(fd, ?reason, "fd unwatched");
        true
    }

    /// Whether `fd` is currently watched
    #[must_use]
    pub fn is_watched(&self, fd: RawFd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    /// Current tag of a watched fd
    #[must_use]
    pub fn kind_of(&self, fd: RawFd) -> Option<FdKind> {
        let slot = *self.by_fd.get(&fd)?;
        self.slots[slot].as_ref().map(|e| e.kind)
    }

    /// Number of watched fds
    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.by_fd.len()
    }

    /// Block until readiness or `timeout`, returning the ready batch
    ///
    /// # Errors
    ///
    /// Propagates poller failures; `EINTR` yields an empty batch instead.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>, ReactorError> {
        if let Err(e) = self.poller.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(ReactorError::Io(e));
        }

        let mut batch = Vec::with_capacity(self.events.iter().count());
        for event in &self.events {
            let slot = event.token().0;
            let Some(entry) = self.slots.get(slot).and_then(Option::as_ref) else {
                continue;
            };
            batch.push(ReadyEvent {
                fd: entry.fd,
                kind: entry.kind,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }
        Ok(batch)
    }
}

/// Periodic tick source driving the timeout sweep
#[derive(Debug, Clone)]
pub struct TickClock {
    start: Instant,
    interval: Duration,
    delivered: u64,
}

impl TickClock {
    /// Create a clock ticking every `interval`
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            start: Instant::now(),
            interval,
            delivered: 0,
        }
    }

    /// Ticks elapsed since the clock started
    #[must_use]
    pub fn now(&self) -> u64 {
        let elapsed = self.start.elapsed().as_nanos();
        let interval = self.interval.as_nanos().max(1);
        u64::try_from(elapsed / interval).unwrap_or(u64::MAX)
    }

    /// Time until the next undelivered tick is due
    #[must_use]
    pub fn until_next_tick(&self) -> Duration {
        let next = self.interval.saturating_mul(
            u32::try_from(self.delivered + 1).unwrap_or(u32::MAX),
        );
        next.saturating_sub(self.start.elapsed())
    }

    /// Consume the ticks that became due since the last call
    pub fn take_due(&mut self) -> u64 {
        let now = self.now();
        let due = now.saturating_sub(self.delivered);
        self.delivered = now;
        due
    }
}

/// Poll once and dispatch the batch plus any due ticks
///
/// Events for fds a handler already deregistered within the same batch are
/// skipped, and each event's tag is re-read at dispatch time, so a
/// reentrant removal can never route a stale event.
///
/// # Errors
///
/// Propagates poller failures.
pub fn step(
    reactor: &mut Reactor,
    clock: &mut TickClock,
    sink: &mut impl EventSink,
    max_wait: Duration,
) -> Result<SinkFlow, ReactorError> {
    let timeout = clock.until_next_tick().min(max_wait);
    let batch = reactor.poll(Some(timeout))?;

    for event in batch {
        let Some(kind) = reactor.kind_of(event.fd) else {
            continue;
        };
        let event = ReadyEvent { kind, ..event };
        if sink.on_ready(reactor, event) == SinkFlow::Stop {
            return Ok(SinkFlow::Stop);
        }
    }

    for _ in 0..clock.take_due() {
        if sink.on_tick(reactor) == SinkFlow::Stop {
            return Ok(SinkFlow::Stop);
        }
    }

    Ok(SinkFlow::Continue)
}

/// Run the dispatch loop until the sink stops it
///
/// # Errors
///
/// Propagates poller failures.
pub fn run(
    reactor: &mut Reactor,
    clock: &mut TickClock,
    sink: &mut impl EventSink,
) -> Result<(), ReactorError> {
    loop {
        if step(reactor, clock, sink, Duration::MAX)? == SinkFlow::Stop {
            return Ok(());
        }
    }
}
