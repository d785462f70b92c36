//! Connection lifecycle statistics
//!
//! Atomic counters updated by the registry and the dispatcher, snapshotted
//! for the admin socket.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic connection statistics
#[derive(Debug, Default)]
pub struct ConnStats {
    /// Connections created in the registry
    created: AtomicU64,
    /// Assignments sent to workers
    assigned: AtomicU64,
    /// Normal releases (including idle timeouts)
    released_normal: AtomicU64,
    /// EOF releases
    released_eof: AtomicU64,
    /// Error releases (protocol faults, stalled peers, worker loss)
    released_error: AtomicU64,
    /// Async-write returns (fd came back with pending data)
    async_write_returns: AtomicU64,
    /// Creations rejected at capacity
    rejected: AtomicU64,
    /// Currently live connections
    active: AtomicU64,
}

impl ConnStats {
    /// Create new connection statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a created connection
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an assignment to a worker
    pub fn record_assigned(&self) {
        self.assigned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a normal release
    pub fn record_released_normal(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.released_normal.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an EOF release
    pub fn record_released_eof(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.released_eof.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error release
    pub fn record_released_error(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.released_error.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an async-write return (connection stays live)
    pub fn record_async_write(&self) {
        self.async_write_returns.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a creation rejected at capacity
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Currently live connections
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            assigned: self.assigned.load(Ordering::Relaxed),
            released_normal: self.released_normal.load(Ordering::Relaxed),
            released_eof: self.released_eof.load(Ordering::Relaxed),
            released_error: self.released_error.load(Ordering::Relaxed),
            async_write_returns: self.async_write_returns.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub created: u64,
    pub assigned: u64,
    pub released_normal: u64,
    pub released_eof: u64,
    pub released_error: u64,
    pub async_write_returns: u64,
    pub rejected: u64,
    pub active: u64,
}
