//! Connection objects, registry, and statistics
//!
//! This module owns the unit of connection ownership ([`Connection`]), the
//! process-wide table of live connections ([`Registry`]), and the atomic
//! lifecycle counters ([`ConnStats`]).

mod object;
mod registry;
mod stats;

pub use object::{ConnHandle, ConnId, ConnInfo, ConnState, Connection, Owner};
pub use registry::{AcquireOutcome, ConnKey, Registry, ReleaseAction, ReleaseOutcome};
pub use stats::{ConnStats, StatsSnapshot};
