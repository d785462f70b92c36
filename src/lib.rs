//! connmux: multi-process TCP connection manager
//!
//! This crate owns the lifecycle of TCP connections in a proxy split into a
//! dispatch process and a pool of worker processes. The dispatch side
//! accepts or opens connections and hands the socket fd to a worker over a
//! local `SCM_RIGHTS`-capable channel; the worker multiplexes readiness
//! across its connections with a single-threaded reactor, drives protocol
//! bindings, and reclaims idle or broken connections on a periodic sweep.
//!
//! # Architecture
//!
//! ```text
//! accept/connect → Registry ── Assign {handle, dir|proto} + fd ──→ Worker 0
//!                     │                                            Worker 1
//!                     │◀── Return {handle, final state} [+ fd] ──  Worker N
//!                     │
//!                 admin socket (introspection)
//! ```
//!
//! A connection's fd is owned by exactly one process at any instant; the
//! handoff message is the atomic transfer point. Each handoff bumps the
//! connection's generation so stale assigns and returns are rejected
//! deterministically.
//!
//! # Quick Start
//!
//! ```no_run
//! use connmux::conn::{ConnState, Registry};
//! use connmux::dispatch::Dispatcher;
//! use connmux::handoff::Direction;
//! use connmux::proto::ProtoId;
//!
//! # fn example(fd: std::os::fd::OwnedFd) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = std::sync::Arc::new(Registry::new(1024));
//! let mut dispatcher = Dispatcher::new(registry.clone());
//! // channels to workers are added with dispatcher.add_worker(...)
//!
//! let local = "127.0.0.1:5060".parse()?;
//! let peer = "192.0.2.1:49152".parse()?;
//! let conn = registry.create(fd, local, peer, ProtoId(0), ConnState::Established)?;
//! dispatcher.assign(&conn, Direction::READ)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`conn`]: Connection objects, registry, and statistics
//! - [`handoff`]: Fd-handoff channel and wire protocol
//! - [`reactor`]: Readiness multiplexer and timer source
//! - [`worker`]: Per-worker event loop and timeout sweep
//! - [`dispatch`]: Dispatch-side assignment and return processing
//! - [`proto`]: Protocol binding interface
//! - [`admin`]: Admin socket for introspection
//! - [`mask`]: Identifier masking codec
//! - [`error`]: Error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod admin;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod error;
pub mod handoff;
pub mod mask;
pub mod proto;
pub mod reactor;
pub mod worker;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use conn::{AcquireOutcome, ConnId, ConnState, Connection, Registry};
pub use dispatch::Dispatcher;
pub use error::{
    ChannelError, ConfigError, ConnMuxError, DispatchError, ReactorError, RegistryError,
    WorkerError,
};
pub use handoff::{Direction, FinalState, HandoffChannel};
pub use proto::{ProtoBinding, ProtoId, ReadOutcome, WriteOutcome};
pub use worker::{Worker, WorkerState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
