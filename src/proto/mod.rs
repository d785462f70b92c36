//! Protocol binding interface
//!
//! A protocol binding supplies the application-layer read/write entry
//! points for one connection type. The worker loop invokes them on
//! readiness and interprets the outcome; the binding owns the
//! connection's extension slot and never touches the reactor or the
//! handoff channel.

mod raw;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::conn::Connection;

pub use raw::RawBinding;

/// Protocol type tag selecting a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtoId(pub u8);

impl fmt::Display for ProtoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a binding's read entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were consumed; more may be queued. The binding may also have
    /// transitioned the connection to `Eof`.
    Progressed(usize),
    /// No data presently available
    WouldBlock,
    /// Unrecoverable fault on this connection
    Fatal,
}

/// Outcome of a binding's write entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// All pending data flushed
    Complete,
    /// Data remains; the connection needs another write pass
    Pending,
    /// Unrecoverable fault on this connection
    Fatal,
}

/// Application-layer entry points for one protocol type
pub trait ProtoBinding: Send + Sync {
    /// Consume readable data from the connection
    ///
    /// Runs on the worker's event loop; must not block. A binding that
    /// buffers an incomplete message records a read attempt on the
    /// connection so the sweep can distinguish a stalled peer from an
    /// idle one.
    fn read(&self, conn: &Connection) -> ReadOutcome;

    /// Flush pending data to the connection
    ///
    /// The worker holds the connection's write lock across this call.
    fn write(&self, conn: &Connection) -> WriteOutcome;
}

/// Bindings registered per protocol tag
#[derive(Default)]
pub struct BindingTable {
    slots: RwLock<Vec<Option<Arc<dyn ProtoBinding>>>>,
}

impl BindingTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the binding for a protocol tag, replacing any previous one
    pub fn register(&self, proto: ProtoId, binding: Arc<dyn ProtoBinding>) {
        let mut slots = self.slots.write();
        let idx = usize::from(proto.0);
        if slots.len() <= idx {
            slots.resize_with(idx + 1, || None);
        }
        slots[idx] = Some(binding);
    }

    /// Look up the binding for a protocol tag
    #[must_use]
    pub fn get(&self, proto: ProtoId) -> Option<Arc<dyn ProtoBinding>> {
        self.slots
            .read()
            .get(usize::from(proto.0))
            .and_then(Clone::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopBinding;

    impl ProtoBinding for NoopBinding {
        fn read(&self, _conn: &Connection) -> ReadOutcome {
            ReadOutcome::WouldBlock
        }

        fn write(&self, _conn: &Connection) -> WriteOutcome {
            WriteOutcome::Complete
        }
    }

    #[test]
    fn test_binding_table_lookup() {
        let table = BindingTable::new();
        assert!(table.get(ProtoId(0)).is_none());

        table.register(ProtoId(3), Arc::new(NoopBinding));
        assert!(table.get(ProtoId(3)).is_some());
        assert!(table.get(ProtoId(0)).is_none());
        assert!(table.get(ProtoId(200)).is_none());
    }

    #[test]
    fn test_binding_table_replace() {
        let table = BindingTable::new();
        table.register(ProtoId(0), Arc::new(NoopBinding));
        table.register(ProtoId(0), Arc::new(NoopBinding));
        assert!(table.get(ProtoId(0)).is_some());
    }
}
