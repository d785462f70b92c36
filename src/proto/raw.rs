//! Raw byte-stream binding
//!
//! The simplest useful protocol binding: drains whatever the socket has
//! into a per-connection buffer and flushes queued outbound bytes. No
//! framing; an embedder (or a test) takes received bytes out of the
//! extension slot and queues writes into it.

use std::io;

use bytes::{Buf, BytesMut};
use tracing::trace;

use super::{ProtoBinding, ReadOutcome, WriteOutcome};
use crate::conn::{ConnState, Connection};

/// Per-connection state kept in the extension slot
#[derive(Debug, Default)]
struct RawState {
    received: BytesMut,
    pending: BytesMut,
}

/// Byte-stream binding with no message framing
#[derive(Debug, Clone)]
pub struct RawBinding {
    read_chunk: usize,
}

impl RawBinding {
    /// Create a binding reading up to `read_chunk` bytes per event
    #[must_use]
    pub fn new(read_chunk: usize) -> Self {
        Self { read_chunk }
    }

    /// Queue bytes for the next write pass on this connection
    pub fn queue_pending(conn: &Connection, data: &[u8]) {
        Self::ensure_state(conn);
        conn.with_extension::<RawState, _>(|s| s.pending.extend_from_slice(data));
    }

    /// Take everything received so far
    pub fn take_received(conn: &Connection) -> Vec<u8> {
        conn.with_extension::<RawState, _>(|s| s.received.split().to_vec())
            .unwrap_or_default()
    }

    fn ensure_state(conn: &Connection) {
        if conn.with_extension::<RawState, _>(|_| ()).is_none() {
            conn.set_extension(Box::new(RawState::default()));
        }
    }
}

impl Default for RawBinding {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl ProtoBinding for RawBinding {
    fn read(&self, conn: &Connection) -> ReadOutcome {
        let mut buf = vec![0u8; self.read_chunk];
        match conn.read_nb(&mut buf) {
            Ok(0) => {
                trace!(conn = %conn.id(), "peer closed");
                conn.transition(ConnState::Eof);
                ReadOutcome::Progressed(0)
            }
            Ok(n) => {
                Self::ensure_state(conn);
                conn.with_extension::<RawState, _>(|s| s.received.extend_from_slice(&buf[..n]));
                // A raw stream has no partial messages to wait out
                conn.clear_read_attempts();
                ReadOutcome::Progressed(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::WouldBlock,
            Err(e) => {
                trace!(conn = %conn.id(), "read failed: {}", e);
                ReadOutcome::Fatal
            }
        }
    }

    fn write(&self, conn: &Connection) -> WriteOutcome {
        Self::ensure_state(conn);
        conn.with_extension::<RawState, _>(|s| {
            while !s.pending.is_empty() {
                match conn.write_nb(&s.pending) {
                    Ok(0) => return WriteOutcome::Fatal,
                    Ok(n) => s.pending.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return WriteOutcome::Pending;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        trace!(conn = %conn.id(), "write failed: {}", e);
                        return WriteOutcome::Fatal;
                    }
                }
            }
            WriteOutcome::Complete
        })
        .unwrap_or(WriteOutcome::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnId, Owner};
    use crate::proto::ProtoId;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn conn_pair() -> (Connection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let fd: OwnedFd = a.into();
        Connection::init_sock_opts(&fd).unwrap();
        let conn = Connection::new(
            ConnId(1),
            fd,
            "127.0.0.1:5060".parse().unwrap(),
            "192.0.2.1:2000".parse().unwrap(),
            ProtoId(0),
            ConnState::Established,
            Owner::Worker(0),
        );
        (conn, b)
    }

    #[test]
    fn test_read_drains_available_bytes() {
        let (conn, mut peer) = conn_pair();
        let binding = RawBinding::default();

        peer.write_all(b"hello").unwrap();
        assert_eq!(binding.read(&conn), ReadOutcome::Progressed(5));
        assert_eq!(RawBinding::take_received(&conn), b"hello");

        assert_eq!(binding.read(&conn), ReadOutcome::WouldBlock);
    }

    #[test]
    fn test_read_zero_sets_eof() {
        let (conn, peer) = conn_pair();
        let binding = RawBinding::default();

        drop(peer);
        assert_eq!(binding.read(&conn), ReadOutcome::Progressed(0));
        assert_eq!(conn.state(), ConnState::Eof);
    }

    #[test]
    fn test_write_flushes_pending() {
        let (conn, mut peer) = conn_pair();
        let binding = RawBinding::default();

        RawBinding::queue_pending(&conn, b"response");
        assert_eq!(binding.write(&conn), WriteOutcome::Complete);

        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"response");
    }

    #[test]
    fn test_write_with_nothing_pending_is_complete() {
        let (conn, _peer) = conn_pair();
        let binding = RawBinding::default();
        assert_eq!(binding.write(&conn), WriteOutcome::Complete);
    }
}
