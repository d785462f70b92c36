//! Fd-handoff channel
//!
//! One bidirectional Unix socketpair per (dispatch, worker) pair, carrying
//! fixed-size control records with an optionally attached file descriptor
//! via `SCM_RIGHTS`. The receiving side becomes the sole owner of the
//! attached fd the instant the record is fully read; partial reads are
//! buffered and retried on the next readiness notification without
//! granting ownership. A zero-length read means the peer process exited.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tracing::warn;

use super::protocol::{AssignRecord, ReturnRecord, CONTROL_RECORD_SIZE};
use crate::error::ChannelError;

/// One end of a handoff channel
pub struct HandoffChannel {
    stream: UnixStream,
    rx_buf: [u8; CONTROL_RECORD_SIZE],
    rx_len: usize,
    /// Fd that arrived ahead of its record completing
    rx_fd: Option<OwnedFd>,
}

impl HandoffChannel {
    /// Create a connected channel pair (dispatch end, worker end)
    ///
    /// # Errors
    ///
    /// Propagates socketpair creation or non-blocking setup failures.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a)?, Self::from_stream(b)?))
    }

    /// Wrap an existing stream (e.g. one end of an inherited socketpair)
    ///
    /// # Errors
    ///
    /// Propagates the non-blocking setup failure.
    pub fn from_stream(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            rx_buf: [0u8; CONTROL_RECORD_SIZE],
            rx_len: 0,
            rx_fd: None,
        })
    }

    /// Wrap a raw fd inherited across exec (worker process startup)
    ///
    /// # Safety
    ///
    /// `fd` must be a valid, open Unix stream socket that the caller owns
    /// and does not use elsewhere.
    ///
    /// # Errors
    ///
    /// Propagates the non-blocking setup failure.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        Self::from_stream(UnixStream::from_raw_fd(fd))
    }

    /// Raw fd of the channel socket, for reactor registration
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Send an Assign, transferring `fd` to the peer
    ///
    /// The local copy of the fd is closed once the message is out; the
    /// kernel keeps the description alive for the receiver.
    ///
    /// # Errors
    ///
    /// `ChannelError::Io` on a fatal socket error (e.g. the peer is gone).
    pub fn send_assign(
        &self,
        record: &AssignRecord,
        fd: Option<OwnedFd>,
    ) -> Result<(), ChannelError> {
        self.send_record(&record.encode(), fd)
    }

    /// Send a Return, optionally carrying the fd back to dispatch
    ///
    /// # Errors
    ///
    /// `ChannelError::Io` on a fatal socket error.
    pub fn send_return(
        &self,
        record: &ReturnRecord,
        fd: Option<OwnedFd>,
    ) -> Result<(), ChannelError> {
        self.send_record(&record.encode(), fd)
    }

    /// Receive one Assign if a full record is available
    ///
    /// # Errors
    ///
    /// `PeerClosed` on a zero-length read, `Malformed` on undecodable
    /// records, `Io` on fatal socket errors.
    pub fn recv_assign(&mut self) -> Result<Option<(AssignRecord, Option<OwnedFd>)>, ChannelError> {
        match self.recv_record()? {
            Some((buf, fd)) => Ok(Some((AssignRecord::decode(&buf)?, fd))),
            None => Ok(None),
        }
    }

    /// Receive one Return if a full record is available
    ///
    /// # Errors
    ///
    /// `PeerClosed` on a zero-length read, `Malformed` on undecodable
    /// records, `Io` on fatal socket errors.
    pub fn recv_return(&mut self) -> Result<Option<(ReturnRecord, Option<OwnedFd>)>, ChannelError> {
        match self.recv_record()? {
            Some((buf, fd)) => Ok(Some((ReturnRecord::decode(&buf)?, fd))),
            None => Ok(None),
        }
    }

    /// Write one full record, attaching the fd to its first byte
    ///
    /// Control records are tiny, so short writes and `EAGAIN` are retried
    /// until the whole record is out (the original send_all semantics);
    /// the peer vanishing surfaces as a hard error instead.
    fn send_record(
        &self,
        payload: &[u8; CONTROL_RECORD_SIZE],
        fd: Option<OwnedFd>,
    ) -> Result<(), ChannelError> {
        let raw_attach = fd.as_ref().map(|f| [f.as_raw_fd()]);
        let mut sent = 0;
        while sent < CONTROL_RECORD_SIZE {
            let iov = [IoSlice::new(&payload[sent..])];
            let cmsgs: Vec<ControlMessage<'_>> = match &raw_attach {
                Some(fds) if sent == 0 => vec![ControlMessage::ScmRights(fds)],
                _ => Vec::new(),
            };
            match sendmsg::<()>(
                self.stream.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(n) => sent += n,
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => std::thread::yield_now(),
                Err(e) => {
                    return Err(ChannelError::Io(io::Error::from_raw_os_error(e as i32)));
                }
            }
        }
        // Sender's copy closes here; the receiver owns the transferred one
        drop(fd);
        Ok(())
    }

    /// Read toward one full record; `Ok(None)` when the socket would block
    fn recv_record(
        &mut self,
    ) -> Result<Option<([u8; CONTROL_RECORD_SIZE], Option<OwnedFd>)>, ChannelError> {
        loop {
            let mut cmsg_buf = cmsg_space!([RawFd; 1]);
            let received = {
                let mut iov = [IoSliceMut::new(&mut self.rx_buf[self.rx_len..])];
                match recvmsg::<()>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Ok(msg) => {
                        for cmsg in msg
                            .cmsgs()
                            .map_err(|e| ChannelError::malformed(format!("cmsg parse: {e}")))?
                        {
                            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                                for raw in fds {
                                    // SAFETY: SCM_RIGHTS installed this fd in
                                    // our table; we are its sole owner.
                                    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                                    if self.rx_fd.replace(owned).is_some() {
                                        warn!("second fd arrived before record completed; dropping the first");
                                    }
                                }
                            }
                        }
                        msg.bytes
                    }
                    Err(Errno::EAGAIN) => return Ok(None),
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(ChannelError::Io(io::Error::from_raw_os_error(e as i32)));
                    }
                }
            };

            if received == 0 {
                return Err(ChannelError::PeerClosed);
            }
            self.rx_len += received;
            if self.rx_len == CONTROL_RECORD_SIZE {
                self.rx_len = 0;
                return Ok(Some((self.rx_buf, self.rx_fd.take())));
            }
            // Partial record: keep pulling, more bytes may already be queued
        }
    }
}

impl std::fmt::Debug for HandoffChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffChannel")
            .field("fd", &self.raw_fd())
            .field("rx_len", &self.rx_len)
            .field("rx_fd_parked", &self.rx_fd.is_some())
            .finish()
    }
}
