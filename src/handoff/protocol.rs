//! Handoff wire protocol
//!
//! Every message on a handoff channel is one fixed-size control record of
//! two 64-bit words: the connection handle and a mode-or-state word. An
//! Assign travels dispatch → worker (fd attached unless it is a dispose
//! notice); a Return travels worker → dispatch (fd attached only for the
//! async-write state). Message boundaries are exactly the record size.

use std::ops::BitOr;

use crate::conn::ConnHandle;
use crate::error::ChannelError;
use crate::proto::ProtoId;

/// Size of one control record on the wire
pub const CONTROL_RECORD_SIZE: usize = 16;

/// Readiness directions a worker should watch for an assigned connection,
/// plus the dispose notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Direction(u8);

impl Direction {
    /// Watch for read readiness
    pub const READ: Self = Self(0b001);
    /// Attempt/watch writes
    pub const WRITE: Self = Self(0b010);
    /// Both directions
    pub const BOTH: Self = Self(0b011);
    /// Not a watch at all: forget this handle (no fd attached)
    pub const DISPOSE: Self = Self(0b100);

    const VALID_MASK: u8 = 0b111;

    /// Raw flag bits
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Validate wire bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits == 0 || bits & !Self::VALID_MASK != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    /// Whether all flags in `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Direction {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Final state reported by a worker when it lets go of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FinalState {
    /// Normal release; includes idle timeout
    Released = 0,
    /// Fault; the worker closed the fd
    Error = 1,
    /// Peer closed; the worker closed the fd
    Eof = 2,
    /// Write still pending; the fd rides back with this record
    AsyncWrite = 3,
}

impl FinalState {
    /// Validate a wire discriminant
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Released),
            1 => Some(Self::Error),
            2 => Some(Self::Eof),
            3 => Some(Self::AsyncWrite),
            _ => None,
        }
    }
}

/// Dispatch → worker: take ownership of this connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignRecord {
    pub handle: ConnHandle,
    pub direction: Direction,
    pub proto: ProtoId,
}

impl AssignRecord {
    /// Encode into the fixed wire record
    #[must_use]
    pub fn encode(&self) -> [u8; CONTROL_RECORD_SIZE] {
        let mut buf = [0u8; CONTROL_RECORD_SIZE];
        buf[..8].copy_from_slice(&self.handle.to_wire().to_le_bytes());
        let mode = u64::from(self.direction.bits()) | (u64::from(self.proto.0) << 8);
        buf[8..].copy_from_slice(&mode.to_le_bytes());
        buf
    }

    /// Decode from the fixed wire record
    ///
    /// # Errors
    ///
    /// `ChannelError::Malformed` on unknown direction bits or nonzero
    /// reserved bits.
    pub fn decode(buf: &[u8; CONTROL_RECORD_SIZE]) -> Result<Self, ChannelError> {
        let handle = ConnHandle::from_wire(u64::from_le_bytes(
            buf[..8].try_into().expect("record size"),
        ));
        let mode = u64::from_le_bytes(buf[8..].try_into().expect("record size"));
        if mode >> 16 != 0 {
            return Err(ChannelError::malformed(format!(
                "reserved assign bits set: {mode:#x}"
            )));
        }
        let direction = Direction::from_bits((mode & 0xff) as u8).ok_or_else(|| {
            ChannelError::malformed(format!("bad direction flags: {:#x}", mode & 0xff))
        })?;
        let proto = ProtoId(((mode >> 8) & 0xff) as u8);
        Ok(Self {
            handle,
            direction,
            proto,
        })
    }
}

/// Worker → dispatch: this connection's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnRecord {
    pub handle: ConnHandle,
    pub state: FinalState,
}

impl ReturnRecord {
    /// Encode into the fixed wire record
    #[must_use]
    pub fn encode(&self) -> [u8; CONTROL_RECORD_SIZE] {
        let mut buf = [0u8; CONTROL_RECORD_SIZE];
        buf[..8].copy_from_slice(&self.handle.to_wire().to_le_bytes());
        buf[8..].copy_from_slice(&u64::from(self.state as u8).to_le_bytes());
        buf
    }

    /// Decode from the fixed wire record
    ///
    /// # Errors
    ///
    /// `ChannelError::Malformed` on an unknown final state.
    pub fn decode(buf: &[u8; CONTROL_RECORD_SIZE]) -> Result<Self, ChannelError> {
        let handle = ConnHandle::from_wire(u64::from_le_bytes(
            buf[..8].try_into().expect("record size"),
        ));
        let word = u64::from_le_bytes(buf[8..].try_into().expect("record size"));
        if word >> 8 != 0 {
            return Err(ChannelError::malformed(format!(
                "reserved return bits set: {word:#x}"
            )));
        }
        let state = FinalState::from_u8((word & 0xff) as u8)
            .ok_or_else(|| ChannelError::malformed(format!("bad final state: {word}")))?;
        Ok(Self { handle, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnId;

    fn handle() -> ConnHandle {
        ConnHandle {
            id: ConnId(1234),
            generation: 7,
        }
    }

    #[test]
    fn test_assign_roundtrip() {
        let rec = AssignRecord {
            handle: handle(),
            direction: Direction::READ | Direction::WRITE,
            proto: ProtoId(5),
        };
        let decoded = AssignRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded, rec);
        assert!(decoded.direction.contains(Direction::READ));
        assert!(decoded.direction.contains(Direction::WRITE));
        assert!(!decoded.direction.contains(Direction::DISPOSE));
    }

    #[test]
    fn test_return_roundtrip() {
        for state in [
            FinalState::Released,
            FinalState::Error,
            FinalState::Eof,
            FinalState::AsyncWrite,
        ] {
            let rec = ReturnRecord {
                handle: handle(),
                state,
            };
            assert_eq!(ReturnRecord::decode(&rec.encode()).unwrap(), rec);
        }
    }

    #[test]
    fn test_assign_rejects_bad_direction() {
        let mut buf = AssignRecord {
            handle: handle(),
            direction: Direction::READ,
            proto: ProtoId(0),
        }
        .encode();
        buf[8] = 0; // no direction bits at all
        assert!(AssignRecord::decode(&buf).is_err());

        buf[8] = 0xff; // unknown bits
        assert!(AssignRecord::decode(&buf).is_err());
    }

    #[test]
    fn test_return_rejects_bad_state() {
        let mut buf = ReturnRecord {
            handle: handle(),
            state: FinalState::Released,
        }
        .encode();
        buf[8] = 9;
        assert!(ReturnRecord::decode(&buf).is_err());
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let mut buf = ReturnRecord {
            handle: handle(),
            state: FinalState::Released,
        }
        .encode();
        buf[15] = 1;
        assert!(ReturnRecord::decode(&buf).is_err());
    }
}
