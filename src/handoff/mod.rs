//! Fd-handoff channel and wire protocol
//!
//! Connection ownership moves between the dispatch process and workers as
//! a single message: a fixed-size control record with the socket fd
//! attached via `SCM_RIGHTS`. This module defines the record shapes
//! ([`AssignRecord`], [`ReturnRecord`]) and the channel itself
//! ([`HandoffChannel`]).

mod channel;
mod protocol;

pub use channel::HandoffChannel;
pub use protocol::{AssignRecord, Direction, FinalState, ReturnRecord, CONTROL_RECORD_SIZE};
