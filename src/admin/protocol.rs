//! Admin protocol definitions
//!
//! This module defines the command and response types used for
//! administrative introspection via Unix socket. Messages are JSON with a
//! 4-byte big-endian length prefix.

use serde::{Deserialize, Serialize};

use crate::conn::{ConnInfo, StatsSnapshot};

/// Maximum admin message size
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1 MB
/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Admin command types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Ping to check if the dispatch process is alive
    Ping,

    /// Get the running version
    Version,

    /// List every live connection
    ListConns,

    /// Get lifecycle statistics
    GetStats,

    /// Initiate shutdown: worker channels close, workers drain and exit
    Shutdown,
}

/// Admin response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminResponse {
    /// Reply to Ping
    Pong,

    /// Reply to Version
    Version {
        /// Crate version string
        version: String,
    },

    /// Reply to ListConns
    Conns {
        /// One entry per live connection
        connections: Vec<ConnInfo>,
    },

    /// Reply to GetStats
    Stats {
        /// Lifecycle counters snapshot
        stats: StatsSnapshot,
    },

    /// Reply to Shutdown
    ShuttingDown,

    /// Command failed
    Error {
        /// Machine-readable error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The command could not be decoded
    InvalidCommand,
    /// The command failed internally
    Internal,
}

/// Encode a message with its length prefix
///
/// # Errors
///
/// Propagates serialization failure.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len()).unwrap_or(u32::MAX);

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode a message payload (after the length prefix)
///
/// # Errors
///
/// Propagates deserialization failure.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        let cmd = AdminCommand::ListConns;
        let encoded = encode_message(&cmd).unwrap();

        let len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - LENGTH_PREFIX_SIZE);

        let decoded: AdminCommand = decode_message(&encoded[4..]).unwrap();
        assert!(matches!(decoded, AdminCommand::ListConns));
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = AdminResponse::Error {
            code: ErrorCode::InvalidCommand,
            message: "bad".into(),
        };
        let encoded = encode_message(&resp).unwrap();
        let decoded: AdminResponse = decode_message(&encoded[4..]).unwrap();
        assert!(matches!(
            decoded,
            AdminResponse::Error {
                code: ErrorCode::InvalidCommand,
                ..
            }
        ));
    }

    #[test]
    fn test_command_wire_format() {
        let encoded = encode_message(&AdminCommand::Ping).unwrap();
        let json = std::str::from_utf8(&encoded[4..]).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_message::<AdminCommand>(b"not json").is_err());
    }
}
