//! Error types for connmux
//!
//! This module defines the error hierarchy for the connection manager.
//! All errors are categorized by subsystem and include recovery hints.

use std::io;

use thiserror::Error;

/// Top-level error type for connmux
#[derive(Debug, Error)]
pub enum ConnMuxError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Fd-handoff channel errors
    #[error("Handoff channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Reactor errors
    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),

    /// Worker loop errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Dispatch coordination errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Admin socket errors
    #[error("Admin error: {0}")]
    Admin(#[from] AdminError),

    /// Identifier masking errors
    #[error("Mask error: {0}")]
    Mask(#[from] MaskError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnMuxError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Registry(e) => e.is_recoverable(),
            Self::Channel(e) => e.is_recoverable(),
            Self::Reactor(e) => e.is_recoverable(),
            Self::Worker(_) => false,
            Self::Dispatch(e) => e.is_recoverable(),
            Self::Admin(e) => e.is_recoverable(),
            Self::Mask(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Connection registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry is at its configured connection capacity
    #[error("Connection table exhausted ({active}/{max})")]
    ResourceExhausted { active: usize, max: usize },

    /// The connection no longer carries a transport fd
    #[error("Connection {id} has no attached fd")]
    FdUnavailable { id: u32 },
}

impl RegistryError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            // Capacity pressure clears as connections are released
            Self::ResourceExhausted { .. } => true,
            Self::FdUnavailable { .. } => false,
        }
    }

    /// Create a resource exhausted error
    #[must_use]
    pub const fn exhausted(active: usize, max: usize) -> Self {
        Self::ResourceExhausted { active, max }
    }
}

/// Fd-handoff channel errors
///
/// Any of these observed by a worker on its control channel is fatal to
/// that worker; the dispatch side treats them as loss of the worker.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Zero-length read: the peer process has exited
    #[error("Handoff peer closed the channel")]
    PeerClosed,

    /// A control record failed to decode
    #[error("Malformed handoff record: {0}")]
    Malformed(String),

    /// I/O error on the channel socket
    #[error("Handoff channel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::PeerClosed | Self::Malformed(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a malformed-record error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// Reactor errors
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The fd table is full
    #[error("Reactor fd table full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    /// I/O error from the poller
    #[error("Reactor I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ReactorError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Slots free up as connections are released
            Self::CapacityExceeded { .. } => true,
            Self::Io(e) => e.kind() == io::ErrorKind::Interrupted,
        }
    }
}

/// Worker loop errors
///
/// A worker error terminates the worker; the dispatch process detects the
/// exit and reclaims the worker's connections.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The handoff channel died; the worker drained and exited
    #[error("Handoff channel fatal: {0}")]
    ChannelFatal(#[from] ChannelError),

    /// Reactor setup or polling failed
    #[error("Worker reactor error: {0}")]
    Reactor(#[from] ReactorError),
}

/// Dispatch coordination errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No workers are registered or alive
    #[error("No live workers available")]
    NoWorkers,

    /// The chosen worker's channel is gone
    #[error("Worker {index} is no longer reachable")]
    WorkerLost { index: u16 },

    /// Registry error during assignment
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Channel error during assignment
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl DispatchError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NoWorkers => false,
            // Another worker can take the next assignment
            Self::WorkerLost { .. } => true,
            Self::Registry(e) => e.is_recoverable(),
            Self::Channel(e) => e.is_recoverable(),
        }
    }
}

/// Admin socket errors
#[derive(Debug, Error)]
pub enum AdminError {
    /// Failed to create the Unix socket
    #[error("Failed to create admin socket at {path}: {reason}")]
    SocketCreation { path: String, reason: String },

    /// Failed to bind the Unix socket
    #[error("Failed to bind admin socket to {path}: {reason}")]
    BindError { path: String, reason: String },

    /// Protocol error (invalid message format)
    #[error("Admin protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("Admin serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("Admin I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl AdminError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation { .. } | Self::BindError { .. } => false,
            Self::ProtocolError(_) => true,
            Self::SerializationError(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Identifier masking errors
#[derive(Debug, Error)]
pub enum MaskError {
    /// The masking seed is empty
    #[error("Masking seed must not be empty")]
    EmptySeed,

    /// A masked identifier is missing the expected prefix
    #[error("Masked identifier missing prefix {prefix:?}")]
    MissingPrefix { prefix: String },

    /// The encoded payload failed to decode
    #[error("Invalid masked identifier encoding: {0}")]
    InvalidEncoding(String),
}

/// Type alias for Result with ConnMuxError
pub type Result<T> = std::result::Result<T, ConnMuxError>;
