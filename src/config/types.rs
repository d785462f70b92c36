//! Configuration types for connmux
//!
//! This module defines all configuration structures used by the connection
//! manager. Configuration is loaded from JSON files and can be validated at
//! startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Listen configuration for the dispatch process
    pub listen: ListenConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Connection limits
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Admin socket configuration
    pub admin: AdminConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker.validate()?;
        self.connection.validate()?;
        self.admin.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            listen: ListenConfig {
                address: "127.0.0.1:5060".parse().expect("valid default address"),
            },
            worker: WorkerConfig::default(),
            connection: ConnectionConfig::default(),
            admin: AdminConfig {
                enabled: true,
                socket_path: PathBuf::from("/var/run/connmux/admin.sock"),
                socket_mode: 0o600,
                mask_prefix: default_mask_prefix(),
                mask_seed: None,
            },
            log: LogConfig::default(),
        }
    }
}

/// Listen configuration for the dispatch process
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Address the dispatch process accepts on
    pub address: SocketAddr,
}

/// How worker loops are spawned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Workers run as threads inside the dispatch process
    Thread,
    /// Workers run as child processes, channels inherited over fork/exec
    Process,
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Number of worker loops to spawn
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Spawn mode (thread or process)
    #[serde(default = "default_worker_mode")]
    pub mode: WorkerMode,

    /// Capacity of each worker's reactor fd table
    #[serde(default = "default_max_fds")]
    pub max_fds: usize,

    /// Timer tick interval in milliseconds
    ///
    /// Bounds the latency of the timeout sweep: an expired connection is
    /// reclaimed within one tick of its deadline.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Maximum time a connection may sit in a worker without traffic,
    /// in milliseconds
    #[serde(default = "default_max_processing_ms")]
    pub max_processing_ms: u64,

    /// Maximum read attempts for a partially received message before the
    /// peer is treated as stalled
    #[serde(default = "default_max_read_attempts")]
    pub max_read_attempts: u32,
}

impl WorkerConfig {
    /// Timer tick interval as a `Duration`
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Max processing time expressed in timer ticks (at least one)
    #[must_use]
    pub fn max_processing_ticks(&self) -> u64 {
        (self.max_processing_ms / self.tick_interval_ms.max(1)).max(1)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::ValidationError(
                "worker.count must be at least 1".into(),
            ));
        }
        if self.max_fds < 8 {
            return Err(ConfigError::ValidationError(
                "worker.max_fds must be at least 8".into(),
            ));
        }
        if self.tick_interval_ms < 10 {
            return Err(ConfigError::ValidationError(
                "worker.tick_interval_ms must be at least 10".into(),
            ));
        }
        if self.max_processing_ms < self.tick_interval_ms {
            return Err(ConfigError::ValidationError(
                "worker.max_processing_ms must be at least one tick interval".into(),
            ));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            mode: default_worker_mode(),
            max_fds: default_max_fds(),
            tick_interval_ms: default_tick_interval_ms(),
            max_processing_ms: default_max_processing_ms(),
            max_read_attempts: default_max_read_attempts(),
        }
    }
}

/// Connection limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Maximum live connections in the registry
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// How long `Registry::acquire` waits for an in-transit connection
    /// before reporting `Busy`, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl ConnectionConfig {
    /// Acquire timeout as a `Duration`
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "connection.max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// Admin socket configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Whether the admin socket is served at all
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,

    /// Path of the admin Unix socket
    pub socket_path: PathBuf,

    /// Permission bits applied to the socket file
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Prefix prepended to masked connection identifiers
    #[serde(default = "default_mask_prefix")]
    pub mask_prefix: String,

    /// XOR seed for identifier masking; masking is disabled when absent
    #[serde(default)]
    pub mask_seed: Option<String>,
}

impl AdminConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "admin.socket_path must not be empty when admin is enabled".into(),
            ));
        }
        if let Some(seed) = &self.mask_seed {
            if seed.is_empty() {
                return Err(ConfigError::ValidationError(
                    "admin.mask_seed must not be empty when present".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}

fn default_worker_mode() -> WorkerMode {
    WorkerMode::Thread
}

fn default_max_fds() -> usize {
    1024
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_processing_ms() -> u64 {
    4000
}

fn default_max_read_attempts() -> u32 {
    4
}

fn default_max_connections() -> usize {
    1024
}

fn default_acquire_timeout_ms() -> u64 {
    500
}

fn default_admin_enabled() -> bool {
    true
}

fn default_socket_mode() -> u32 {
    0o600
}

fn default_mask_prefix() -> String {
    "CMX".into()
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_validation() {
        let mut config = Config::default_config();
        config.worker.count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default_config();
        config.worker.max_processing_ms = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_processing_ticks() {
        let worker = WorkerConfig {
            tick_interval_ms: 1000,
            max_processing_ms: 4000,
            ..WorkerConfig::default()
        };
        assert_eq!(worker.max_processing_ticks(), 4);

        // Sub-tick processing time still yields one full tick
        let worker = WorkerConfig {
            tick_interval_ms: 1000,
            max_processing_ms: 1000,
            ..WorkerConfig::default()
        };
        assert_eq!(worker.max_processing_ticks(), 1);
    }

    #[test]
    fn test_mask_seed_validation() {
        let mut config = Config::default_config();
        config.admin.mask_seed = Some(String::new());
        assert!(config.validate().is_err());

        config.admin.mask_seed = Some("s3cr3t".into());
        assert!(config.validate().is_ok());
    }
}
