//! Configuration module for connmux
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use connmux::config::load_config;
//!
//! let config = load_config("/etc/connmux/config.json").unwrap();
//! println!("Workers: {}", config.worker.count);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    AdminConfig, Config, ConnectionConfig, ListenConfig, LogConfig, WorkerConfig, WorkerMode,
};
