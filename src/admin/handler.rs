//! Admin command handler
//!
//! Executes admin commands against the registry. Separated from the
//! server so it can be driven directly in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use super::protocol::{AdminCommand, AdminResponse};
use crate::conn::Registry;
use crate::mask::IdMasker;

/// Executes admin commands
pub struct AdminHandler {
    registry: Arc<Registry>,
    masker: Option<IdMasker>,
    shutdown: Arc<AtomicBool>,
}

impl AdminHandler {
    /// Create a handler over the registry
    ///
    /// `masker`, when configured, replaces each connection's external
    /// identifier with its masked form. `shutdown` is the flag the
    /// dispatch loop polls.
    pub fn new(
        registry: Arc<Registry>,
        masker: Option<IdMasker>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            masker,
            shutdown,
        }
    }

    /// Execute one command
    pub fn handle(&self, command: &AdminCommand) -> AdminResponse {
        match command {
            AdminCommand::Ping => AdminResponse::Pong,
            AdminCommand::Version => AdminResponse::Version {
                version: crate::VERSION.to_string(),
            },
            AdminCommand::ListConns => {
                let mut connections = self.registry.list();
                if let Some(masker) = &self.masker {
                    for info in &mut connections {
                        info.masked_id = Some(masker.mask(&info.id.to_string()));
                    }
                }
                AdminResponse::Conns { connections }
            }
            AdminCommand::GetStats => AdminResponse::Stats {
                stats: self.registry.stats().snapshot(),
            },
            AdminCommand::Shutdown => {
                info!("shutdown requested over admin socket");
                self.shutdown.store(true, Ordering::Release);
                AdminResponse::ShuttingDown
            }
        }
    }
}
