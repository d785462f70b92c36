//! Admin server
//!
//! A small Unix-socket server for the admin protocol, run on its own
//! thread in the dispatch process. One length-prefixed JSON command per
//! request, one response back, connection persists until the client
//! closes it.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use super::handler::AdminHandler;
use super::protocol::{
    decode_message, encode_message, AdminCommand, AdminResponse, ErrorCode, LENGTH_PREFIX_SIZE,
    MAX_MESSAGE_SIZE,
};
use crate::config::AdminConfig;
use crate::error::AdminError;

/// Admin socket server
pub struct AdminServer {
    config: AdminConfig,
    handler: Arc<AdminHandler>,
}

impl AdminServer {
    /// Create a server for the given socket config
    pub fn new(config: AdminConfig, handler: Arc<AdminHandler>) -> Self {
        Self { config, handler }
    }

    /// Bind the socket and serve on a background thread
    ///
    /// Returns `None` without binding when the admin socket is disabled.
    ///
    /// # Errors
    ///
    /// `SocketCreation`/`BindError` when the socket cannot be set up.
    pub fn spawn(self) -> Result<Option<JoinHandle<()>>, AdminError> {
        if !self.config.enabled {
            info!("admin socket disabled");
            return Ok(None);
        }

        let listener = self.bind()?;
        info!("admin socket listening on {:?}", self.config.socket_path);

        let handler = Arc::clone(&self.handler);
        let handle = std::thread::Builder::new()
            .name("connmux-admin".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let handler = Arc::clone(&handler);
                            if let Err(e) = handle_client(stream, &handler) {
                                debug!("admin client ended: {}", e);
                            }
                        }
                        Err(e) => warn!("admin accept failed: {}", e),
                    }
                }
            })
            .map_err(|e| AdminError::SocketCreation {
                path: self.config.socket_path.display().to_string(),
                reason: format!("thread spawn failed: {e}"),
            })?;

        Ok(Some(handle))
    }

    fn bind(&self) -> Result<UnixListener, AdminError> {
        let socket_path = &self.config.socket_path;

        // Remove a stale socket file from a previous run
        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(|e| AdminError::SocketCreation {
                path: socket_path.display().to_string(),
                reason: format!("failed to remove existing socket: {e}"),
            })?;
        }

        if let Some(parent) = socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| AdminError::SocketCreation {
                    path: socket_path.display().to_string(),
                    reason: format!("failed to create parent directory: {e}"),
                })?;
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| AdminError::BindError {
            path: socket_path.display().to_string(),
            reason: e.to_string(),
        })?;

        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(self.config.socket_mode);
        std::fs::set_permissions(socket_path, permissions).map_err(|e| {
            AdminError::SocketCreation {
                path: socket_path.display().to_string(),
                reason: format!("failed to set permissions: {e}"),
            }
        })?;

        Ok(listener)
    }
}

/// Serve one client until it disconnects
fn handle_client(mut stream: UnixStream, handler: &AdminHandler) -> Result<(), AdminError> {
    loop {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        match stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(AdminError::IoError(e)),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            let resp = AdminResponse::Error {
                code: ErrorCode::InvalidCommand,
                message: format!("message too large: {len} bytes"),
            };
            write_response(&mut stream, &resp)?;
            return Err(AdminError::protocol(format!("oversized message: {len}")));
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload)?;

        let response = match decode_message::<AdminCommand>(&payload) {
            Ok(command) => handler.handle(&command),
            Err(e) => AdminResponse::Error {
                code: ErrorCode::InvalidCommand,
                message: e.to_string(),
            },
        };
        write_response(&mut stream, &response)?;
    }
}

fn write_response(stream: &mut UnixStream, response: &AdminResponse) -> Result<(), AdminError> {
    let buf = encode_message(response).map_err(|e| AdminError::serialization(e.to_string()))?;
    stream.write_all(&buf)?;
    Ok(())
}

/// Send one command over a connected admin socket and read the response
///
/// Client-side helper for external tooling and tests.
///
/// # Errors
///
/// `IoError` on socket failures, `ProtocolError` on framing violations.
pub fn send_command(
    stream: &mut UnixStream,
    command: &AdminCommand,
) -> Result<AdminResponse, AdminError> {
    let buf = encode_message(command).map_err(|e| AdminError::serialization(e.to_string()))?;
    stream.write_all(&buf)?;

    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(AdminError::protocol(format!("oversized response: {len}")));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    decode_message(&payload).map_err(|e| AdminError::protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Registry;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    fn test_config(dir: &tempfile::TempDir) -> AdminConfig {
        AdminConfig {
            enabled: true,
            socket_path: dir.path().join("admin.sock"),
            socket_mode: 0o600,
            mask_prefix: "CMX".into(),
            mask_seed: None,
        }
    }

    fn test_handler() -> Arc<AdminHandler> {
        Arc::new(AdminHandler::new(
            Arc::new(Registry::new(4)),
            None,
            Arc::new(AtomicBool::new(false)),
        ))
    }

    #[test]
    fn test_ping_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let path = config.socket_path.clone();

        let server = AdminServer::new(config, test_handler());
        let _thread = server.spawn().unwrap().expect("server enabled");

        let mut stream = UnixStream::connect(&path).unwrap();
        let resp = send_command(&mut stream, &AdminCommand::Ping).unwrap();
        assert!(matches!(resp, AdminResponse::Pong));

        let resp = send_command(&mut stream, &AdminCommand::Version).unwrap();
        match resp {
            AdminResponse::Version { version } => assert_eq!(version, crate::VERSION),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_disabled_server_does_not_bind() {
        let config = AdminConfig {
            enabled: false,
            socket_path: PathBuf::from("/nonexistent/never-created.sock"),
            socket_mode: 0o600,
            mask_prefix: "CMX".into(),
            mask_seed: None,
        };
        let server = AdminServer::new(config, test_handler());
        assert!(server.spawn().unwrap().is_none());
    }

    #[test]
    fn test_invalid_command_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let path = config.socket_path.clone();
        let server = AdminServer::new(config, test_handler());
        let _thread = server.spawn().unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        let garbage = b"{\"type\":\"no_such_command\"}";
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::try_from(garbage.len()).unwrap().to_be_bytes());
        buf.extend_from_slice(garbage);
        stream.write_all(&buf).unwrap();

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        stream.read_exact(&mut len_buf).unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut payload).unwrap();
        let resp: AdminResponse = decode_message(&payload).unwrap();
        assert!(matches!(
            resp,
            AdminResponse::Error {
                code: ErrorCode::InvalidCommand,
                ..
            }
        ));
    }
}
