//! Administrative introspection
//!
//! A Unix-socket control surface on the dispatch process: ping, version,
//! live-connection listing, statistics, and shutdown. Read-only with
//! respect to connections; external tooling consumes it, the core never
//! does.

mod handler;
mod protocol;
mod server;

pub use handler::AdminHandler;
pub use protocol::{
    decode_message, encode_message, AdminCommand, AdminResponse, ErrorCode, LENGTH_PREFIX_SIZE,
    MAX_MESSAGE_SIZE,
};
pub use server::{send_command, AdminServer};
