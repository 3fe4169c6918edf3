//! WebSocket terminal bridge.
//!
//! Each WebSocket connection gets one PTY-backed shell. Inside a container the
//! shell is the host's, entered through nsenter; otherwise it is a local one.

pub mod api;
pub mod config;
pub mod errors;
pub mod handler;
pub mod protocol;
pub mod pty;
pub mod queue;
pub mod registry;
pub mod session;
pub mod stream;

pub use api::{build_router, AppState};
pub use config::TerminalConfig;
pub use errors::{ProtocolError, SendError, TerminalError};
pub use handler::ProtocolHandler;
pub use registry::SessionRegistry;
