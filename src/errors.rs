//! Error types shared across the terminal bridge.

use thiserror::Error;

use crate::pty::TerminalState;

/// Failures of the terminal process lifecycle.
#[derive(Debug, Error)]
pub enum TerminalError {
    /// The PTY could not be opened or the command could not be spawned.
    #[error("failed to start terminal process: {0}")]
    Spawn(String),

    /// The process was spawned but exited during the start window.
    #[error("terminal process exited right after start (exit code: {code:?})")]
    ExitedImmediately { code: Option<u32> },

    /// The operation needs a running process and there is none.
    #[error("terminal process is not available (state: {state})")]
    NotRunning { state: TerminalState },

    #[error("terminal I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems decoding an inbound command frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed command frame: {0}")]
    Malformed(String),

    #[error("command frame has no type")]
    MissingType,

    #[error("unknown command type: {0}")]
    UnknownType(String),
}

/// Transport send failures.
#[derive(Debug, Error)]
pub enum SendError {
    /// The channel is already closing; callers stop quietly.
    #[error("channel is closing")]
    Closing,

    #[error("send failed: {0}")]
    Failed(String),
}
