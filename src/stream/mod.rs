//! Output streaming
//!
//! Two workers run per started session:
//! - the pump reads raw PTY output and queues output frames
//! - the sender drains the queue and ships frames to the client in batches

mod pump;
mod sender;

use async_trait::async_trait;

use crate::errors::SendError;

pub use pump::{OutputPump, WatchdogSettings};
pub use sender::OutputSender;

/// Outbound half of a client connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one text frame.
    async fn send_text(&self, text: String) -> Result<(), SendError>;

    /// Whether the connection can still take frames.
    fn is_open(&self) -> bool;
}
