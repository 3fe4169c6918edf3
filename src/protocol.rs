//! Terminal frame protocol
//!
//! Inbound command frames from the browser terminal and outbound frames sent
//! back to it. Both sides are JSON objects tagged by a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::errors::ProtocolError;

const INIT: &str = "TERMINAL_INIT";
const COMMAND: &str = "TERMINAL_COMMAND";
const RESIZE: &str = "TERMINAL_RESIZE";

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Messages from WebSocket clients
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum CommandFrame {
    /// Start the terminal process with the given size
    #[serde(rename = "TERMINAL_INIT")]
    Init {
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },

    /// Raw input for the process
    #[serde(rename = "TERMINAL_COMMAND")]
    Command {
        #[serde(default)]
        data: String,
    },

    /// New terminal size
    #[serde(rename = "TERMINAL_RESIZE")]
    Resize {
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
}

impl CommandFrame {
    /// Decode a text frame.
    ///
    /// The `type` field is checked first so an unrecognised type is reported
    /// as such rather than as a generic decoding failure.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;
        if !matches!(kind, INIT | COMMAND | RESIZE) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageEvent {
    /// The terminal process is gone
    Terminated,
}

/// Frames sent to the client
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutputFrame {
    #[serde(rename = "TERMINAL_CONNECTED")]
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },

    #[serde(rename = "TERMINAL_READY")]
    Ready,

    /// Raw process output
    #[serde(rename = "TERMINAL_OUTPUT")]
    Output { data: String },

    /// Banner text rendered inside the terminal
    #[serde(rename = "TERMINAL_MESSAGE")]
    Message {
        data: String,
        level: MessageLevel,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<MessageEvent>,
    },

    #[serde(rename = "TERMINAL_ERROR")]
    Error { error: String },

    /// Pre-serialized frames in enqueue order
    #[serde(rename = "TERMINAL_BATCH")]
    Batch { messages: Vec<Box<RawValue>> },
}

impl OutputFrame {
    pub fn connected(session_id: &str) -> Self {
        OutputFrame::Connected {
            session_id: session_id.to_string(),
            data: colored(
                GREEN,
                "Connected to server, waiting for terminal initialization...",
            ),
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        OutputFrame::Output { data: data.into() }
    }

    pub fn info(text: &str) -> Self {
        OutputFrame::Message {
            data: colored(CYAN, text),
            level: MessageLevel::Info,
            event: None,
        }
    }

    pub fn warning(text: &str) -> Self {
        OutputFrame::Message {
            data: colored(YELLOW, text),
            level: MessageLevel::Warning,
            event: None,
        }
    }

    /// In-terminal rendering of an error.
    pub fn error_banner(text: &str) -> Self {
        OutputFrame::Message {
            data: colored(RED, &format!("Error: {}", text)),
            level: MessageLevel::Error,
            event: None,
        }
    }

    pub fn terminated() -> Self {
        OutputFrame::Message {
            data: colored(RED, "Terminal session has ended"),
            level: MessageLevel::Error,
            event: Some(MessageEvent::Terminated),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        OutputFrame::Error { error: text.into() }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Serialize once so the frame can be queued and batched without re-encoding.
    pub fn to_raw(&self) -> serde_json::Result<Box<RawValue>> {
        serde_json::value::to_raw_value(self)
    }
}

const GREEN: &str = "32";
const YELLOW: &str = "33";
const CYAN: &str = "36";
const RED: &str = "31";

fn colored(code: &str, text: &str) -> String {
    format!("\r\n\u{1b}[{}m{}\u{1b}[0m\r\n", code, text)
}
