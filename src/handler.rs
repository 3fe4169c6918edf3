//! Protocol handler
//!
//! Transport-agnostic dispatch of connection events. The WebSocket layer calls
//! `on_open`, `on_message`, `on_error` and `on_close`; everything else happens
//! through the session registry.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::errors::ProtocolError;
use crate::protocol::{CommandFrame, OutputFrame};
use crate::pty::StartOutcome;
use crate::registry::SessionRegistry;
use crate::session::TerminalSession;
use crate::stream::FrameSink;

const SESSION_ENDED: &str = "Terminal session has ended, refresh the page to reconnect";
const SESSION_MISSING: &str = "Terminal session does not exist or is closed";

pub struct ProtocolHandler {
    registry: Arc<SessionRegistry>,
}

impl ProtocolHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn on_open(&self, session_id: &str, sink: Arc<dyn FrameSink>) {
        info!("[ws:{}] Connection opened", session_id);
        let session = self.registry.create(session_id, sink);
        send_frame(session.sink().as_ref(), &OutputFrame::connected(session_id)).await;
    }

    /// Dispatch one inbound text frame. `sink` is the connection the frame
    /// arrived on and receives any error reply.
    pub async fn on_message(&self, session_id: &str, sink: &dyn FrameSink, text: &str) {
        let Some(session) = self.registry.get(session_id).filter(|s| !s.is_closed()) else {
            warn!("[ws:{}] Message for unknown or closed session", session_id);
            send_error(sink, SESSION_MISSING).await;
            return;
        };

        let frame = match CommandFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[ws:{}] Rejected message: {}", session_id, e);
                let message = match e {
                    ProtocolError::UnknownType(kind) => format!("Unknown command type: {}", kind),
                    e => format!("Failed to process command: {}", e),
                };
                send_error(sink, &message).await;
                return;
            }
        };

        match frame {
            CommandFrame::Init { cols, rows } => self.init(&session, sink, cols, rows).await,
            CommandFrame::Command { data } => self.command(&session, sink, data).await,
            CommandFrame::Resize { cols, rows } => self.resize(&session, cols, rows),
        }
    }

    async fn init(&self, session: &TerminalSession, sink: &dyn FrameSink, cols: u16, rows: u16) {
        info!(
            "[ws:{}] Initializing terminal ({}x{})",
            session.id(),
            cols,
            rows
        );
        match session.start(cols, rows).await {
            Ok(StartOutcome::Started { .. }) => {}
            Ok(StartOutcome::AlreadyActive) => {
                debug!("[ws:{}] Terminal already initialized", session.id());
            }
            Err(e) => {
                error!("[ws:{}] Terminal initialization failed: {}", session.id(), e);
                send_error(sink, &format!("Failed to initialize terminal: {}", e)).await;
            }
        }
    }

    async fn command(&self, session: &TerminalSession, sink: &dyn FrameSink, data: String) {
        if !session.is_terminal_alive() {
            send_error(sink, SESSION_ENDED).await;
            return;
        }
        if let Err(e) = session.send_input(data).await {
            error!("[ws:{}] Failed to write input: {}", session.id(), e);
            send_error(sink, &format!("Failed to send command: {}", e)).await;
        }
    }

    fn resize(&self, session: &TerminalSession, cols: u16, rows: u16) {
        if !session.is_terminal_alive() {
            debug!(
                "[ws:{}] Ignoring resize to {}x{}, terminal is not running",
                session.id(),
                cols,
                rows
            );
            return;
        }
        if let Err(e) = session.resize(cols, rows) {
            warn!("[ws:{}] Resize failed: {}", session.id(), e);
        }
    }

    pub async fn on_error(&self, session_id: &str, error: &str) {
        error!("[ws:{}] Transport error: {}", session_id, error);
        self.registry.close(session_id).await;
    }

    pub async fn on_close(&self, session_id: &str) {
        info!("[ws:{}] Connection closed", session_id);
        self.registry.close(session_id).await;
    }

    /// Close every session; used on server shutdown.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}

/// An error goes out twice: as `TERMINAL_ERROR` and as a red in-terminal banner.
async fn send_error(sink: &dyn FrameSink, message: &str) {
    send_frame(sink, &OutputFrame::error(message)).await;
    send_frame(sink, &OutputFrame::error_banner(message)).await;
}

async fn send_frame(sink: &dyn FrameSink, frame: &OutputFrame) {
    if !sink.is_open() {
        return;
    }
    let text = match frame.to_json() {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode frame: {}", e);
            return;
        }
    };
    if let Err(e) = sink.send_text(text).await {
        debug!("Failed to send frame: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::TerminalConfig;
    use crate::pty::EnvironmentResolver;
    use crate::stream::testing::RecordingSink;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn handler() -> ProtocolHandler {
        let config = Arc::new(TerminalConfig {
            force_simple_mode: true,
            shell_paths: vec!["/bin/sh".to_string()],
            init_timeout_ms: 200,
            flush_interval_ms: 20,
            ..TerminalConfig::default()
        });
        let resolver = Arc::new(EnvironmentResolver::new(&config));
        ProtocolHandler::new(Arc::new(SessionRegistry::new(config, resolver)))
    }

    async fn open(handler: &ProtocolHandler, id: &str) -> Arc<RecordingSink> {
        let sink = Arc::new(RecordingSink::new());
        handler.on_open(id, sink.clone()).await;
        sink
    }

    #[tokio::test]
    async fn open_sends_connected_with_session_id() {
        let handler = handler();
        let sink = open(&handler, "abc").await;

        let frame = sink.next_frame(WAIT).await.unwrap();
        assert_eq!(frame["type"], "TERMINAL_CONNECTED");
        assert_eq!(frame["sessionId"], "abc");
        assert_eq!(handler.registry().len(), 1);
    }

    #[tokio::test]
    async fn unknown_type_is_reported_and_session_stays_open() {
        let handler = handler();
        let sink = open(&handler, "s").await;
        handler
            .on_message("s", &*sink, r#"{"type":"TERMINAL_PING"}"#)
            .await;

        let error = sink.frame_of_type("TERMINAL_ERROR", WAIT).await.unwrap();
        assert_eq!(error["error"], "Unknown command type: TERMINAL_PING");
        let banner = sink.next_frame(WAIT).await.unwrap();
        assert_eq!(banner["type"], "TERMINAL_MESSAGE");
        assert_eq!(banner["level"], "error");
        assert!(handler.registry().get("s").is_some());
    }

    #[tokio::test]
    async fn malformed_json_is_reported() {
        let handler = handler();
        let sink = open(&handler, "s").await;
        handler.on_message("s", &*sink, "{not json").await;

        let error = sink.frame_of_type("TERMINAL_ERROR", WAIT).await.unwrap();
        assert!(error["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to process command"));
    }

    #[tokio::test]
    async fn command_before_init_reports_ended_session() {
        let handler = handler();
        let sink = open(&handler, "s").await;
        handler
            .on_message("s", &*sink, r#"{"type":"TERMINAL_COMMAND","data":"ls\n"}"#)
            .await;

        let error = sink.frame_of_type("TERMINAL_ERROR", WAIT).await.unwrap();
        assert_eq!(error["error"], SESSION_ENDED);
    }

    #[tokio::test]
    async fn resize_without_terminal_is_silent() {
        let handler = handler();
        let sink = open(&handler, "s").await;
        sink.next_frame(WAIT).await.unwrap();

        handler
            .on_message("s", &*sink, r#"{"type":"TERMINAL_RESIZE","cols":100,"rows":30}"#)
            .await;
        assert!(sink.next_frame(Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn init_then_echo_then_close() {
        let handler = handler();
        let sink = open(&handler, "s").await;
        handler
            .on_message("s", &*sink, r#"{"type":"TERMINAL_INIT","cols":80,"rows":24}"#)
            .await;

        let batch = sink.frame_of_type("TERMINAL_BATCH", WAIT).await.unwrap();
        assert_eq!(batch["messages"][0]["type"], "TERMINAL_READY");

        handler
            .on_message("s", &*sink, r#"{"type":"TERMINAL_COMMAND","data":"echo hi-$((1 + 1))\n"}"#)
            .await;

        let deadline = tokio::time::Instant::now() + WAIT;
        let mut output = String::new();
        while !output.contains("hi-2") {
            let left = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("no echo output before the deadline");
            let batch = sink.frame_of_type("TERMINAL_BATCH", left).await.unwrap();
            for message in batch["messages"].as_array().unwrap() {
                if message["type"] == "TERMINAL_OUTPUT" {
                    output.push_str(message["data"].as_str().unwrap());
                }
            }
        }

        let session = handler.registry().get("s").unwrap();
        handler.on_close("s").await;
        handler.on_close("s").await;
        assert!(handler.registry().is_empty());
        assert!(session.is_closed());
        assert!(!session.is_terminal_alive());
    }

    #[tokio::test]
    async fn message_after_close_is_rejected() {
        let handler = handler();
        let sink = open(&handler, "s").await;
        handler.on_close("s").await;

        handler
            .on_message("s", &*sink, r#"{"type":"TERMINAL_INIT"}"#)
            .await;
        let error = sink.frame_of_type("TERMINAL_ERROR", WAIT).await.unwrap();
        assert_eq!(error["error"], SESSION_MISSING);
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let handler = handler();
        open(&handler, "a").await;
        open(&handler, "b").await;

        handler.shutdown().await;
        assert!(handler.registry().is_empty());
    }
}
