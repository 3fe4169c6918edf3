//! HTTP and WebSocket routes
//!
//! `/terminal` upgrades to the terminal protocol; `/health` and `/sessions`
//! are plain JSON endpoints.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::SendError;
use crate::handler::ProtocolHandler;
use crate::session::SessionInfo;
use crate::stream::FrameSink;

/// Largest inbound text frame accepted from a client.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<ProtocolHandler>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub fn build_router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/terminal", get(terminal_websocket))
        .route("/health", get(health))
        .route("/sessions", get(list_sessions));

    if let Some(dir) = static_dir {
        info!("Serving static files from {}", dir.display());
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.handler.registry().list())
}

async fn terminal_websocket(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_terminal_socket(socket, state.handler))
}

/// Outbound side of one WebSocket; frames are written by a dedicated task.
struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
}

impl WsSink {
    fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            open: AtomicBool::new(true),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&self, text: String) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closing);
        }
        self.tx
            .send(Message::Text(text))
            .map_err(|_| SendError::Closing)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}

async fn handle_terminal_socket(socket: WebSocket, handler: Arc<ProtocolHandler>) {
    let session_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let sink = Arc::new(WsSink::new(tx));

    let writer_sink = sink.clone();
    let writer_id = session_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                debug!("[ws:{}] Write failed: {}", writer_id, e);
                break;
            }
        }
        writer_sink.mark_closed();
    });

    handler.on_open(&session_id, sink.clone()).await;

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => handler.on_message(&session_id, &*sink, &text).await,
            Ok(Message::Binary(data)) => {
                let text = String::from_utf8_lossy(&data);
                handler.on_message(&session_id, &*sink, &text).await;
            }
            Ok(Message::Close(_)) => {
                info!("[ws:{}] Client closed connection", session_id);
                break;
            }
            Err(e) => {
                handler.on_error(&session_id, &e.to_string()).await;
                break;
            }
            _ => {}
        }
    }

    sink.mark_closed();
    handler.on_close(&session_id).await;
    writer_task.abort();
}
