//! Session registry
//!
//! Every open connection has exactly one session here, keyed by its id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::TerminalConfig;
use crate::pty::CommandResolver;
use crate::session::{SessionInfo, TerminalSession};
use crate::stream::FrameSink;

pub struct SessionRegistry {
    /// All sessions indexed by ID
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
    config: Arc<TerminalConfig>,
    resolver: Arc<dyn CommandResolver>,
}

impl SessionRegistry {
    pub fn new(config: Arc<TerminalConfig>, resolver: Arc<dyn CommandResolver>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            resolver,
        }
    }

    /// Register a session for a newly opened connection.
    pub fn create(&self, session_id: &str, sink: Arc<dyn FrameSink>) -> Arc<TerminalSession> {
        let session = Arc::new(TerminalSession::new(
            session_id,
            self.config.clone(),
            self.resolver.clone(),
            sink,
        ));
        let previous = self
            .sessions
            .write()
            .insert(session_id.to_string(), session.clone());
        if previous.is_some() {
            warn!("[registry] Replaced existing session {}", session_id);
        }
        info!("[registry] Session {} registered", session_id);
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.write().remove(session_id)
    }

    /// Remove and close a session. Unknown ids are ignored.
    pub async fn close(&self, session_id: &str) {
        let Some(session) = self.remove(session_id) else {
            return;
        };
        session.close().await;
        info!("[registry] Session {} closed", session_id);
    }

    /// Close every session and empty the registry.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        info!("[registry] Closing {} sessions", sessions.len());
        for session in sessions {
            session.close().await;
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self.sessions.read().values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
