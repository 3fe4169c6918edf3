//! Terminal sessions
//!
//! A session ties one client connection to one terminal process. Once the
//! process is started it also owns the output pump and sender that stream
//! frames back to the client.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TerminalConfig;
use crate::errors::TerminalError;
use crate::protocol::OutputFrame;
use crate::pty::{CommandResolver, ExecutionMode, ProcessManager, StartOutcome};
use crate::queue::FrameQueue;
use crate::stream::{FrameSink, OutputPump, OutputSender};

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Connected, no terminal requested yet
    Open,
    /// Terminal started and streaming
    Initialized,
    Closed,
}

/// Listing entry for a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub phase: SessionPhase,
    pub mode: Option<ExecutionMode>,
    pub pid: Option<u32>,
    pub alive: bool,
    pub status: String,
}

struct Workers {
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    sender: JoinHandle<()>,
}

pub struct TerminalSession {
    id: String,
    config: Arc<TerminalConfig>,
    sink: Arc<dyn FrameSink>,
    process: Arc<ProcessManager>,
    phase: Mutex<SessionPhase>,
    workers: Mutex<Option<Workers>>,
}

impl TerminalSession {
    pub fn new(
        id: impl Into<String>,
        config: Arc<TerminalConfig>,
        resolver: Arc<dyn CommandResolver>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let id = id.into();
        let process = Arc::new(ProcessManager::new(id.clone(), config.clone(), resolver));
        Self {
            id,
            config,
            sink,
            process,
            phase: Mutex::new(SessionPhase::Open),
            workers: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sink(&self) -> &Arc<dyn FrameSink> {
        &self.sink
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == SessionPhase::Closed
    }

    /// Start the terminal and begin streaming its output.
    ///
    /// `TERMINAL_READY` is queued ahead of any process output, so the client
    /// sees it in the first batch.
    pub async fn start(&self, cols: u16, rows: u16) -> Result<StartOutcome, TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::NotRunning {
                state: self.process.state(),
            });
        }

        let process = self.process.clone();
        let outcome = tokio::task::spawn_blocking(move || process.start(cols, rows))
            .await
            .map_err(|e| TerminalError::Spawn(format!("start task failed: {}", e)))??;

        let StartOutcome::Started { pid, mode } = outcome else {
            debug!("[session:{}] Terminal already active", self.id);
            return Ok(outcome);
        };

        let installed = {
            let mut phase = self.phase.lock();
            if *phase == SessionPhase::Closed {
                false
            } else {
                *self.workers.lock() = Some(self.spawn_workers());
                *phase = SessionPhase::Initialized;
                true
            }
        };
        if !installed {
            // Closed while the process was starting.
            let process = self.process.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || process.close()).await {
                error!("[session:{}] Failed to close terminal: {}", self.id, e);
            }
            return Err(TerminalError::NotRunning {
                state: self.process.state(),
            });
        }

        info!(
            "[session:{}] Terminal initialized ({}x{}, mode: {}, pid: {:?})",
            self.id, cols, rows, mode, pid
        );
        Ok(outcome)
    }

    fn spawn_workers(&self) -> Workers {
        let queue = Arc::new(FrameQueue::new(self.config.queue_capacity));
        match OutputFrame::Ready.to_raw() {
            Ok(ready) => {
                queue.push(ready);
            }
            Err(e) => error!("[session:{}] Failed to encode ready frame: {}", self.id, e),
        }

        let cancel = CancellationToken::new();
        let pump = OutputPump::new(
            self.id.clone(),
            self.process.clone(),
            queue.clone(),
            self.sink.clone(),
            cancel.clone(),
            self.config.buffer_size,
        );
        let sender = OutputSender::new(
            self.id.clone(),
            queue,
            self.sink.clone(),
            cancel.clone(),
            self.config.flush_interval(),
            self.config.batch_threshold(),
        );
        Workers {
            cancel,
            pump: tokio::spawn(pump.run()),
            sender: tokio::spawn(sender.run()),
        }
    }

    /// Forward client input to the terminal.
    pub async fn send_input(&self, data: String) -> Result<(), TerminalError> {
        let process = self.process.clone();
        tokio::task::spawn_blocking(move || process.write(data.as_bytes()))
            .await
            .map_err(|e| TerminalError::Io(std::io::Error::other(e.to_string())))?
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.process.resize(cols, rows)
    }

    pub fn is_terminal_alive(&self) -> bool {
        self.process.is_alive()
    }

    /// Stop the workers, then the process. Safe to call repeatedly.
    pub async fn close(&self) {
        {
            let mut phase = self.phase.lock();
            if *phase == SessionPhase::Closed {
                return;
            }
            *phase = SessionPhase::Closed;
        }
        info!("[session:{}] Closing session", self.id);

        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            workers.cancel.cancel();
            join_worker(&self.id, "pump", workers.pump).await;
            join_worker(&self.id, "sender", workers.sender).await;
        }

        let process = self.process.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || process.close()).await {
            error!("[session:{}] Failed to close terminal: {}", self.id, e);
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            phase: self.phase(),
            mode: self.process.mode(),
            pid: self.process.pid(),
            alive: self.process.is_alive(),
            status: self.process.status().to_string(),
        }
    }
}

/// Wait a bounded time for a worker; a worker that does not stop is left detached.
async fn join_worker(session_id: &str, name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(WORKER_JOIN_TIMEOUT, handle).await {
        Ok(Ok(())) => debug!("[session:{}] {} stopped", session_id, name),
        Ok(Err(e)) => error!("[session:{}] {} failed: {}", session_id, name, e),
        Err(_) => warn!(
            "[session:{}] {} did not stop within {:?}, detaching it",
            session_id, name, WORKER_JOIN_TIMEOUT
        ),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pty::{CommandLine, ProcessStatus, Resolution, TerminalState};
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use crate::stream::testing::RecordingSink;

    struct ShellResolver;

    impl CommandResolver for ShellResolver {
        fn resolve(&self, _force_simple: bool) -> Resolution {
            Resolution {
                command: CommandLine::new("/bin/sh", &["-i"]),
                mode: ExecutionMode::Simple,
            }
        }
    }

    fn session(sink: Arc<RecordingSink>) -> TerminalSession {
        let config = TerminalConfig {
            init_timeout_ms: 200,
            flush_interval_ms: 20,
            ..TerminalConfig::default()
        };
        TerminalSession::new("s1", Arc::new(config), Arc::new(ShellResolver), sink)
    }

    #[tokio::test]
    async fn start_streams_ready_first_and_close_stops_everything() {
        let sink = Arc::new(RecordingSink::new());
        let session = session(sink.clone());
        assert_eq!(session.phase(), SessionPhase::Open);

        let outcome = session.start(80, 24).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert_eq!(session.phase(), SessionPhase::Initialized);
        assert!(session.is_terminal_alive());

        let batch = sink
            .frame_of_type("TERMINAL_BATCH", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(batch["messages"][0]["type"], "TERMINAL_READY");

        assert_eq!(
            session.start(80, 24).await.unwrap(),
            StartOutcome::AlreadyActive
        );

        let pid = session.process.pid().unwrap();
        let started = tokio::time::Instant::now();
        session.close().await;
        assert!(
            started.elapsed() < 2 * WORKER_JOIN_TIMEOUT,
            "close took {:?}",
            started.elapsed()
        );
        session.close().await;
        assert!(session.is_closed());
        assert!(!session.is_terminal_alive());
        assert_eq!(session.process.state(), TerminalState::Closed);
        assert!(matches!(
            session.process.status(),
            ProcessStatus::Exited { .. }
        ));
        assert_eq!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH));
        assert!(session.start(80, 24).await.is_err());
    }

    #[tokio::test]
    async fn close_during_start_leaves_nothing_running() {
        let session = Arc::new(session(Arc::new(RecordingSink::new())));
        let starting = tokio::spawn({
            let session = session.clone();
            async move { session.start(80, 24).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close().await;

        assert!(starting.await.unwrap().is_err());
        assert!(session.is_closed());
        assert!(!session.is_terminal_alive());
        assert_eq!(session.process.state(), TerminalState::Closed);
        assert!(session.workers.lock().is_none());
    }

    #[tokio::test]
    async fn input_before_start_is_rejected() {
        let session = session(Arc::new(RecordingSink::new()));
        assert!(matches!(
            session.send_input("ls\n".to_string()).await,
            Err(TerminalError::NotRunning { .. })
        ));
        assert!(session.resize(100, 40).is_err());
        assert_eq!(session.info().status, "not started");
    }
}
