//! Output pump
//!
//! Reads raw PTY output on a dedicated thread and turns it into queued
//! `TERMINAL_OUTPUT` frames. While the terminal stays silent a watchdog pokes
//! it with newlines and, once per session, tells the user nothing came back.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::FrameSink;
use crate::protocol::OutputFrame;
use crate::pty::{ProcessManager, PtyReader, TerminalState};
use crate::queue::FrameQueue;

const HANDLE_WAIT_ATTEMPTS: u32 = 50;
const HANDLE_WAIT_INTERVAL: Duration = Duration::from_millis(100);
const READ_EVENT_BACKLOG: usize = 64;
const EXIT_WAIT: Duration = Duration::from_millis(500);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Tuning for the silent-terminal watchdog.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    /// How long one read wait lasts before it counts as an idle tick
    pub idle_tick: Duration,
    /// Idle ticks before a newline probe is written
    pub probe_after_ticks: u32,
    /// Silence since the pump started before the user is warned
    pub warn_after: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            idle_tick: Duration::from_millis(50),
            probe_after_ticks: 100,
            warn_after: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WatchdogAction {
    Nothing,
    Probe,
    Warn,
}

struct Watchdog {
    settings: WatchdogSettings,
    started: Instant,
    idle_ticks: u32,
    saw_output: bool,
    warned: bool,
}

impl Watchdog {
    fn new(settings: WatchdogSettings) -> Self {
        Self {
            settings,
            started: Instant::now(),
            idle_ticks: 0,
            saw_output: false,
            warned: false,
        }
    }

    fn on_output(&mut self) {
        self.idle_ticks = 0;
        self.saw_output = true;
    }

    /// Probes follow every run of idle ticks; the warning only fires for a
    /// terminal that has never printed anything.
    fn on_idle(&mut self) -> WatchdogAction {
        self.idle_ticks = self.idle_ticks.saturating_add(1);
        if !self.warned && !self.saw_output && self.started.elapsed() >= self.settings.warn_after {
            self.warned = true;
            self.idle_ticks = 0;
            return WatchdogAction::Warn;
        }
        if self.idle_ticks >= self.settings.probe_after_ticks {
            self.idle_ticks = 0;
            return WatchdogAction::Probe;
        }
        WatchdogAction::Nothing
    }
}

enum ReadEvent {
    Data(Vec<u8>),
    Eof,
    Error(std::io::Error),
}

/// Per-session worker feeding the frame queue from the PTY.
pub struct OutputPump {
    session_id: String,
    process: Arc<ProcessManager>,
    queue: Arc<FrameQueue>,
    sink: Arc<dyn FrameSink>,
    cancel: CancellationToken,
    read_buffer_size: usize,
    watchdog: WatchdogSettings,
}

impl OutputPump {
    pub fn new(
        session_id: impl Into<String>,
        process: Arc<ProcessManager>,
        queue: Arc<FrameQueue>,
        sink: Arc<dyn FrameSink>,
        cancel: CancellationToken,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            process,
            queue,
            sink,
            cancel,
            read_buffer_size: read_buffer_size.max(1),
            watchdog: WatchdogSettings::default(),
        }
    }

    pub fn with_watchdog(mut self, settings: WatchdogSettings) -> Self {
        self.watchdog = settings;
        self
    }

    pub async fn run(self) {
        info!("[pump:{}] Output pump started", self.session_id);

        let Some(reader) = self.acquire_reader().await else {
            if !self.cancel.is_cancelled() {
                error!(
                    "[pump:{}] Timed out waiting for the terminal process",
                    self.session_id
                );
                self.enqueue(OutputFrame::error_banner(
                    "Timed out waiting for the terminal process to start",
                ));
            }
            return;
        };

        let mode = self
            .process
            .mode()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let pid = self
            .process
            .pid()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.enqueue(OutputFrame::info(&format!(
            "Terminal ready ({} mode), PID: {}",
            mode, pid
        )));

        let (tx, mut rx) = mpsc::channel(READ_EVENT_BACKLOG);
        if let Err(e) = spawn_reader_thread(&self.session_id, reader, self.read_buffer_size, tx) {
            error!(
                "[pump:{}] Failed to start reader thread: {}",
                self.session_id, e
            );
            self.enqueue(OutputFrame::error_banner(&format!(
                "Failed to read terminal output: {}",
                e
            )));
            return;
        }

        let mut watchdog = Watchdog::new(self.watchdog);
        let mut pending: Vec<u8> = Vec::new();
        let mut total_bytes: usize = 0;
        let mut stream_ended = false;

        loop {
            if !self.sink.is_open() || !self.process.is_alive() {
                break;
            }
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = tokio::time::timeout(self.watchdog.idle_tick, rx.recv()) => event,
            };

            match event {
                Ok(Some(ReadEvent::Data(bytes))) => {
                    total_bytes += bytes.len();
                    watchdog.on_output();
                    self.forward(&mut pending, &bytes);
                }
                Ok(Some(ReadEvent::Eof)) | Ok(None) => {
                    debug!("[pump:{}] EOF from terminal", self.session_id);
                    stream_ended = true;
                    break;
                }
                Ok(Some(ReadEvent::Error(e))) => {
                    stream_ended = true;
                    // A hung-up PTY reports EIO rather than EOF on Linux.
                    if self.wait_for_exit().await {
                        debug!(
                            "[pump:{}] Read ended after process exit: {}",
                            self.session_id, e
                        );
                    } else {
                        error!("[pump:{}] Read error: {}", self.session_id, e);
                        self.enqueue(OutputFrame::error_banner(&format!(
                            "Failed to read terminal output: {}",
                            e
                        )));
                    }
                    break;
                }
                Err(_) => self.on_idle(&mut watchdog).await,
            }
        }

        if !self.cancel.is_cancelled() {
            while let Ok(ReadEvent::Data(bytes)) = rx.try_recv() {
                total_bytes += bytes.len();
                self.forward(&mut pending, &bytes);
            }
        }
        if !pending.is_empty() {
            self.enqueue(OutputFrame::output(
                String::from_utf8_lossy(&pending).into_owned(),
            ));
        }

        // The hang-up can be read before the child is reapable.
        let exited = if stream_ended {
            self.wait_for_exit().await
        } else {
            !self.process.is_alive()
        };
        if !self.cancel.is_cancelled() && self.process.state() != TerminalState::Closed && exited {
            info!("[pump:{}] Terminal process has exited", self.session_id);
            self.enqueue(OutputFrame::terminated());
        }

        info!(
            "[pump:{}] Output pump finished. Total: {} bytes",
            self.session_id, total_bytes
        );
    }

    /// Give a hung-up child a short while to become reapable. True once it is gone.
    async fn wait_for_exit(&self) -> bool {
        let deadline = Instant::now() + EXIT_WAIT;
        while self.process.is_alive() {
            if self.cancel.is_cancelled() || Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        true
    }

    async fn acquire_reader(&self) -> Option<PtyReader> {
        for _ in 0..HANDLE_WAIT_ATTEMPTS {
            if self.cancel.is_cancelled() || !self.sink.is_open() {
                return None;
            }
            match self.process.take_reader() {
                Ok(reader) => return Some(reader),
                Err(e) => {
                    if matches!(
                        self.process.state(),
                        TerminalState::Failed | TerminalState::Closed
                    ) {
                        debug!("[pump:{}] No terminal to read from: {}", self.session_id, e);
                        return None;
                    }
                }
            }
            tokio::time::sleep(HANDLE_WAIT_INTERVAL).await;
        }
        None
    }

    /// Queue the complete characters in `pending + bytes`, keeping a split
    /// trailing sequence for the next chunk.
    fn forward(&self, pending: &mut Vec<u8>, bytes: &[u8]) {
        pending.extend_from_slice(bytes);
        let boundary = utf8_boundary(pending);
        if boundary == 0 {
            return;
        }
        let data = String::from_utf8_lossy(&pending[..boundary]).into_owned();
        pending.drain(..boundary);
        self.enqueue(OutputFrame::output(data));
    }

    async fn on_idle(&self, watchdog: &mut Watchdog) {
        match watchdog.on_idle() {
            WatchdogAction::Nothing => {}
            WatchdogAction::Probe => {
                debug!("[pump:{}] Terminal is silent, sending newline", self.session_id);
                self.probe().await;
            }
            WatchdogAction::Warn => {
                warn!(
                    "[pump:{}] No output after {:?}, trying to wake the terminal",
                    self.session_id, self.watchdog.warn_after
                );
                self.probe().await;
                self.enqueue(OutputFrame::warning(
                    "Warning: no terminal output received yet, tried to wake the terminal...",
                ));
                self.enqueue(OutputFrame::info(
                    "Hint: try pressing Enter or typing a command",
                ));
            }
        }
    }

    async fn probe(&self) {
        let process = self.process.clone();
        match tokio::task::spawn_blocking(move || process.write(b"\n")).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[pump:{}] Newline probe failed: {}", self.session_id, e),
            Err(e) => warn!("[pump:{}] Newline probe task failed: {}", self.session_id, e),
        }
    }

    fn enqueue(&self, frame: OutputFrame) {
        match frame.to_raw() {
            Ok(raw) => {
                if self.queue.push(raw) {
                    debug!(
                        "[pump:{}] Output queue full, dropped oldest frame ({} total)",
                        self.session_id,
                        self.queue.dropped()
                    );
                }
            }
            Err(e) => error!("[pump:{}] Failed to encode frame: {}", self.session_id, e),
        }
    }
}

/// Blocking reads live on their own thread so the pump can time out waits.
fn spawn_reader_thread(
    session_id: &str,
    mut reader: PtyReader,
    buffer_size: usize,
    tx: mpsc::Sender<ReadEvent>,
) -> std::io::Result<()> {
    let id = session_id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", id))
        .spawn(move || {
            debug!("[reader:{}] Reader thread started", id);
            let mut buf = vec![0u8; buffer_size];
            loop {
                let event = match reader.read(&mut buf) {
                    Ok(0) => ReadEvent::Eof,
                    Ok(n) => ReadEvent::Data(buf[..n].to_vec()),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => ReadEvent::Error(e),
                };
                let last = !matches!(event, ReadEvent::Data(_));
                if tx.blocking_send(event).is_err() || last {
                    break;
                }
            }
            debug!("[reader:{}] Reader thread finished", id);
        })?;
    Ok(())
}

/// Length of the prefix that can be decoded now.
///
/// Only an incomplete sequence at the very end is held back; invalid bytes
/// elsewhere are passed through and decoded lossily.
fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}


#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use crate::config::TerminalConfig;
    use crate::pty::{CommandLine, CommandResolver, ExecutionMode, Resolution};
    use crate::stream::testing::RecordingSink;
    use serde_json::Value;

    struct FixedResolver(CommandLine);

    impl CommandResolver for FixedResolver {
        fn resolve(&self, _force_simple: bool) -> Resolution {
            Resolution {
                command: self.0.clone(),
                mode: ExecutionMode::Simple,
            }
        }
    }

    fn started_process(script: &str) -> Arc<ProcessManager> {
        let config = TerminalConfig {
            init_timeout_ms: 200,
            ..TerminalConfig::default()
        };
        let resolver = FixedResolver(CommandLine::new("/bin/sh", &["-c", script]));
        let process = Arc::new(ProcessManager::new("pump", Arc::new(config), Arc::new(resolver)));
        process.start(80, 24).unwrap();
        process
    }

    fn drain(queue: &FrameQueue) -> Vec<Value> {
        std::iter::from_fn(|| queue.try_pop())
            .map(|raw| serde_json::from_str(raw.get()).unwrap())
            .collect()
    }

    fn pump(process: Arc<ProcessManager>, queue: Arc<FrameQueue>) -> OutputPump {
        OutputPump::new(
            "pump",
            process,
            queue,
            Arc::new(RecordingSink::new()),
            CancellationToken::new(),
            1024,
        )
    }

    #[tokio::test]
    async fn forwards_output_and_reports_termination() {
        let process = started_process("stty -echo; sleep 0.3; echo pump-output; sleep 0.3");
        let queue = Arc::new(FrameQueue::new(100));

        tokio::time::timeout(Duration::from_secs(10), pump(process, queue.clone()).run())
            .await
            .unwrap();

        let frames = drain(&queue);
        assert!(frames[0]["data"].as_str().unwrap().contains("Terminal ready"));
        let output: String = frames
            .iter()
            .filter(|f| f["type"] == "TERMINAL_OUTPUT")
            .map(|f| f["data"].as_str().unwrap().to_string())
            .collect();
        assert!(output.contains("pump-output"), "output was {:?}", output);
        assert_eq!(frames.last().unwrap()["event"], "terminated");
    }

    #[tokio::test]
    async fn short_lived_shell_always_reports_termination() {
        for run in 0..20 {
            let process = started_process("stty -echo; sleep 0.25; echo bye");
            let queue = Arc::new(FrameQueue::new(100));

            tokio::time::timeout(Duration::from_secs(10), pump(process, queue.clone()).run())
                .await
                .unwrap();

            let frames = drain(&queue);
            assert_eq!(
                frames.last().unwrap()["event"],
                "terminated",
                "run {} ended with {:?}",
                run,
                frames
            );
            assert!(!frames.iter().any(|f| f["level"] == "error"));
        }
    }

    #[tokio::test]
    async fn idle_newline_reaches_the_shell() {
        // The first read takes the init line, the second waits for the newline.
        let process = started_process("stty -echo; read a; read b; echo got-newline");
        let queue = Arc::new(FrameQueue::new(100));
        let worker = pump(process, queue.clone()).with_watchdog(WatchdogSettings {
            idle_tick: Duration::from_millis(20),
            probe_after_ticks: 5,
            warn_after: Duration::from_secs(3600),
        });

        tokio::time::timeout(Duration::from_secs(10), worker.run())
            .await
            .unwrap();

        let frames = drain(&queue);
        let output: String = frames
            .iter()
            .filter(|f| f["type"] == "TERMINAL_OUTPUT")
            .filter_map(|f| f["data"].as_str())
            .collect();
        assert!(output.contains("got-newline"), "output was {:?}", output);
        assert_eq!(frames.last().unwrap()["event"], "terminated");
    }

    #[tokio::test]
    async fn silent_terminal_warns_once() {
        let process = started_process("stty -echo; sleep 30");
        let queue = Arc::new(FrameQueue::new(100));
        let cancel = CancellationToken::new();
        let worker = OutputPump::new(
            "pump",
            process.clone(),
            queue.clone(),
            Arc::new(RecordingSink::new()),
            cancel.clone(),
            1024,
        )
        .with_watchdog(WatchdogSettings {
            idle_tick: Duration::from_millis(20),
            probe_after_ticks: 5,
            warn_after: Duration::from_millis(300),
        });
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        cancel.cancel();
        handle.await.unwrap();
        process.close();

        let frames = drain(&queue);
        let warnings = frames.iter().filter(|f| f["level"] == "warning").count();
        let hints = frames
            .iter()
            .filter(|f| f["data"].as_str().unwrap_or("").contains("Hint"))
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(hints, 1);
        assert!(!frames.iter().any(|f| f["event"] == "terminated"));
    }

    #[tokio::test]
    async fn cancelled_pump_stops_promptly() {
        let process = started_process("stty -echo; sleep 30");
        let queue = Arc::new(FrameQueue::new(100));
        let cancel = CancellationToken::new();
        let worker = OutputPump::new(
            "pump",
            process.clone(),
            queue,
            Arc::new(RecordingSink::new()),
            cancel.clone(),
            1024,
        );
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        process.close();
    }
}
