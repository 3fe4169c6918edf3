//! PTY process management
//!
//! Owns one PTY-backed child process: spawning with host-to-simple fallback,
//! resizing, writing input, liveness checks, and graceful-then-forced teardown.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::environment::{CommandResolver, ExecutionMode, Resolution};
use crate::config::TerminalConfig;
use crate::errors::TerminalError;

pub type PtyReader = Box<dyn Read + Send>;
pub type PtyWriter = Box<dyn Write + Send>;

const START_POLL_INTERVAL: Duration = Duration::from_millis(50);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of the terminal process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    NotStarted,
    Starting,
    Running,
    Failed,
    Closed,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalState::NotStarted => "not started",
            TerminalState::Starting => "starting",
            TerminalState::Running => "running",
            TerminalState::Failed => "failed",
            TerminalState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Snapshot of the OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotStarted,
    Running { pid: Option<u32> },
    Exited { code: Option<u32> },
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::NotStarted => write!(f, "not started"),
            ProcessStatus::Running { pid: Some(pid) } => write!(f, "running, pid {}", pid),
            ProcessStatus::Running { pid: None } => write!(f, "running"),
            ProcessStatus::Exited { code: Some(code) } => write!(f, "exited, code {}", code),
            ProcessStatus::Exited { code: None } => write!(f, "exited"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: Option<u32>, mode: ExecutionMode },
    /// A process is already running or starting; nothing was done.
    AlreadyActive,
}

struct ProcessHandle {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    size: PtySize,
}

impl ProcessHandle {
    fn exit_code(&mut self) -> Option<Option<u32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(Some(status.exit_code())),
            Ok(None) => None,
            Err(e) => {
                debug!("try_wait failed: {}", e);
                Some(None)
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        self.exit_code().is_none()
    }
}

struct Inner {
    state: TerminalState,
    mode: Option<ExecutionMode>,
    handle: Option<ProcessHandle>,
    last_exit: Option<Option<u32>>,
    /// Set once host mode failed; later starts go straight to simple mode.
    force_simple: bool,
}

/// Terminal process owned by one session.
pub struct ProcessManager {
    id: String,
    config: Arc<TerminalConfig>,
    resolver: Arc<dyn CommandResolver>,
    inner: Mutex<Inner>,
    writer: Mutex<Option<PtyWriter>>,
}

impl ProcessManager {
    pub fn new(
        id: impl Into<String>,
        config: Arc<TerminalConfig>,
        resolver: Arc<dyn CommandResolver>,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            resolver,
            inner: Mutex::new(Inner {
                state: TerminalState::NotStarted,
                mode: None,
                handle: None,
                last_exit: None,
                force_simple: false,
            }),
            writer: Mutex::new(None),
        }
    }

    /// Spawn the terminal process.
    ///
    /// Blocks for up to the configured start timeout while the new process is
    /// watched for an early exit. A failure in host mode is retried once in
    /// simple mode; a failure in simple mode leaves the manager `Failed`.
    pub fn start(&self, cols: u16, rows: u16) -> Result<StartOutcome, TerminalError> {
        let mut force_simple = {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                TerminalState::Running | TerminalState::Starting
            ) {
                warn!(
                    "[process:{}] Start ignored, terminal is already {}",
                    self.id, inner.state
                );
                return Ok(StartOutcome::AlreadyActive);
            }
            if inner.state == TerminalState::Closed {
                return Err(TerminalError::NotRunning {
                    state: inner.state,
                });
            }
            inner.state = TerminalState::Starting;
            inner.force_simple
        };

        loop {
            let resolution = self.resolver.resolve(force_simple);
            info!(
                "[process:{}] Starting terminal ({} mode): {}",
                self.id, resolution.mode, resolution.command
            );

            match self.launch(&resolution, cols, rows) {
                Ok((handle, writer)) => return self.commit(handle, writer, resolution.mode),
                Err(e) => {
                    error!("[process:{}] {}", self.id, e);
                    if resolution.mode == ExecutionMode::Host && !force_simple {
                        info!("[process:{}] Retrying in simple mode", self.id);
                        force_simple = true;
                        self.inner.lock().force_simple = true;
                        continue;
                    }
                    let mut inner = self.inner.lock();
                    if inner.state == TerminalState::Starting {
                        inner.state = TerminalState::Failed;
                    }
                    inner.mode = Some(resolution.mode);
                    return Err(e);
                }
            }
        }
    }

    fn launch(
        &self,
        resolution: &Resolution,
        cols: u16,
        rows: u16,
    ) -> Result<(ProcessHandle, PtyWriter), TerminalError> {
        let (mut handle, mut writer) = open_process(resolution, cols, rows)
            .map_err(|e| TerminalError::Spawn(format!("{:#}", e)))?;

        if let Err(e) = self.wait_for_start(&mut handle) {
            terminate(&self.id, &mut handle);
            return Err(e);
        }

        if let Some(init) = init_command(resolution.mode) {
            let sent = writer
                .write_all(init.as_bytes())
                .and_then(|_| writer.flush());
            match sent {
                Ok(()) => debug!("[process:{}] Sent init command", self.id),
                Err(e) => warn!("[process:{}] Failed to send init command: {}", self.id, e),
            }
        }

        Ok((handle, writer))
    }

    /// Watch a fresh process for the start window; it must still be alive afterwards.
    fn wait_for_start(&self, handle: &mut ProcessHandle) -> Result<(), TerminalError> {
        let deadline = Instant::now() + self.config.init_timeout();
        loop {
            if let Some(code) = handle.exit_code() {
                error!(
                    "[process:{}] Terminal process exited right after start (code: {:?})",
                    self.id, code
                );
                return Err(TerminalError::ExitedImmediately { code });
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            std::thread::sleep(START_POLL_INTERVAL);
        }
    }

    fn commit(
        &self,
        mut handle: ProcessHandle,
        writer: PtyWriter,
        mode: ExecutionMode,
    ) -> Result<StartOutcome, TerminalError> {
        let mut inner = self.inner.lock();
        if inner.state != TerminalState::Starting {
            // Closed while we were starting.
            let state = inner.state;
            drop(inner);
            terminate(&self.id, &mut handle);
            return Err(TerminalError::NotRunning { state });
        }

        let pid = handle.pid;
        info!(
            "[process:{}] Terminal started (pid: {:?}, size: {}x{}, mode: {})",
            self.id, pid, handle.size.cols, handle.size.rows, mode
        );
        inner.handle = Some(handle);
        inner.mode = Some(mode);
        inner.state = TerminalState::Running;
        *self.writer.lock() = Some(writer);
        Ok(StartOutcome::Started { pid, mode })
    }

    /// A new reader over the process output.
    pub fn take_reader(&self) -> Result<PtyReader, TerminalError> {
        let inner = self.inner.lock();
        let handle = inner.handle.as_ref().ok_or(TerminalError::NotRunning {
            state: inner.state,
        })?;
        handle
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Io(std::io::Error::other(format!("{:#}", e))))
    }

    /// Apply a new terminal size.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let alive = state == TerminalState::Running
            && inner.handle.as_mut().map(|h| h.is_alive()).unwrap_or(false);
        let handle = match inner.handle.as_mut() {
            Some(handle) if alive => handle,
            _ => {
                warn!(
                    "[process:{}] Cannot resize, terminal is not running ({})",
                    self.id, state
                );
                return Err(TerminalError::NotRunning { state });
            }
        };

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        handle
            .master
            .resize(size)
            .map_err(|e| TerminalError::Io(std::io::Error::other(format!("{:#}", e))))?;
        handle.size = size;
        debug!("[process:{}] Resized to {}x{}", self.id, cols, rows);
        Ok(())
    }

    /// Write input to the process and flush it.
    pub fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        if !self.is_alive() {
            let state = self.state();
            warn!(
                "[process:{}] Cannot write, terminal is not running ({})",
                self.id, state
            );
            return Err(TerminalError::NotRunning { state });
        }

        let mut writer = self.writer.lock();
        let Some(writer) = writer.as_mut() else {
            return Err(TerminalError::NotRunning {
                state: self.state(),
            });
        };
        if data.len() > 1 {
            debug!("[process:{}] Writing {} bytes", self.id, data.len());
        }
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// True iff a process exists, is alive, and the manager is running.
    pub fn is_alive(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TerminalState::Running {
            return false;
        }
        inner
            .handle
            .as_mut()
            .map(|handle| handle.is_alive())
            .unwrap_or(false)
    }

    /// Stop the process and release its streams. Safe to call repeatedly.
    pub fn close(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            if inner.state == TerminalState::Closed {
                return;
            }
            inner.state = TerminalState::Closed;
            inner.handle.take()
        };

        self.writer.lock().take();
        if let Some(mut handle) = handle {
            let code = terminate(&self.id, &mut handle);
            self.inner.lock().last_exit = Some(code);
            info!("[process:{}] Terminal closed (exit code: {:?})", self.id, code);
        }
    }

    pub fn state(&self) -> TerminalState {
        self.inner.lock().state
    }

    /// Mode of the last start attempt.
    pub fn mode(&self) -> Option<ExecutionMode> {
        self.inner.lock().mode
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().handle.as_ref().and_then(|h| h.pid)
    }

    pub fn status(&self) -> ProcessStatus {
        let mut inner = self.inner.lock();
        let last_exit = inner.last_exit;
        match inner.handle.as_mut() {
            Some(handle) => match handle.exit_code() {
                Some(code) => ProcessStatus::Exited { code },
                None => ProcessStatus::Running { pid: handle.pid },
            },
            None => match last_exit {
                Some(code) => ProcessStatus::Exited { code },
                None => ProcessStatus::NotStarted,
            },
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_process(
    resolution: &Resolution,
    cols: u16,
    rows: u16,
) -> anyhow::Result<(ProcessHandle, PtyWriter)> {
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    let pair = native_pty_system()
        .openpty(size)
        .context("Failed to open PTY")?;

    let mut cmd = CommandBuilder::new(&resolution.command.program);
    cmd.args(&resolution.command.args);
    cmd.env("TERM", "xterm-256color");

    let child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("Failed to spawn '{}'", resolution.command))?;
    // The slave must not stay open here or reads never see the child hang up.
    drop(pair.slave);

    let writer = pair
        .master
        .take_writer()
        .context("Failed to take PTY writer")?;
    let pid = child.process_id();

    Ok((
        ProcessHandle {
            master: pair.master,
            child,
            pid,
            size,
        },
        writer,
    ))
}

/// One-line shell setup: echo input, disable canonical mode and signal keys,
/// set a prompt, print the ready banner.
fn init_command(mode: ExecutionMode) -> Option<&'static str> {
    if cfg!(windows) {
        return None;
    }
    Some(match mode {
        ExecutionMode::Simple => {
            "stty echo -icanon -icrnl -isig; export PS1='$ '; echo 'Terminal ready (simple mode)'\n"
        }
        ExecutionMode::Host => {
            "stty echo -icanon -icrnl -isig; export PS1='\\h:\\w\\$ '; echo 'Terminal ready (host mode)'\n"
        }
    })
}

/// Hang up the process, give it a moment, then kill it. Returns the exit code if known.
fn terminate(id: &str, handle: &mut ProcessHandle) -> Option<u32> {
    if let Some(code) = handle.exit_code() {
        return code;
    }

    #[cfg(unix)]
    if let Some(pid) = handle.pid {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
            debug!("[process:{}] SIGHUP to {} failed: {}", id, pid, e);
        }
    }

    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        if let Some(code) = handle.exit_code() {
            return code;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }

    warn!(
        "[process:{}] Process {:?} did not exit in time, killing it",
        id, handle.pid
    );
    if let Err(e) = handle.child.kill() {
        warn!("[process:{}] Failed to kill terminal process: {}", id, e);
    }
    match handle.child.wait() {
        Ok(status) => Some(status.exit_code()),
        Err(e) => {
            debug!("[process:{}] wait after kill failed: {}", id, e);
            None
        }
    }
}
