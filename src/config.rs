//! Terminal configuration
//!
//! Every option has a CLI flag and an environment variable, and every value has
//! a safe default so a missing or empty setting never stops the server.

use std::time::Duration;

use clap::Args;
use tracing::warn;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_NSENTER_PATH: &str = "/usr/bin/nsenter";
pub const DEFAULT_SHELL_PATHS: &str = "/bin/bash,/bin/sh,/bin/zsh,/usr/bin/bash,/usr/bin/sh";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Options for terminal sessions.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TerminalConfig {
    /// Output buffer size in bytes; a batch is flushed once it reaches half of this
    #[arg(long, env = "TERMINAL_WS_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Maximum time between batch flushes, in milliseconds
    #[arg(long, env = "TERMINAL_WS_FLUSH_INTERVAL", default_value_t = DEFAULT_FLUSH_INTERVAL_MS)]
    pub flush_interval_ms: u64,

    /// How long a freshly spawned process must stay alive, in milliseconds
    #[arg(long, env = "TERMINAL_INIT_TIMEOUT", default_value_t = DEFAULT_INIT_TIMEOUT_MS)]
    pub init_timeout_ms: u64,

    /// Always run the local shell instead of entering the host namespaces
    #[arg(long = "simple-mode", env = "TERMINAL_USE_SIMPLE_MODE")]
    pub force_simple_mode: bool,

    /// Path to the nsenter binary
    #[arg(long, env = "TERMINAL_NSENTER_PATH", default_value = DEFAULT_NSENTER_PATH)]
    pub nsenter_path: String,

    /// Candidate shells, probed in order
    #[arg(
        long,
        env = "TERMINAL_SHELL_PATHS",
        value_delimiter = ',',
        default_values_t = default_shell_paths()
    )]
    pub shell_paths: Vec<String>,

    /// Capacity of the per-session output frame queue
    #[arg(long, env = "TERMINAL_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            force_simple_mode: false,
            nsenter_path: DEFAULT_NSENTER_PATH.to_string(),
            shell_paths: default_shell_paths(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl TerminalConfig {
    /// Replace empty or zero settings with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.nsenter_path.trim().is_empty() {
            warn!(
                "nsenter path is empty, using default: {}",
                DEFAULT_NSENTER_PATH
            );
            self.nsenter_path = DEFAULT_NSENTER_PATH.to_string();
        } else {
            self.nsenter_path = self.nsenter_path.trim().to_string();
        }

        self.shell_paths = self
            .shell_paths
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if self.shell_paths.is_empty() {
            warn!("shell paths are empty, using defaults: {}", DEFAULT_SHELL_PATHS);
            self.shell_paths = default_shell_paths();
        }

        if self.buffer_size < 2 {
            warn!(
                "buffer size {} is too small, using default: {}",
                self.buffer_size, DEFAULT_BUFFER_SIZE
            );
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.flush_interval_ms == 0 {
            self.flush_interval_ms = DEFAULT_FLUSH_INTERVAL_MS;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Batch size that triggers an early flush.
    pub fn batch_threshold(&self) -> usize {
        self.buffer_size / 2
    }
}

pub fn default_shell_paths() -> Vec<String> {
    DEFAULT_SHELL_PATHS.split(',').map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        terminal: TerminalConfig,
    }

    #[test]
    fn cli_defaults_match_default_impl() {
        let cli = TestCli::try_parse_from(["test"]).unwrap();
        assert_eq!(cli.terminal, TerminalConfig::default());
    }

    #[test]
    fn shell_paths_are_comma_separated() {
        let cli =
            TestCli::try_parse_from(["test", "--shell-paths", "/bin/zsh, /bin/dash"]).unwrap();
        let config = cli.terminal.normalized();
        assert_eq!(config.shell_paths, vec!["/bin/zsh", "/bin/dash"]);
    }

    #[test]
    fn normalized_restores_empty_values() {
        let config = TerminalConfig {
            buffer_size: 0,
            flush_interval_ms: 0,
            nsenter_path: "  ".to_string(),
            shell_paths: vec![" ".to_string(), String::new()],
            queue_capacity: 0,
            ..TerminalConfig::default()
        }
        .normalized();

        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.flush_interval_ms, DEFAULT_FLUSH_INTERVAL_MS);
        assert_eq!(config.nsenter_path, DEFAULT_NSENTER_PATH);
        assert_eq!(config.shell_paths, default_shell_paths());
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn batch_threshold_is_half_the_buffer() {
        assert_eq!(TerminalConfig::default().batch_threshold(), 2048);
    }
}
