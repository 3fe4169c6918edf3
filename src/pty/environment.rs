//! Environment detection
//!
//! Decides what the terminal runs: the host's shell entered through nsenter
//! when we are inside a container, otherwise a local interactive shell.
//! Every probe fails toward the local shell.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TerminalConfig;

const CONTAINER_MARKER: &str = "/.dockerenv";
const CGROUP_PATH: &str = "/proc/self/cgroup";
const CONTAINER_CGROUP_PATTERN: &str = "/docker/";
const FALLBACK_SHELL: &str = "/bin/sh";

/// Where the terminal process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Host namespaces entered through nsenter
    Host,
    /// Local shell
    Simple,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Host => write!(f, "host"),
            ExecutionMode::Simple => write!(f, "simple"),
        }
    }
}

/// Program and arguments for the terminal's controlling process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub command: CommandLine,
    pub mode: ExecutionMode,
}

/// Chooses the command line for a new terminal process.
pub trait CommandResolver: Send + Sync {
    /// `force_simple` skips host detection entirely.
    fn resolve(&self, force_simple: bool) -> Resolution;
}

/// Resolver backed by the real filesystem.
#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    force_simple: bool,
    nsenter_path: String,
    shell_paths: Vec<String>,
    marker_path: PathBuf,
    cgroup_path: PathBuf,
}

impl EnvironmentResolver {
    pub fn new(config: &TerminalConfig) -> Self {
        Self {
            force_simple: config.force_simple_mode,
            nsenter_path: config.nsenter_path.clone(),
            shell_paths: config.shell_paths.clone(),
            marker_path: PathBuf::from(CONTAINER_MARKER),
            cgroup_path: PathBuf::from(CGROUP_PATH),
        }
    }

    /// Override the container marker file.
    pub fn with_marker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.marker_path = path.into();
        self
    }

    /// Override the cgroup membership file.
    pub fn with_cgroup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cgroup_path = path.into();
        self
    }

    /// Whether this process runs inside a container.
    pub fn in_container(&self) -> bool {
        if self.marker_path.exists() {
            debug!("Found {}, running in a container", self.marker_path.display());
            return true;
        }
        match std::fs::read_to_string(&self.cgroup_path) {
            Ok(content) => {
                let found = content.contains(CONTAINER_CGROUP_PATTERN);
                if found {
                    debug!("Container cgroup found in {}", self.cgroup_path.display());
                }
                found
            }
            Err(e) => {
                debug!(
                    "Could not read {}: {}, assuming no container",
                    self.cgroup_path.display(),
                    e
                );
                false
            }
        }
    }

    /// Locate a usable nsenter binary.
    ///
    /// A configured path is used as-is; a bare name is looked up on `PATH`.
    pub fn nsenter_binary(&self) -> Option<PathBuf> {
        let configured = self.nsenter_path.trim();
        if configured.is_empty() {
            return None;
        }
        let candidate = if configured.contains('/') {
            PathBuf::from(configured)
        } else {
            which::which(configured).ok()?
        };
        if is_executable(&candidate) {
            Some(candidate)
        } else {
            warn!(
                "nsenter is not available at {}, using the container shell",
                candidate.display()
            );
            None
        }
    }

    /// First configured shell that exists.
    pub fn find_shell(&self) -> Option<String> {
        self.shell_paths
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .find(|s| Path::new(s).exists())
            .map(str::to_string)
    }

    fn host_command(&self) -> Option<CommandLine> {
        if !self.in_container() {
            return None;
        }
        let nsenter = self.nsenter_binary()?;
        let shell = self.find_shell().unwrap_or_else(|| {
            warn!("No configured shell found, using {}", FALLBACK_SHELL);
            FALLBACK_SHELL.to_string()
        });
        Some(CommandLine::new(
            nsenter.to_string_lossy(),
            &["-t", "1", "-m", "-u", "-i", "-n", "-p", &shell],
        ))
    }

    fn local_command(&self) -> CommandLine {
        if cfg!(windows) {
            return CommandLine::new("cmd.exe", &[]);
        }
        match self.find_shell() {
            Some(shell) => CommandLine::new(shell, &["-i"]),
            None => {
                debug!("No configured shell found, using {}", FALLBACK_SHELL);
                CommandLine::new(FALLBACK_SHELL, &["-i"])
            }
        }
    }
}

impl CommandResolver for EnvironmentResolver {
    fn resolve(&self, force_simple: bool) -> Resolution {
        if !(force_simple || self.force_simple) {
            if let Some(command) = self.host_command() {
                info!("Entering host namespaces: {}", command);
                return Resolution {
                    command,
                    mode: ExecutionMode::Host,
                };
            }
        }
        let command = self.local_command();
        debug!("Using local shell: {}", command);
        Resolution {
            command,
            mode: ExecutionMode::Simple,
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn file(&self, name: &str, content: &str, mode: u32) -> String {
            let path = self.path(name);
            fs::write(&path, content).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn resolver(&self, nsenter: &str, shells: Vec<String>) -> EnvironmentResolver {
            let config = TerminalConfig {
                nsenter_path: nsenter.to_string(),
                shell_paths: shells,
                ..TerminalConfig::default()
            };
            EnvironmentResolver::new(&config)
                .with_marker_path(self.path("dockerenv"))
                .with_cgroup_path(self.path("cgroup"))
        }
    }

    #[test]
    fn marker_file_means_container() {
        let fx = Fixture::new();
        let resolver = fx.resolver("/nonexistent/nsenter", vec![]);
        assert!(!resolver.in_container());

        fx.file("dockerenv", "", 0o644);
        assert!(resolver.in_container());
    }

    #[test]
    fn docker_cgroup_means_container() {
        let fx = Fixture::new();
        fx.file("cgroup", "12:pids:/docker/3f2a9c\n0::/\n", 0o644);
        assert!(fx.resolver("nsenter", vec![]).in_container());

        fx.file("cgroup", "0::/user.slice\n", 0o644);
        assert!(!fx.resolver("nsenter", vec![]).in_container());
    }

    #[test]
    fn host_mode_uses_nsenter_with_all_namespaces() {
        let fx = Fixture::new();
        fx.file("dockerenv", "", 0o644);
        let nsenter = fx.file("nsenter", "#!/bin/sh\n", 0o755);
        let shell = fx.file("bash", "#!/bin/sh\n", 0o755);
        let resolver = fx.resolver(&nsenter, vec!["/nonexistent/zsh".to_string(), shell.clone()]);

        let resolution = resolver.resolve(false);
        assert_eq!(resolution.mode, ExecutionMode::Host);
        assert_eq!(resolution.command.program, nsenter);
        assert_eq!(
            resolution.command.args,
            vec!["-t", "1", "-m", "-u", "-i", "-n", "-p", shell.as_str()]
        );
    }

    #[test]
    fn non_executable_nsenter_falls_back_to_local_shell() {
        let fx = Fixture::new();
        fx.file("dockerenv", "", 0o644);
        let nsenter = fx.file("nsenter", "", 0o644);
        let shell = fx.file("sh", "#!/bin/sh\n", 0o755);
        let resolution = fx.resolver(&nsenter, vec![shell.clone()]).resolve(false);

        assert_eq!(resolution.mode, ExecutionMode::Simple);
        assert_eq!(resolution.command, CommandLine::new(shell, &["-i"]));
    }

    #[test]
    fn forced_simple_mode_skips_detection() {
        let fx = Fixture::new();
        fx.file("dockerenv", "", 0o644);
        let nsenter = fx.file("nsenter", "#!/bin/sh\n", 0o755);
        let shell = fx.file("sh", "#!/bin/sh\n", 0o755);
        let resolver = fx.resolver(&nsenter, vec![shell]);

        assert_eq!(resolver.resolve(true).mode, ExecutionMode::Simple);

        let mut forced = resolver.clone();
        forced.force_simple = true;
        assert_eq!(forced.resolve(false).mode, ExecutionMode::Simple);
    }

    #[test]
    fn outside_container_uses_first_existing_shell() {
        let fx = Fixture::new();
        let shell = fx.file("zsh", "#!/bin/sh\n", 0o755);
        let resolver = fx.resolver(
            "/nonexistent/nsenter",
            vec!["/nonexistent/bash".to_string(), shell.clone()],
        );

        let resolution = resolver.resolve(false);
        assert_eq!(resolution.mode, ExecutionMode::Simple);
        assert_eq!(resolution.command.program, shell);
        assert_eq!(resolution.command.args, vec!["-i"]);
    }

    #[test]
    fn missing_shells_fall_back_to_bin_sh() {
        let fx = Fixture::new();
        let resolution = fx
            .resolver("/nonexistent/nsenter", vec!["/nonexistent/bash".to_string()])
            .resolve(false);
        assert_eq!(resolution.command, CommandLine::new("/bin/sh", &["-i"]));
    }

    #[test]
    fn command_line_display_joins_arguments() {
        let command = CommandLine::new("/usr/bin/nsenter", &["-t", "1", "/bin/bash"]);
        assert_eq!(command.to_string(), "/usr/bin/nsenter -t 1 /bin/bash");
    }
}
