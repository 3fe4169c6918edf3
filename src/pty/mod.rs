//! PTY process management
//!
//! This module decides which shell a terminal runs and owns its process:
//! - Host shells entered through nsenter when running inside a container
//! - Local interactive shells otherwise, or whenever the host path fails

mod environment;
mod process;

pub use environment::{
    CommandLine, CommandResolver, EnvironmentResolver, ExecutionMode, Resolution,
};
pub use process::{
    ProcessManager, ProcessStatus, PtyReader, PtyWriter, StartOutcome, TerminalState,
};
