//! CLI command implementations

pub mod add;
pub mod delete;
pub mod modify;
pub mod rename;
pub mod search;
pub mod whoami;

use lodestar_core::ClientConfig;
use std::time::Duration;

use crate::OutputFormat;

/// Context passed to all commands
pub struct CommandContext {
    pub config: ClientConfig,
    pub output_format: OutputFormat,
    pub quiet: bool,
    /// Per-operation timeout; `None` waits without bound
    pub timeout: Option<Duration>,
}

impl CommandContext {
    /// Check if output should be JSON
    pub fn is_json(&self) -> bool {
        matches!(self.output_format, OutputFormat::Json)
    }

    /// Print info message if not quiet
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }
}
