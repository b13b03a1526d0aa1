//! Narrow interfaces over the external systems the orchestrator drives.
//!
//! Real implementations live in [`crate::runner`], [`crate::fetch`],
//! [`crate::launcher`] and [`crate::fs`]; in-memory ones in [`crate::fakes`].

use crate::error::CollaboratorError;
use crate::request::SecretToken;
use crate::stage::{AssetSpec, CommandSpec, LaunchSpec};
use async_trait::async_trait;

/// Result of a finished external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs package-manager and version-control commands.
///
/// Completion with any exit code is `Ok`; `Err` means the command could not
/// be started or did not finish.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput, CollaboratorError>;
}

/// Downloads one model asset to its destination. Returns bytes written.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(
        &self,
        asset: &AssetSpec,
        token: Option<&SecretToken>,
    ) -> Result<u64, CollaboratorError>;
}

/// State of a spawned child shortly after start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    Exited(Option<i32>),
}

/// Handle on a spawned child, only used for the start confirmation.
pub trait SpawnedChild: Send {
    fn id(&self) -> u32;
    fn state(&mut self) -> Result<ChildState, CollaboratorError>;
}

/// Starts the application process without taking ownership of its lifetime.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn SpawnedChild>, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_passed() {
        let ok = CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 3,
        };
        assert!(ok.passed());
        let failed = CommandOutput { exit_code: 1, ..ok };
        assert!(!failed.passed());
    }
}
