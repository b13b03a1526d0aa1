//! External command execution for package-manager and git actions.

use crate::collaborators::{CommandOutput, CommandRunner};
use crate::error::CollaboratorError;
use crate::stage::CommandSpec;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Runs commands as child processes with captured output.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// Per-command timeout, 0 disables it.
    timeout_secs: u64,
}

impl ProcessRunner {
    pub fn new(timeout_secs: u64) -> Self {
        ProcessRunner { timeout_secs }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        ProcessRunner::new(3600)
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput, CollaboratorError> {
        let start = Instant::now();

        if cmd.program.is_empty() {
            return Err(CollaboratorError::Spawn {
                program: String::new(),
                reason: "empty command".to_string(),
            });
        }

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        debug!(command = %cmd.display(), "spawning");
        let child = command.spawn().map_err(|e| CollaboratorError::Spawn {
            program: cmd.program.clone(),
            reason: e.to_string(),
        })?;

        let output = if self.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(self.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| CollaboratorError::Timeout {
                program: cmd.program.clone(),
                secs: self.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_run_simple_command() {
        let runner = ProcessRunner::new(60);
        let output = runner
            .run(&CommandSpec::new("echo", ["hello"]))
            .await
            .expect("run failed");
        assert!(output.passed());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_ok() {
        let runner = ProcessRunner::new(60);
        let output = runner
            .run(&CommandSpec::new("sh", ["-c", "echo oops >&2; exit 7"]))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 7);
        assert!(!output.passed());
        assert!(output.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = ProcessRunner::default();
        let err = runner
            .run(&CommandSpec::new("comfystack-no-such-binary", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempdir().unwrap();
        let runner = ProcessRunner::new(60);
        let output = runner
            .run(&CommandSpec::new("pwd", Vec::<String>::new()).in_dir(dir.path()))
            .await
            .unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(output.stdout.trim()).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = ProcessRunner::new(1);
        let err = runner
            .run(&CommandSpec::new("sleep", ["5"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CollaboratorError::Timeout {
                program: "sleep".to_string(),
                secs: 1
            }
        );
    }
}
