//! Detached application launch.
//!
//! The orchestrator starts the server, confirms it survived a short grace
//! period and then forgets about it. It never waits for or stops the child.

use crate::collaborators::{ChildState, ProcessSpawner, SpawnedChild};
use crate::error::{CollaboratorError, ProvisionError, Result};
use crate::stage::LaunchSpec;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

/// A confirmed start.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub pid: u32,
    pub addr: SocketAddr,
    pub log: PathBuf,
}

/// Spawns with `std::process` so the child outlives the runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSpawner;

struct DetachedChild(Child);

impl SpawnedChild for DetachedChild {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn state(&mut self) -> std::result::Result<ChildState, CollaboratorError> {
        match self.0.try_wait()? {
            Some(status) => Ok(ChildState::Exited(status.code())),
            None => Ok(ChildState::Running),
        }
    }
}

impl ProcessSpawner for DetachedSpawner {
    fn spawn(
        &self,
        spec: &LaunchSpec,
    ) -> std::result::Result<Box<dyn SpawnedChild>, CollaboratorError> {
        if let Some(parent) = spec.log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log)?;
        let err_log = log.try_clone()?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log));

        // Own process group: a Ctrl-C aimed at the orchestrator must not reach the server.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| CollaboratorError::Spawn {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(DetachedChild(child)))
    }
}

/// Fail with `PortInUse` when something already listens on `addr`.
pub fn ensure_port_free(addr: SocketAddr) -> Result<()> {
    match TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => Err(ProvisionError::PortInUse { addr }),
        Err(e) => Err(ProvisionError::LaunchFailed(format!(
            "cannot bind {addr}: {e}"
        ))),
    }
}

/// Start the application described by `spec` and confirm it stays up.
pub async fn launch(spec: &LaunchSpec, spawner: &dyn ProcessSpawner) -> Result<LaunchOutcome> {
    ensure_port_free(spec.addr)?;

    let mut child = spawner
        .spawn(spec)
        .map_err(|e| ProvisionError::LaunchFailed(e.to_string()))?;
    let pid = child.id();
    info!(pid, addr = %spec.addr, "application spawned");

    tokio::time::sleep(Duration::from_millis(spec.grace_ms)).await;

    match child.state() {
        Ok(ChildState::Running) => Ok(LaunchOutcome {
            pid,
            addr: spec.addr,
            log: spec.log.clone(),
        }),
        Ok(ChildState::Exited(code)) => {
            warn!(pid, code = ?code, "application exited during startup");
            Err(ProvisionError::LaunchFailed(format!(
                "process exited with code {code:?} during startup, see {}",
                spec.log.display()
            )))
        }
        Err(e) => Err(ProvisionError::LaunchFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeSpawner;
    use tempfile::tempdir;

    fn spec(dir: &std::path::Path, addr: SocketAddr, program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: dir.to_path_buf(),
            addr,
            log: dir.join("comfyui.log"),
            grace_ms: 200,
        }
    }

    fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_port_in_use_spawns_nothing() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let spawner = FakeSpawner::running(4242);

        let err = launch(&spec(dir.path(), addr, "python", &[]), &spawner)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::PortInUse { addr: a } if a == addr));
        assert!(spawner.spawned().is_empty());
    }

    #[tokio::test]
    async fn test_running_child_is_launched() {
        let dir = tempdir().unwrap();
        let addr = free_addr();
        let spawner = FakeSpawner::running(4242);

        let outcome = launch(&spec(dir.path(), addr, "python", &["main.py"]), &spawner)
            .await
            .unwrap();

        assert_eq!(outcome.pid, 4242);
        assert_eq!(outcome.addr, addr);
        assert_eq!(spawner.spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_early_exit_is_launch_failed() {
        let dir = tempdir().unwrap();
        let spawner = FakeSpawner::exiting(Some(1));
        let err = launch(&spec(dir.path(), free_addr(), "python", &[]), &spawner)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::LaunchFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detached_spawner_real_process() {
        let dir = tempdir().unwrap();
        let outcome = launch(
            &spec(dir.path(), free_addr(), "sh", &["-c", "echo started; sleep 5"]),
            &DetachedSpawner,
        )
        .await
        .unwrap();

        assert!(std::fs::read_to_string(dir.path().join("comfyui.log"))
            .unwrap()
            .contains("started"));
        std::process::Command::new("kill")
            .arg(outcome.pid.to_string())
            .status()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detached_spawner_exit_detected() {
        let dir = tempdir().unwrap();
        let err = launch(&spec(dir.path(), free_addr(), "false", &[]), &DetachedSpawner)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::LaunchFailed(_)));
    }
}
