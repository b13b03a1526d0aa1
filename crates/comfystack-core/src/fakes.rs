//! In-memory fakes for the collaborator traits (testing only)
//!
//! `ScriptedRunner`, `RecordingFetcher` and `FakeSpawner` record what they
//! were asked to do and answer from a script instead of touching the host.
//! `HostToolsFs` reads the real filesystem but answers `PATH` lookups from
//! a fixed table.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::collaborators::*;
use crate::error::CollaboratorError;
use crate::fs::{LocalFs, PathInspector, PathKind};
use crate::request::SecretToken;
use crate::stage::{AssetSpec, CommandSpec, LaunchSpec};

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// Command runner answering by program name. Unscripted programs exit 0.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    exit_codes: HashMap<String, i32>,
    stdout: HashMap<String, String>,
    unavailable: Vec<String>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `program` exit with `code`.
    pub fn fail(mut self, program: &str, code: i32) -> Self {
        self.exit_codes.insert(program.to_string(), code);
        self
    }

    /// Make `program` print `text` on stdout.
    pub fn stdout(mut self, program: &str, text: &str) -> Self {
        self.stdout.insert(program.to_string(), text.to_string());
        self
    }

    /// Make `program` fail to start.
    pub fn unavailable(mut self, program: &str) -> Self {
        self.unavailable.push(program.to_string());
        self
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c.program).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput, CollaboratorError> {
        self.calls.lock().unwrap().push(cmd.clone());
        if self.unavailable.contains(&cmd.program) {
            return Err(CollaboratorError::Spawn {
                program: cmd.program.clone(),
                reason: "not found".to_string(),
            });
        }
        let exit_code = self.exit_codes.get(&cmd.program).copied().unwrap_or(0);
        Ok(CommandOutput {
            exit_code,
            stdout: self.stdout.get(&cmd.program).cloned().unwrap_or_default(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{} failed", cmd.program)
            },
            duration_ms: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingFetcher
// ---------------------------------------------------------------------------

/// Asset fetcher that writes a placeholder file and remembers the call.
#[derive(Debug, Default)]
pub struct RecordingFetcher {
    fail: bool,
    calls: Mutex<Vec<(AssetSpec, Option<String>)>>,
}

impl RecordingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch fails with an HTTP error.
    pub fn failing() -> Self {
        RecordingFetcher {
            fail: true,
            ..Self::default()
        }
    }

    pub fn fetched(&self) -> Vec<AssetSpec> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(asset, _)| asset.clone())
            .collect()
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, token)| token.clone())
            .collect()
    }
}

#[async_trait]
impl AssetFetcher for RecordingFetcher {
    async fn fetch(
        &self,
        asset: &AssetSpec,
        token: Option<&SecretToken>,
    ) -> Result<u64, CollaboratorError> {
        self.calls
            .lock()
            .unwrap()
            .push((asset.clone(), token.map(|t| t.expose().to_string())));
        if self.fail {
            return Err(CollaboratorError::Http(format!("{} returned 401", asset.url)));
        }
        let payload = b"weights";
        if let Some(parent) = asset.dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&asset.dest, payload)?;
        Ok(payload.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// FakeSpawner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct FakeChild {
    pid: u32,
    state: ChildState,
}

impl SpawnedChild for FakeChild {
    fn id(&self) -> u32 {
        self.pid
    }

    fn state(&mut self) -> Result<ChildState, CollaboratorError> {
        Ok(self.state)
    }
}

/// Spawner whose children report a fixed state.
#[derive(Debug)]
pub struct FakeSpawner {
    child: FakeChild,
    spawned: Mutex<Vec<LaunchSpec>>,
}

impl FakeSpawner {
    /// Children stay up.
    pub fn running(pid: u32) -> Self {
        FakeSpawner {
            child: FakeChild {
                pid,
                state: ChildState::Running,
            },
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Children exit during the grace period.
    pub fn exiting(code: Option<i32>) -> Self {
        FakeSpawner {
            child: FakeChild {
                pid: 1,
                state: ChildState::Exited(code),
            },
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn spawned(&self) -> Vec<LaunchSpec> {
        self.spawned.lock().unwrap().clone()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn SpawnedChild>, CollaboratorError> {
        self.spawned.lock().unwrap().push(spec.clone());
        Ok(Box::new(self.child))
    }
}

// ---------------------------------------------------------------------------
// HostToolsFs
// ---------------------------------------------------------------------------

/// Local filesystem with a fixed set of programs on `PATH`.
#[derive(Debug, Default, Clone)]
pub struct HostToolsFs {
    programs: HashMap<String, PathBuf>,
}

impl HostToolsFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// `python3` and `git` under `/usr/bin`.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_program("python3", "/usr/bin/python3")
            .with_program("git", "/usr/bin/git")
    }

    pub fn with_program(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.programs.insert(name.to_string(), path.into());
        self
    }
}

impl PathInspector for HostToolsFs {
    fn kind(&self, path: &Path) -> PathKind {
        LocalFs.kind(path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        LocalFs.read_to_string(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        LocalFs.read(path)
    }

    fn is_writable(&self, dir: &Path) -> bool {
        LocalFs.is_writable(dir)
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        self.programs.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_records_calls() {
        let runner = ScriptedRunner::new().fail("git", 128).stdout("pip", "ok");
        let git = runner.run(&CommandSpec::new("git", ["clone"])).await.unwrap();
        let pip = runner.run(&CommandSpec::new("pip", ["freeze"])).await.unwrap();
        assert_eq!(git.exit_code, 128);
        assert_eq!(pip.stdout, "ok");
        assert_eq!(runner.programs(), vec!["git", "pip"]);
    }

    #[tokio::test]
    async fn test_unavailable_program() {
        let runner = ScriptedRunner::new().unavailable("git");
        let err = runner.run(&CommandSpec::new("git", ["pull"])).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Spawn { .. }));
    }

    #[test]
    fn test_host_tools_fs_answers_from_table() {
        let fs = HostToolsFs::with_defaults();
        assert_eq!(fs.find_program("git"), Some(PathBuf::from("/usr/bin/git")));
        assert_eq!(fs.find_program("ffmpeg"), None);
    }
}
