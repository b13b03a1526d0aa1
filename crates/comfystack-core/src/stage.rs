//! Provisioning stages, steps and the actions they carry.

use crate::catalog::{Accelerator, ModelGroup};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Provisioning stages in their fixed execution order.
///
/// The derived `Ord` is the pipeline order; planner and executor rely on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Isolated Python environment
    Environment,
    /// Accelerator-specific runtime packages (torch) plus manifest
    Dependencies,
    /// Application git checkout
    Checkout,
    /// Application `requirements.txt`
    Requirements,
    /// Optional custom-node extension
    Extension,
    /// Model asset downloads
    Models,
    /// Detached application process
    Launch,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Environment,
        Stage::Dependencies,
        Stage::Checkout,
        Stage::Requirements,
        Stage::Extension,
        Stage::Models,
        Stage::Launch,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Environment => "environment",
            Stage::Dependencies => "dependencies",
            Stage::Checkout => "checkout",
            Stage::Requirements => "requirements",
            Stage::Extension => "extension",
            Stage::Models => "models",
            Stage::Launch => "launch",
        }
    }

    /// Whether a failure of this stage aborts the run.
    pub fn criticality(&self) -> Criticality {
        match self {
            Stage::Extension => Criticality::BestEffort,
            _ => Criticality::Fatal,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a step failure is classified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Abort the pipeline
    Fatal,
    /// Record a warning and continue
    BestEffort,
}

/// Why a stage is or is not executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    /// Artifact already satisfies the request
    Skip { reason: String },
    /// Artifact absent, create it
    Fresh,
    /// Artifact stale (or an upstream stage changed), rebuild it
    Repair { reason: String },
    /// Artifact valid but re-provisioning was forced
    Refresh,
    /// Stage exempt from idempotence skipping
    Always,
}

impl Decision {
    pub fn is_skip(&self) -> bool {
        matches!(self, Decision::Skip { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Skip { .. } => "skip",
            Decision::Fresh => "fresh",
            Decision::Repair { .. } => "repair",
            Decision::Refresh => "refresh",
            Decision::Always => "always",
        }
    }
}

/// External command, argv-style (no shell).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Command line for logs and reports.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One model file download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetSpec {
    pub group: ModelGroup,
    /// Path inside the model repository
    pub repo_path: String,
    pub url: String,
    pub dest: PathBuf,
}

/// Everything needed to start the application detached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub addr: SocketAddr,
    /// stdout/stderr of the child are appended here
    pub log: PathBuf,
    /// Child must survive this long to count as started
    pub grace_ms: u64,
}

/// A single unit of work inside a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Run an external command
    Run(CommandSpec),
    /// Remove a directory tree that cannot be repaired in place
    RemoveDir { path: PathBuf },
    /// Rewrite the dependency manifest from `pip freeze`
    RecordManifest {
        interpreter: PathBuf,
        manifest: PathBuf,
        accelerator: Accelerator,
        requirements: Option<PathBuf>,
    },
    /// Download a model file
    Download(AssetSpec),
    /// Start the application
    Launch(LaunchSpec),
}

impl Action {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Action::Run(cmd) => cmd.display(),
            Action::RemoveDir { path } => format!("remove {}", path.display()),
            Action::RecordManifest { manifest, .. } => {
                format!("record manifest {}", manifest.display())
            }
            Action::Download(asset) => format!("download {}", asset.repo_path),
            Action::Launch(spec) => format!("launch {} on {}", spec.program.display(), spec.addr),
        }
    }
}

/// A planned stage: decision, criticality and the actions to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub stage: Stage,
    pub decision: Decision,
    pub criticality: Criticality,
    pub actions: Vec<Action>,
}

impl Step {
    /// A step that will not run.
    pub fn skipped(stage: Stage, reason: impl Into<String>) -> Self {
        Step {
            stage,
            decision: Decision::Skip {
                reason: reason.into(),
            },
            criticality: stage.criticality(),
            actions: Vec::new(),
        }
    }

    /// A step that will run the given actions.
    pub fn run(stage: Stage, decision: Decision, actions: Vec<Action>) -> Self {
        Step {
            stage,
            decision,
            criticality: stage.criticality(),
            actions,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.decision.is_skip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_matches_pipeline() {
        let mut sorted = Stage::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Stage::ALL.to_vec());
        assert!(Stage::Environment < Stage::Dependencies);
        assert!(Stage::Checkout < Stage::Models);
        assert!(Stage::Models < Stage::Launch);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Environment.name(), "environment");
        assert_eq!(Stage::Models.to_string(), "models");
    }

    #[test]
    fn test_only_extension_is_best_effort() {
        for stage in Stage::ALL {
            let expected = if stage == Stage::Extension {
                Criticality::BestEffort
            } else {
                Criticality::Fatal
            };
            assert_eq!(stage.criticality(), expected, "{stage}");
        }
    }

    #[test]
    fn test_command_display() {
        let cmd = CommandSpec::new("git", ["pull", "--ff-only"]).in_dir("/tmp");
        assert_eq!(cmd.display(), "git pull --ff-only");
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_skipped_step_is_not_pending() {
        let step = Step::skipped(Stage::Checkout, "checkout present");
        assert!(!step.is_pending());
        assert!(step.actions.is_empty());

        let step = Step::run(Stage::Checkout, Decision::Fresh, vec![]);
        assert!(step.is_pending());
    }
}
