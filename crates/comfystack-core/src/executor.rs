//! Sequential step execution.
//!
//! Steps run one at a time in plan order and actions inside a step run in
//! order. The first failing action fails its step. A fatal failure stops
//! the run; a best-effort failure is downgraded to a warning.

use crate::collaborators::{AssetFetcher, CommandRunner, ProcessSpawner};
use crate::error::{CollaboratorError, ProvisionError, Result};
use crate::launcher::{self, LaunchOutcome};
use crate::manifest::{self, sha256_hex, Manifest};
use crate::plan::PlanResult;
use crate::report::{ExecutionReport, OutcomeStatus, StepOutcome};
use crate::request::SecretToken;
use crate::stage::{Action, CommandSpec, Criticality, Decision, Stage, Step};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Lines of collaborator stderr kept in failure reasons.
const STDERR_TAIL_LINES: usize = 20;

/// Applies planned actions through injected collaborators.
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn AssetFetcher>,
    spawner: Arc<dyn ProcessSpawner>,
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

fn step_failed(stage: Stage, err: CollaboratorError) -> ProvisionError {
    ProvisionError::StepFailed {
        stage,
        exit_code: err.exit_code(),
        reason: err.to_string(),
    }
}

impl Executor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn AssetFetcher>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        Executor {
            runner,
            fetcher,
            spawner,
        }
    }

    /// Execute `plan`. `token` is only ever passed to the asset fetcher.
    pub async fn execute(&self, plan: &PlanResult, token: Option<&SecretToken>) -> ExecutionReport {
        let mut report = ExecutionReport::start();
        info!(run_id = %report.run_id, steps = plan.steps().len(), "Starting provisioning run");

        for step in plan.steps() {
            if let Decision::Skip { reason } = &step.decision {
                info!(stage = %step.stage, reason = %reason, "Skipping stage");
                report.record(StepOutcome {
                    stage: step.stage,
                    status: OutcomeStatus::Skipped,
                    decision: step.decision.label().to_string(),
                    detail: Some(reason.clone()),
                    exit_code: None,
                    duration_ms: 0,
                });
                continue;
            }

            info!(stage = %step.stage, decision = step.decision.label(), "Executing stage");
            let start = Instant::now();
            let result = self.run_step(step, token).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(launched) => {
                    if launched.is_some() {
                        report.launch = launched;
                    }
                    report.record(StepOutcome {
                        stage: step.stage,
                        status: OutcomeStatus::Succeeded,
                        decision: step.decision.label().to_string(),
                        detail: None,
                        exit_code: None,
                        duration_ms,
                    });
                }
                Err(err) => {
                    let exit_code = match &err {
                        ProvisionError::StepFailed { exit_code, .. } => *exit_code,
                        _ => None,
                    };
                    let fatal = step.criticality == Criticality::Fatal;
                    report.record(StepOutcome {
                        stage: step.stage,
                        status: if fatal {
                            OutcomeStatus::Failed
                        } else {
                            OutcomeStatus::Warned
                        },
                        decision: step.decision.label().to_string(),
                        detail: Some(err.to_string()),
                        exit_code,
                        duration_ms,
                    });
                    if fatal {
                        error!(stage = %step.stage, error = %err, "Stage failed, aborting");
                        report.abort(step.stage, &err);
                        break;
                    }
                    warn!(stage = %step.stage, error = %err, "Best-effort stage failed, continuing");
                }
            }
        }

        report.finish();
        info!(
            run_id = %report.run_id,
            succeeded = report.succeeded_count(),
            skipped = report.skipped_count(),
            warned = report.warned_count(),
            failed = report.failed_count(),
            "Provisioning run finished"
        );
        report
    }

    async fn run_step(
        &self,
        step: &Step,
        token: Option<&SecretToken>,
    ) -> Result<Option<LaunchOutcome>> {
        let mut launched = None;
        for action in &step.actions {
            debug!(stage = %step.stage, action = %action.describe(), "applying");
            if let Some(outcome) = self.apply(step.stage, action, token).await? {
                launched = Some(outcome);
            }
        }
        Ok(launched)
    }

    async fn apply(
        &self,
        stage: Stage,
        action: &Action,
        token: Option<&SecretToken>,
    ) -> Result<Option<LaunchOutcome>> {
        match action {
            Action::Run(cmd) => {
                self.run_command(stage, cmd).await?;
            }
            Action::RemoveDir { path } => {
                remove_path(path)
                    .await
                    .map_err(|e| step_failed(stage, e.into()))?;
            }
            Action::RecordManifest {
                interpreter,
                manifest: manifest_path,
                accelerator,
                requirements,
            } => {
                let freeze = CommandSpec::new(
                    interpreter.display().to_string(),
                    ["-m", "pip", "freeze"],
                );
                let output = self.run_command(stage, &freeze).await?;
                let requirements_sha256 = match requirements {
                    Some(path) => Some(sha256_hex(
                        &tokio::fs::read(path)
                            .await
                            .map_err(|e| step_failed(stage, e.into()))?,
                    )),
                    None => None,
                };
                let record = Manifest::new(*accelerator, requirements_sha256, &output);
                manifest::write_atomic(manifest_path, &record.render())
                    .map_err(|e| step_failed(stage, e.into()))?;
            }
            Action::Download(asset) => {
                self.fetcher
                    .fetch(asset, token)
                    .await
                    .map_err(|e| step_failed(stage, e))?;
            }
            Action::Launch(spec) => {
                return launcher::launch(spec, self.spawner.as_ref()).await.map(Some);
            }
        }
        Ok(None)
    }

    /// Run a command; a non-zero exit fails the step. Returns stdout.
    async fn run_command(&self, stage: Stage, cmd: &CommandSpec) -> Result<String> {
        let output = self
            .runner
            .run(cmd)
            .await
            .map_err(|e| step_failed(stage, e))?;
        if !output.passed() {
            return Err(step_failed(
                stage,
                CollaboratorError::Exited {
                    program: cmd.display(),
                    code: Some(output.exit_code),
                    stderr: stderr_tail(&output.stderr),
                },
            ));
        }
        Ok(output.stdout)
    }
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
