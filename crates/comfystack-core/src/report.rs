//! Per-step outcomes and the run report.

use crate::error::{ProvisionError, EXIT_OK};
use crate::launcher::LaunchOutcome;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// What happened to one planned step.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Skipped,
    Succeeded,
    /// Best-effort step failed; the run continued
    Warned,
    Failed,
}

impl OutcomeStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            OutcomeStatus::Skipped => "-",
            OutcomeStatus::Succeeded => "✓",
            OutcomeStatus::Warned => "!",
            OutcomeStatus::Failed => "✗",
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepOutcome {
    pub stage: Stage,
    pub status: OutcomeStatus,
    /// Planner decision label
    pub decision: String,
    /// Skip reason or failure description
    pub detail: Option<String>,
    /// Exit code of the failing collaborator, when it had one
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcomes in execution order. Steps after an abort have none.
    pub outcomes: Vec<StepOutcome>,
    /// Stage whose fatal failure stopped the run
    pub aborted_at: Option<Stage>,
    pub error: Option<String>,
    pub launch: Option<LaunchOutcome>,
    exit_code: i32,
}

impl ExecutionReport {
    pub fn start() -> Self {
        ExecutionReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
            aborted_at: None,
            error: None,
            launch: None,
            exit_code: EXIT_OK,
        }
    }

    pub fn record(&mut self, outcome: StepOutcome) {
        self.outcomes.push(outcome);
    }

    /// Mark the run as stopped by `stage`.
    pub fn abort(&mut self, stage: Stage, error: &ProvisionError) {
        self.aborted_at = Some(stage);
        self.error = Some(error.to_string());
        self.exit_code = error.exit_code();
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn success(&self) -> bool {
        self.aborted_at.is_none()
    }

    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.stage == stage)
    }

    fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn succeeded_count(&self) -> usize {
        self.count(OutcomeStatus::Succeeded)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(OutcomeStatus::Skipped)
    }

    pub fn warned_count(&self) -> usize {
        self.count(OutcomeStatus::Warned)
    }

    pub fn failed_count(&self) -> usize {
        self.count(OutcomeStatus::Failed)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(stage: Stage, status: OutcomeStatus) -> StepOutcome {
        StepOutcome {
            stage,
            status,
            decision: "fresh".to_string(),
            detail: None,
            exit_code: None,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_counts() {
        let mut report = ExecutionReport::start();
        report.record(outcome(Stage::Environment, OutcomeStatus::Skipped));
        report.record(outcome(Stage::Checkout, OutcomeStatus::Succeeded));
        report.record(outcome(Stage::Extension, OutcomeStatus::Warned));
        report.finish();

        assert!(report.success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.succeeded_count(), 1);
        assert_eq!(report.warned_count(), 1);
        assert_eq!(report.failed_count(), 0);
        assert!(report.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_abort_sets_exit_code() {
        let mut report = ExecutionReport::start();
        report.record(outcome(Stage::Dependencies, OutcomeStatus::Failed));
        report.abort(
            Stage::Dependencies,
            &ProvisionError::StepFailed {
                stage: Stage::Dependencies,
                reason: "pip exited".to_string(),
                exit_code: Some(23),
            },
        );
        assert!(!report.success());
        assert_eq!(report.aborted_at, Some(Stage::Dependencies));
        assert_eq!(report.exit_code(), 23);
    }

    #[test]
    fn test_report_serializes() {
        let mut report = ExecutionReport::start();
        report.record(outcome(Stage::Models, OutcomeStatus::Succeeded));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"][0]["stage"], "models");
        assert_eq!(json["outcomes"][0]["status"], "succeeded");
        assert!(json["run_id"].is_string());
    }
}
