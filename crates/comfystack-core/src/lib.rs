//! ComfyStack Core Library
//!
//! Idempotent provisioning of a ComfyUI + Wan 2.2 stack under one root
//! directory. A run flows through four components, each consuming only the
//! previous one's output:
//!
//! - [`probe`](mod@probe): inspect the root and classify every artifact
//! - [`plan`](mod@plan): decide per stage whether to skip, create or repair
//! - [`executor`]: apply the plan through injected collaborators
//! - [`launcher`]: optionally start the application detached
//!
//! External systems (package manager, git, downloads, process spawning,
//! filesystem inspection) sit behind the traits in [`collaborators`] and
//! [`fs`], with in-memory doubles in [`fakes`].

pub mod catalog;
pub mod collaborators;
pub mod config;
mod error;
pub mod executor;
pub mod fakes;
pub mod fetch;
pub mod fs;
pub mod launcher;
pub mod layout;
pub mod manifest;
pub mod plan;
pub mod probe;
pub mod report;
pub mod request;
pub mod runner;
pub mod stage;
pub mod telemetry;

pub use catalog::{Accelerator, ModelGroup, ModelSet};
pub use collaborators::{
    AssetFetcher, ChildState, CommandOutput, CommandRunner, ProcessSpawner, SpawnedChild,
};
pub use config::StackConfig;
pub use error::{
    CollaboratorError, ProvisionError, Result, EXIT_INVALID_CONFIGURATION, EXIT_OK,
    EXIT_STEP_FAILED, EXIT_STRUCTURAL,
};
pub use executor::Executor;
pub use fetch::HttpFetcher;
pub use fs::{LocalFs, PathInspector, PathKind};
pub use launcher::{launch, DetachedSpawner, LaunchOutcome};
pub use layout::StackLayout;
pub use plan::{plan, PlanResult, Planner};
pub use probe::{probe, Artifact, ArtifactStatus, ProbeResult, Prober};
pub use report::{ExecutionReport, OutcomeStatus, StepOutcome};
pub use request::{Operation, ProvisionMode, ProvisioningRequest, RequestBuilder, SecretToken};
pub use runner::ProcessRunner;
pub use stage::{Action, Criticality, Decision, Stage, Step};
pub use telemetry::init_tracing;
