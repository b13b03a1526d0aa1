//! Step planner: turns a request and a probe snapshot into ordered steps.
//!
//! Planning is pure. The same request against the same probe result always
//! yields the same plan, and a plan built right after a successful run has
//! no pending provisioning steps.

use crate::catalog::{Accelerator, ModelGroup};
use crate::config::StackConfig;
use crate::error::{ProvisionError, Result};
use crate::layout::StackLayout;
use crate::probe::{Artifact, ArtifactStatus, ProbeResult};
use crate::request::{Operation, ProvisionMode, ProvisioningRequest};
use crate::stage::{Action, AssetSpec, CommandSpec, Decision, LaunchSpec, Stage, Step};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

/// Ordered steps for one run
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PlanResult {
    steps: Vec<Step>,
}

impl PlanResult {
    /// Wrap pre-built steps, ordered by stage.
    pub fn from_steps(mut steps: Vec<Step>) -> Self {
        steps.sort_by_key(|s| s.stage);
        PlanResult { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Steps that will execute.
    pub fn pending(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_pending())
    }

    pub fn step(&self, stage: Stage) -> Option<&Step> {
        self.steps.iter().find(|s| s.stage == stage)
    }

    /// Stages that will execute, in order.
    pub fn pending_stages(&self) -> Vec<Stage> {
        self.pending().map(|s| s.stage).collect()
    }

    /// No provisioning work left. Launch never counts.
    pub fn is_converged(&self) -> bool {
        self.pending().all(|s| s.stage == Stage::Launch)
    }
}

/// Builds plans against a stack configuration.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    config: StackConfig,
}

fn python(path: &Path) -> String {
    path.display().to_string()
}

fn status_decision(status: ArtifactStatus, mode: ProvisionMode, valid_reason: &str) -> Decision {
    match (status, mode) {
        (ArtifactStatus::Valid, ProvisionMode::Fresh) => Decision::Refresh,
        (ArtifactStatus::Valid, _) => Decision::Skip {
            reason: valid_reason.to_string(),
        },
        (ArtifactStatus::Stale, _) => Decision::Repair {
            reason: "existing artifact is incomplete or outdated".to_string(),
        },
        (ArtifactStatus::Absent, _) => Decision::Fresh,
    }
}

/// Upgrade a skip to a repair when an upstream stage is re-provisioned.
fn cascade(decision: Decision, upstream: Option<Stage>) -> Decision {
    match (decision, upstream) {
        (Decision::Skip { .. }, Some(stage)) => Decision::Repair {
            reason: format!("{stage} stage is being re-provisioned"),
        },
        (decision, _) => decision,
    }
}

impl Planner {
    pub fn new(config: StackConfig) -> Self {
        Planner { config }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Plan the run. Validation happens before anything else is looked at.
    pub fn plan(&self, request: &ProvisioningRequest, probe: &ProbeResult) -> Result<PlanResult> {
        request.validate()?;
        let layout = StackLayout::new(request.root());
        let mut steps = Vec::new();

        if request.operation() == Operation::Install {
            let accelerator = request.accelerator().ok_or_else(|| {
                ProvisionError::InvalidConfiguration("install requires --accelerator".to_string())
            })?;
            self.plan_install(request, probe, &layout, accelerator, &mut steps)?;
        }

        if matches!(request.operation(), Operation::Install | Operation::Models)
            && request.models().is_some()
        {
            steps.push(self.plan_models(request, probe, &layout));
        }

        if request.operation() == Operation::Start
            || (request.operation() == Operation::Install && request.auto_start())
        {
            steps.push(self.plan_launch(request, probe, &layout, &steps)?);
        }

        Ok(PlanResult { steps })
    }

    fn plan_install(
        &self,
        request: &ProvisioningRequest,
        probe: &ProbeResult,
        layout: &StackLayout,
        accelerator: Accelerator,
        steps: &mut Vec<Step>,
    ) -> Result<()> {
        let mode = request.mode();
        let venv_python = layout.venv_python();

        // environment
        let env_status = probe.status(Artifact::Environment);
        let env_decision = if mode == ProvisionMode::Reuse && env_status == ArtifactStatus::Stale {
            Decision::Skip {
                reason: "reusing existing environment".to_string(),
            }
        } else {
            status_decision(env_status, mode, "environment present")
        };
        let env_runs = !env_decision.is_skip();
        if env_runs {
            let runtime = probe.runtime().ok_or_else(|| {
                ProvisionError::RuntimeMissing(match request.python() {
                    Some(version) => format!("python {version} not found on PATH"),
                    None => "no python interpreter found on PATH".to_string(),
                })
            })?;
            let mut actions = Vec::new();
            if env_status != ArtifactStatus::Absent {
                actions.push(Action::RemoveDir {
                    path: layout.venv(),
                });
            }
            let mut args = probe.runtime_args().to_vec();
            args.extend(["-m".to_string(), "venv".to_string(), python(&layout.venv())]);
            actions.push(Action::Run(CommandSpec::new(python(runtime), args)));
            steps.push(Step::run(Stage::Environment, env_decision, actions));
        } else {
            steps.push(Step {
                decision: env_decision,
                ..Step::skipped(Stage::Environment, "")
            });
        }

        // dependencies
        let deps_decision = cascade(
            status_decision(
                probe.status(Artifact::Manifest),
                mode,
                "runtime packages match accelerator",
            ),
            env_runs.then_some(Stage::Environment),
        );
        let deps_runs = !deps_decision.is_skip();
        steps.push(if deps_runs {
            let py = python(&venv_python);
            Step::run(
                Stage::Dependencies,
                deps_decision,
                vec![
                    Action::Run(CommandSpec::new(
                        py.clone(),
                        ["-m", "pip", "install", "--upgrade", "pip", "setuptools", "wheel"],
                    )),
                    Action::Run(CommandSpec::new(
                        py,
                        [
                            "-m".to_string(),
                            "pip".to_string(),
                            "install".to_string(),
                            "torch".to_string(),
                            "torchvision".to_string(),
                            "torchaudio".to_string(),
                            "--index-url".to_string(),
                            accelerator.index_url(),
                        ],
                    )),
                    Action::RecordManifest {
                        interpreter: venv_python.clone(),
                        manifest: layout.manifest(),
                        accelerator,
                        requirements: None,
                    },
                ],
            )
        } else {
            Step {
                decision: deps_decision,
                ..Step::skipped(Stage::Dependencies, "")
            }
        });

        // checkout
        let checkout_decision =
            status_decision(probe.status(Artifact::Checkout), mode, "checkout present");
        let checkout_runs = !checkout_decision.is_skip();
        steps.push(if checkout_runs {
            self.require_git(probe)?;
            let actions = self.checkout_actions(&checkout_decision, probe, layout);
            Step::run(Stage::Checkout, checkout_decision, actions)
        } else {
            Step {
                decision: checkout_decision,
                ..Step::skipped(Stage::Checkout, "")
            }
        });

        // requirements
        let upstream = if env_runs {
            Some(Stage::Environment)
        } else if deps_runs {
            Some(Stage::Dependencies)
        } else if checkout_runs {
            Some(Stage::Checkout)
        } else {
            None
        };
        let req_decision = cascade(
            status_decision(
                probe.status(Artifact::Requirements),
                mode,
                "application requirements installed",
            ),
            upstream,
        );
        steps.push(if req_decision.is_skip() {
            Step {
                decision: req_decision,
                ..Step::skipped(Stage::Requirements, "")
            }
        } else {
            Step::run(
                Stage::Requirements,
                req_decision,
                vec![
                    Action::Run(
                        CommandSpec::new(
                            python(&venv_python),
                            [
                                "-m".to_string(),
                                "pip".to_string(),
                                "install".to_string(),
                                "-r".to_string(),
                                python(&layout.requirements()),
                            ],
                        )
                        .in_dir(layout.app()),
                    ),
                    Action::RecordManifest {
                        interpreter: venv_python.clone(),
                        manifest: layout.manifest(),
                        accelerator,
                        requirements: Some(layout.requirements()),
                    },
                ],
            )
        });

        // extension
        if request.with_extension() {
            let status = probe.status(Artifact::Extension);
            let decision = status_decision(status, mode, "extension present");
            steps.push(if decision.is_skip() {
                Step {
                    decision,
                    ..Step::skipped(Stage::Extension, "")
                }
            } else {
                self.require_git(probe)?;
                let dest = layout.extension();
                let actions = match status {
                    ArtifactStatus::Valid => vec![Action::Run(
                        CommandSpec::new("git", ["pull", "--ff-only", "origin", "HEAD"])
                            .in_dir(&dest),
                    )],
                    ArtifactStatus::Stale => vec![
                        Action::RemoveDir { path: dest.clone() },
                        self.clone_action(&self.config.extension_repo_url, &dest),
                    ],
                    ArtifactStatus::Absent => {
                        vec![self.clone_action(&self.config.extension_repo_url, &dest)]
                    }
                };
                Step::run(Stage::Extension, decision, actions)
            });
        }

        Ok(())
    }

    fn clone_action(&self, url: &str, dest: &Path) -> Action {
        Action::Run(CommandSpec::new(
            "git",
            ["clone".to_string(), url.to_string(), python(dest)],
        ))
    }

    fn checkout_actions(
        &self,
        decision: &Decision,
        probe: &ProbeResult,
        layout: &StackLayout,
    ) -> Vec<Action> {
        let app = layout.app();
        let git = |args: &[&str]| {
            Action::Run(CommandSpec::new("git", args.iter().copied()).in_dir(&app))
        };
        let url = self.config.app_repo_url.as_str();
        match decision {
            Decision::Fresh => vec![self.clone_action(url, &app)],
            // No resolvable HEAD: models fetched before install, or an
            // adoption cut short. Adopt in place so downloads survive; every
            // command here is safe to repeat.
            _ if !probe.checkout_is_repository() => vec![
                git(&["init"]),
                git(&["fetch", url, "HEAD"]),
                git(&["reset", "--hard", "FETCH_HEAD"]),
            ],
            Decision::Refresh => vec![git(&["pull", "--ff-only", url, "HEAD"])],
            _ => vec![git(&["reset", "--hard", "HEAD"])],
        }
    }

    fn require_git(&self, probe: &ProbeResult) -> Result<()> {
        if probe.git().is_none() {
            return Err(ProvisionError::RuntimeMissing(
                "git not found on PATH".to_string(),
            ));
        }
        Ok(())
    }

    fn plan_models(
        &self,
        request: &ProvisioningRequest,
        probe: &ProbeResult,
        layout: &StackLayout,
    ) -> Step {
        let Some(set) = request.models() else {
            return Step::skipped(Stage::Models, "no model set requested");
        };
        let forced = request.mode() == ProvisionMode::Fresh;

        let mut assets = Vec::new();
        for group in ModelGroup::ALL {
            let files: Vec<String> = if forced {
                set.files(group).into_iter().map(str::to_string).collect()
            } else {
                probe.missing_assets(group).to_vec()
            };
            for repo_path in files {
                assets.push(Action::Download(AssetSpec {
                    group,
                    url: self.config.asset_url(&repo_path),
                    dest: layout.model_file(group, &repo_path),
                    repo_path,
                }));
            }
        }

        if assets.is_empty() {
            return Step::skipped(Stage::Models, format!("all {} model files present", set.name()));
        }

        let statuses: Vec<ArtifactStatus> = ModelGroup::ALL
            .into_iter()
            .map(|g| probe.status(Artifact::Models(g)))
            .collect();
        let decision = if forced {
            Decision::Refresh
        } else if statuses.iter().all(|s| *s == ArtifactStatus::Absent) {
            Decision::Fresh
        } else {
            Decision::Repair {
                reason: format!("{} model files missing", assets.len()),
            }
        };
        Step::run(Stage::Models, decision, assets)
    }

    fn plan_launch(
        &self,
        request: &ProvisioningRequest,
        probe: &ProbeResult,
        layout: &StackLayout,
        planned: &[Step],
    ) -> Result<Step> {
        let ready = |stage: Stage, artifact: Artifact| {
            probe.status(artifact) == ArtifactStatus::Valid
                || planned.iter().any(|s| s.stage == stage && s.is_pending())
        };
        if !ready(Stage::Environment, Artifact::Environment) {
            return Err(ProvisionError::RuntimeMissing(format!(
                "no usable environment at {}; run install first",
                layout.venv().display()
            )));
        }
        if !ready(Stage::Checkout, Artifact::Checkout) {
            return Err(ProvisionError::RuntimeMissing(format!(
                "no application checkout at {}; run install first",
                layout.app().display()
            )));
        }

        let ip = if request.bind_all() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        let addr = SocketAddr::new(ip, request.port());
        let spec = LaunchSpec {
            program: layout.venv_python(),
            args: vec![
                crate::layout::CHECKOUT_MARKER.to_string(),
                "--listen".to_string(),
                ip.to_string(),
                "--port".to_string(),
                request.port().to_string(),
            ],
            cwd: layout.app(),
            addr,
            log: layout.launch_log(),
            grace_ms: self.config.launch_grace_ms,
        };
        Ok(Step::run(Stage::Launch, Decision::Always, vec![Action::Launch(spec)]))
    }
}

/// Plan with the default configuration.
pub fn plan(request: &ProvisioningRequest, probe: &ProbeResult) -> Result<PlanResult> {
    Planner::default().plan(request, probe)
}
