//! ComfyStack - idempotent installer and launcher for ComfyUI + Wan 2.2
//!
//! The `comfystack` command provisions a self-contained stack under one
//! root directory and can be re-run at any time: finished work is skipped,
//! broken artifacts are repaired.
//!
//! ## Commands
//!
//! - `install`: environment, runtime packages, checkout, extension, models
//! - `models`: download a model set only
//! - `start`: launch the application detached
//! - `status`: show what is present under the root

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfystack_core::request::DEFAULT_PORT;
use comfystack_core::{
    init_tracing, Decision, DetachedSpawner, ExecutionReport, Executor, HttpFetcher, LocalFs,
    Operation, OutcomeStatus, PlanResult, Planner, ProbeResult, Prober, ProcessRunner,
    ProvisionError, ProvisioningRequest, StackConfig, StackLayout, EXIT_OK, EXIT_STEP_FAILED,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn, Level};

#[derive(Parser)]
#[command(name = "comfystack")]
#[command(author = "ComfyStack Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Idempotent installer and launcher for ComfyUI + Wan 2.2", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON reports
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: <path>/comfystack.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct TargetArgs {
    /// Stack root directory (default: ~/ComfyStack)
    #[arg(long)]
    path: Option<PathBuf>,
}

impl TargetArgs {
    fn root(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(default_root)
    }
}

#[derive(Args, Debug, Clone, Default)]
struct TokenArgs {
    /// Hugging Face access token for gated downloads
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install or repair the full stack
    Install {
        #[command(flatten)]
        target: TargetArgs,

        /// Torch build: cpu, cu118 or cu121
        #[arg(long)]
        accelerator: String,

        /// Model set to download: 5b, 14b, i2v or all
        #[arg(long)]
        models: Option<String>,

        /// Port the application listens on
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Also install the ComfyUI-Manager extension
        #[arg(long)]
        with_extension: bool,

        /// Start the application when provisioning succeeds
        #[arg(long)]
        auto_start: bool,

        /// Listen on all interfaces instead of loopback
        #[arg(long)]
        bind_all: bool,

        /// Re-run every stage even when its artifact is valid
        #[arg(long)]
        force: bool,

        /// Keep an existing environment even when it looks broken
        #[arg(long)]
        reuse_environment: bool,

        /// Interpreter version for the environment, e.g. 3.11 (`py -3.11` on Windows)
        #[arg(long, value_name = "VERSION")]
        python: Option<String>,

        #[command(flatten)]
        token: TokenArgs,

        /// Print the plan without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Download a model set
    Models {
        #[command(flatten)]
        target: TargetArgs,

        /// Model set to download: 5b, 14b, i2v or all
        #[arg(long)]
        models: String,

        #[command(flatten)]
        token: TokenArgs,

        /// Print the plan without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Start the application detached
    Start {
        #[command(flatten)]
        target: TargetArgs,

        /// Port the application listens on
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Listen on all interfaces instead of loopback
        #[arg(long)]
        bind_all: bool,
    },

    /// Show the state of every artifact under the root
    Status {
        #[command(flatten)]
        target: TargetArgs,

        /// Check the runtime packages against this accelerator
        #[arg(long)]
        accelerator: Option<String>,

        /// Check this model set
        #[arg(long)]
        models: Option<String>,
    },
}

impl Commands {
    /// Turn parsed flags into a validated request.
    fn request(&self) -> comfystack_core::Result<ProvisioningRequest> {
        match self {
            Commands::Install {
                target,
                accelerator,
                models,
                port,
                with_extension,
                auto_start,
                bind_all,
                force,
                reuse_environment,
                python,
                token,
                dry_run,
            } => {
                let mut builder = ProvisioningRequest::builder(Operation::Install, target.root())
                    .accelerator(accelerator.as_str())
                    .port(*port)
                    .with_extension(*with_extension)
                    .auto_start(*auto_start)
                    .bind_all(*bind_all)
                    .force(*force)
                    .reuse_environment(*reuse_environment)
                    .dry_run(*dry_run)
                    .token(token.token.clone());
                if let Some(models) = models {
                    builder = builder.models(models.as_str());
                }
                if let Some(version) = python {
                    builder = builder.python(version.as_str());
                }
                builder.build()
            }
            Commands::Models {
                target,
                models,
                token,
                dry_run,
            } => ProvisioningRequest::builder(Operation::Models, target.root())
                .models(models.as_str())
                .dry_run(*dry_run)
                .token(token.token.clone())
                .build(),
            Commands::Start {
                target,
                port,
                bind_all,
            } => ProvisioningRequest::builder(Operation::Start, target.root())
                .port(*port)
                .bind_all(*bind_all)
                .build(),
            Commands::Status {
                target,
                accelerator,
                models,
            } => {
                let mut builder = ProvisioningRequest::builder(Operation::Status, target.root());
                if let Some(accelerator) = accelerator {
                    builder = builder.accelerator(accelerator.as_str());
                }
                if let Some(models) = models {
                    builder = builder.models(models.as_str());
                }
                builder.build()
            }
        }
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ComfyStack")
}

/// Exit code for an error that escaped a command.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ProvisionError>()
        .map(ProvisionError::exit_code)
        .unwrap_or(EXIT_STEP_FAILED)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("✗ {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let request = cli.command.request()?;
    debug!(operation = ?request.operation(), root = %request.root().display(), "Parsed request");

    if request.operation() == Operation::Status {
        return cmd_status(&request, cli.json);
    }
    cmd_provision(&request, cli.config.as_deref(), cli.json).await
}

async fn cmd_provision(
    request: &ProvisioningRequest,
    config_path: Option<&Path>,
    json: bool,
) -> Result<i32> {
    let config = StackConfig::load(config_path, request.root())?;
    let probe = Prober::new(&LocalFs).probe(request)?;
    let plan = Planner::new(config.clone()).plan(request, &probe)?;

    if request.operation() == Operation::Install && probe.ffmpeg().is_none() {
        warn!("ffmpeg not found on PATH; video export nodes will not work");
    }

    if request.dry_run() {
        print_plan(&plan, json)?;
        return Ok(EXIT_OK);
    }

    let fetcher = HttpFetcher::new().context("Failed to build HTTP client")?;
    let executor = Executor::new(
        Arc::new(ProcessRunner::new(config.command_timeout_secs)),
        Arc::new(fetcher),
        Arc::new(DetachedSpawner),
    );
    let report = executor.execute(&plan, request.token()).await;
    print_report(&report, json)?;
    if !json {
        if let Some(hint) = activation_hint(request, &report) {
            println!("\n{hint}");
        }
    }
    Ok(report.exit_code())
}

/// Closing line after a successful install.
fn activation_hint(request: &ProvisioningRequest, report: &ExecutionReport) -> Option<String> {
    (request.operation() == Operation::Install && report.success()).then(|| {
        format!(
            "Done. To activate the environment: {}",
            StackLayout::new(request.root()).activate_hint()
        )
    })
}

fn cmd_status(request: &ProvisioningRequest, json: bool) -> Result<i32> {
    let probe = Prober::new(&LocalFs).probe(request)?;
    print_status(request.root(), &probe, json)?;
    Ok(EXIT_OK)
}

fn print_plan(plan: &PlanResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }

    println!("Plan (dry run):");
    for step in plan.steps() {
        match &step.decision {
            Decision::Skip { reason } => println!("  - {} (skip: {})", step.stage, reason),
            Decision::Repair { reason } => println!("  • {} (repair: {})", step.stage, reason),
            decision => println!("  • {} ({})", step.stage, decision.label()),
        }
        for action in &step.actions {
            println!("      {}", action.describe());
        }
    }
    if plan.is_converged() {
        println!("\n✓ Nothing to provision");
    }
    Ok(())
}

fn print_report(report: &ExecutionReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Run ID: {}", report.run_id);
    println!(
        "Status: {}",
        if report.success() {
            "✓ PASSED"
        } else {
            "✗ FAILED"
        }
    );
    if let Some(ms) = report.duration_ms() {
        println!("Duration: {}ms", ms);
    }
    println!();

    for outcome in &report.outcomes {
        let mut line = format!(
            "  {} {} ({}",
            outcome.status.symbol(),
            outcome.stage,
            outcome.decision
        );
        if outcome.status != OutcomeStatus::Skipped {
            line.push_str(&format!(", {}ms", outcome.duration_ms));
        }
        if let Some(code) = outcome.exit_code {
            line.push_str(&format!(", exit code: {}", code));
        }
        line.push(')');
        if let Some(detail) = &outcome.detail {
            line.push_str(&format!(": {}", detail));
        }
        println!("{}", line);
    }

    println!();
    println!(
        "Summary: {} succeeded, {} skipped, {} warned, {} failed",
        report.succeeded_count(),
        report.skipped_count(),
        report.warned_count(),
        report.failed_count()
    );

    if let Some(launch) = &report.launch {
        println!(
            "\n✓ ComfyUI started (pid {}) on http://{} - log: {}",
            launch.pid,
            launch.addr,
            launch.log.display()
        );
    }
    Ok(())
}

fn print_status(root: &Path, probe: &ProbeResult, json: bool) -> Result<()> {
    let tool = |p: Option<&Path>| p.map(|p| p.display().to_string());
    if json {
        let value = json!({
            "root": root,
            "artifacts": probe.summary(),
            "tools": {
                "python": tool(probe.runtime()),
                "git": tool(probe.git()),
                "ffmpeg": tool(probe.ffmpeg()),
            },
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Stack root: {}", root.display());
    println!();
    for entry in probe.summary() {
        println!("  {:<26} {:?}", entry.artifact, entry.status);
    }
    println!();
    for (name, path) in [
        ("python", probe.runtime()),
        ("git", probe.git()),
        ("ffmpeg", probe.ffmpeg()),
    ] {
        match path {
            Some(p) => println!("  ✓ {:<8} {}", name, p.display()),
            None => println!("  ✗ {:<8} not found", name),
        }
    }
    Ok(())
}
