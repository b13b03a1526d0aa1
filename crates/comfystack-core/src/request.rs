//! The immutable provisioning request threaded through every component.

use crate::catalog::{Accelerator, ModelSet};
use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default application port.
pub const DEFAULT_PORT: u16 = 8188;

/// Which CLI operation the request was built for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Full install: every stage the flags ask for
    Install,
    /// Model asset stage only
    Models,
    /// Launch stage only
    Start,
    /// Probe only, nothing is planned
    Status,
}

/// How existing artifacts are treated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionMode {
    /// Skip valid artifacts, repair stale ones, create absent ones
    #[default]
    Repair,
    /// Like `Repair`, but an existing environment is kept even when stale
    Reuse,
    /// Re-run every requested stage regardless of artifact state
    Fresh,
}

impl ProvisionMode {
    /// Resolve the `--force` / `--reuse-environment` flag pair.
    pub fn from_flags(force: bool, reuse_environment: bool) -> Result<Self> {
        match (force, reuse_environment) {
            (true, true) => Err(ProvisionError::InvalidConfiguration(
                "--force and --reuse-environment are mutually exclusive".to_string(),
            )),
            (true, false) => Ok(ProvisionMode::Fresh),
            (false, true) => Ok(ProvisionMode::Reuse),
            (false, false) => Ok(ProvisionMode::Repair),
        }
    }
}

/// Credential handed only to the asset fetcher. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(SecretToken(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(***)")
    }
}

/// Everything one invocation asked for. Built once by [`RequestBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    operation: Operation,
    root: PathBuf,
    accelerator: Option<Accelerator>,
    models: Option<ModelSet>,
    port: u16,
    with_extension: bool,
    auto_start: bool,
    bind_all: bool,
    mode: ProvisionMode,
    dry_run: bool,
    python: Option<String>,
    token: Option<SecretToken>,
}

impl ProvisioningRequest {
    pub fn builder(operation: Operation, root: impl Into<PathBuf>) -> RequestBuilder {
        RequestBuilder::new(operation, root)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn accelerator(&self) -> Option<Accelerator> {
        self.accelerator
    }

    pub fn models(&self) -> Option<ModelSet> {
        self.models
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn with_extension(&self) -> bool {
        self.with_extension
    }

    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    pub fn bind_all(&self) -> bool {
        self.bind_all
    }

    pub fn mode(&self) -> ProvisionMode {
        self.mode
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Interpreter version that creates the environment, e.g. `3.11`.
    pub fn python(&self) -> Option<&str> {
        self.python.as_deref()
    }

    pub fn token(&self) -> Option<&SecretToken> {
        self.token.as_ref()
    }

    /// Check legality of the flag combination for this operation.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ProvisionError::InvalidConfiguration(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        if self.root.as_os_str().is_empty() {
            return Err(ProvisionError::InvalidConfiguration(
                "target path must not be empty".to_string(),
            ));
        }
        if let Some(version) = &self.python {
            if !is_python_version(version) {
                return Err(ProvisionError::InvalidConfiguration(format!(
                    "invalid python version '{version}', expected e.g. 3.11"
                )));
            }
        }
        match self.operation {
            Operation::Install if self.accelerator.is_none() => Err(
                ProvisionError::InvalidConfiguration("install requires --accelerator".to_string()),
            ),
            Operation::Models if self.models.is_none() => Err(
                ProvisionError::InvalidConfiguration("models requires --models".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Collects raw flag values and validates them into a request.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    operation: Operation,
    root: PathBuf,
    accelerator: Option<String>,
    models: Option<String>,
    port: u16,
    with_extension: bool,
    auto_start: bool,
    bind_all: bool,
    force: bool,
    reuse_environment: bool,
    dry_run: bool,
    python: Option<String>,
    token: Option<String>,
}

impl RequestBuilder {
    pub fn new(operation: Operation, root: impl Into<PathBuf>) -> Self {
        RequestBuilder {
            operation,
            root: root.into(),
            accelerator: None,
            models: None,
            port: DEFAULT_PORT,
            with_extension: false,
            auto_start: false,
            bind_all: false,
            force: false,
            reuse_environment: false,
            dry_run: false,
            python: None,
            token: None,
        }
    }

    pub fn accelerator(mut self, value: impl Into<String>) -> Self {
        self.accelerator = Some(value.into());
        self
    }

    pub fn models(mut self, value: impl Into<String>) -> Self {
        self.models = Some(value.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_extension(mut self, yes: bool) -> Self {
        self.with_extension = yes;
        self
    }

    pub fn auto_start(mut self, yes: bool) -> Self {
        self.auto_start = yes;
        self
    }

    pub fn bind_all(mut self, yes: bool) -> Self {
        self.bind_all = yes;
        self
    }

    pub fn force(mut self, yes: bool) -> Self {
        self.force = yes;
        self
    }

    pub fn reuse_environment(mut self, yes: bool) -> Self {
        self.reuse_environment = yes;
        self
    }

    pub fn dry_run(mut self, yes: bool) -> Self {
        self.dry_run = yes;
        self
    }

    pub fn python(mut self, version: impl Into<String>) -> Self {
        self.python = Some(version.into());
        self
    }

    pub fn token(mut self, value: Option<String>) -> Self {
        self.token = value;
        self
    }

    /// Parse and validate. Fails with `InvalidConfiguration` before any
    /// filesystem access happens.
    pub fn build(self) -> Result<ProvisioningRequest> {
        let accelerator = self
            .accelerator
            .as_deref()
            .map(str::parse::<Accelerator>)
            .transpose()?;
        let models = self
            .models
            .as_deref()
            .map(str::parse::<ModelSet>)
            .transpose()?;
        let mode = ProvisionMode::from_flags(self.force, self.reuse_environment)?;

        let request = ProvisioningRequest {
            operation: self.operation,
            root: self.root,
            accelerator,
            models,
            port: self.port,
            with_extension: self.with_extension,
            auto_start: self.auto_start || self.operation == Operation::Start,
            bind_all: self.bind_all,
            mode,
            dry_run: self.dry_run,
            python: self.python,
            token: self.token.and_then(SecretToken::new),
        };
        request.validate()?;
        Ok(request)
    }
}

/// `3`, `3.11`, `3.11.9`: dot-separated numbers.
fn is_python_version(value: &str) -> bool {
    !value.is_empty()
        && value
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}
