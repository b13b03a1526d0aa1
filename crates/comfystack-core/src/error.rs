//! Error types for comfystack-core

use crate::stage::Stage;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a successful run.
pub const EXIT_OK: i32 = 0;
/// Exit code when the target root is unusable or a required runtime is missing.
pub const EXIT_STRUCTURAL: i32 = 1;
/// Exit code for an illegal flag value or combination.
pub const EXIT_INVALID_CONFIGURATION: i32 = 2;
/// Exit code for a fatal step failure that carried no usable collaborator code.
pub const EXIT_STEP_FAILED: i32 = 3;

/// Errors that abort a provisioning run
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Target root cannot be used at all
    #[error("Target path {path:?} is unusable: {reason}")]
    Structural { path: PathBuf, reason: String },

    /// Illegal flag value or combination
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A host runtime or tool a planned stage depends on is not available
    #[error("Required runtime missing: {0}")]
    RuntimeMissing(String),

    /// A fatal step failed
    #[error("Stage {stage} failed: {reason}")]
    StepFailed {
        stage: Stage,
        reason: String,
        exit_code: Option<i32>,
    },

    /// Something already listens on the launch address
    #[error("Port already in use: {addr}")]
    PortInUse { addr: SocketAddr },

    /// The launched process died before it was confirmed
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// Configuration file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),
}

impl ProvisionError {
    /// Process exit code for this error.
    ///
    /// Collaborator exit codes are propagated unless they collide with the
    /// reserved codes 0..=2.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::Structural { .. } | ProvisionError::RuntimeMissing(_) => {
                EXIT_STRUCTURAL
            }
            ProvisionError::InvalidConfiguration(_) | ProvisionError::Config(_) => {
                EXIT_INVALID_CONFIGURATION
            }
            ProvisionError::StepFailed {
                exit_code: Some(code),
                ..
            } if *code > EXIT_INVALID_CONFIGURATION && *code <= 255 => *code,
            _ => EXIT_STEP_FAILED,
        }
    }
}

/// Failures reported by external collaborators (package manager, git,
/// download client, spawned process). They are never interpreted beyond
/// this classification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The program could not be started
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The program ran and exited unsuccessfully
    #[error("{program} exited with code {code:?}: {stderr}")]
    Exited {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The program did not finish in time
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    /// HTTP transfer failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Local filesystem failure while applying an action
    #[error("IO error: {0}")]
    Io(String),
}

impl CollaboratorError {
    /// Exit code reported by the collaborator, if it got that far.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CollaboratorError::Exited { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        CollaboratorError::Http(err.to_string())
    }
}

impl From<std::io::Error> for CollaboratorError {
    fn from(err: std::io::Error) -> Self {
        CollaboratorError::Io(err.to_string())
    }
}

/// Result alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;
