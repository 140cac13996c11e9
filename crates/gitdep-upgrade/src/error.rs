use std::path::PathBuf;

use gitdep_exec::{ExecError, ProcessOutput};
use gitdep_state::{ClaimError, SnapshotId};
use thiserror::Error;

use crate::{InvalidTransition, Step};

/// Exit code for invalid input or configuration.
pub const EXIT_VALIDATION: i32 = 2;
/// Exit code when a failed upgrade could not be rolled back.
pub const EXIT_ROLLBACK_FAILED: i32 = 3;

/// A migration or verify command that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: Step,
    pub command: String,
    /// Set when the command ran to completion with a non-zero status.
    pub exit_code: Option<i32>,
    /// Set when the command could not run to completion.
    pub error: Option<ExecError>,
    pub output: ProcessOutput,
    pub log_path: Option<PathBuf>,
}

impl StepFailure {
    pub fn reason(&self) -> String {
        match (&self.error, self.exit_code) {
            (Some(error), _) => error.to_string(),
            (None, Some(code)) => format!("exited with status {code}"),
            (None, None) => "failed".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("{0:#}")]
    Validation(anyhow::Error),
    #[error("failed resolving upstream: {0:#}")]
    Resolve(anyhow::Error),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error("failed to snapshot project state: {0:#}")]
    Snapshot(anyhow::Error),
    /// The step failed and the snapshot was restored.
    #[error("{} command '{}' {}", .0.step, .0.command, .0.reason())]
    Step(Box<StepFailure>),
    /// Writing the new lock entry failed and the snapshot was restored.
    #[error("failed to commit lock file: {0:#}")]
    Commit(anyhow::Error),
    #[error(
        "ROLLBACK FAILED for '{dependency}' after: {cause}; restore error: {restore:#}; project state may be inconsistent (snapshot {})",
        .snapshot.as_ref().map(SnapshotId::as_str).unwrap_or("none")
    )]
    RollbackFailed {
        dependency: String,
        cause: Box<UpgradeError>,
        restore: anyhow::Error,
        snapshot: Option<SnapshotId>,
    },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpgradeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => EXIT_VALIDATION,
            Self::RollbackFailed { .. } => EXIT_ROLLBACK_FAILED,
            _ => 1,
        }
    }

    /// True when the project was changed and then restored.
    pub fn rolled_back(&self) -> bool {
        matches!(self, Self::Step(_) | Self::Commit(_))
    }

    pub fn step_failure(&self) -> Option<&StepFailure> {
        match self {
            Self::Step(failure) => Some(failure),
            Self::RollbackFailed { cause, .. } => cause.step_failure(),
            _ => None,
        }
    }
}
