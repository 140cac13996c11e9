use std::path::PathBuf;
use std::time::Duration;

use gitdep_core::{Change, Command, CommitId, LockEntry};
use gitdep_exec::ProcessOutput;
use gitdep_state::{SnapshotId, UpgradeClaim};

use crate::{Step, UpgradeState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub dependency: String,
    pub to_ref: String,
    /// Overrides the source from `gitdep.toml` and the lock file.
    pub source: Option<String>,
    pub skip_migration: bool,
    pub skip_verify: bool,
    pub timeout: Option<Duration>,
}

impl UpgradeRequest {
    pub fn new(dependency: impl Into<String>, to_ref: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            to_ref: to_ref.into(),
            source: None,
            skip_migration: false,
            skip_verify: false,
            timeout: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn skip_migration(mut self, skip: bool) -> Self {
        self.skip_migration = skip;
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub dependency: String,
    pub to_ref: String,
    pub source: Option<String>,
}

impl ApplyRequest {
    pub fn new(dependency: impl Into<String>, to_ref: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            to_ref: to_ref.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// One command that ran to completion, whatever its exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: Step,
    pub command: String,
    pub exit_code: i32,
    pub log_path: PathBuf,
    pub output: ProcessOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOutcome {
    pub dependency: String,
    pub txid: String,
    pub previous: Option<LockEntry>,
    pub entry: LockEntry,
    pub steps: Vec<StepReport>,
    pub history: Vec<UpgradeState>,
}

/// What `upgrade` would do, computed without running or writing anything.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradePlan {
    pub dependency: String,
    pub source: String,
    pub previous: Option<LockEntry>,
    pub to_ref: String,
    pub commit: CommitId,
    pub change: Option<Change>,
    pub migration: Option<Command>,
    pub verify: Option<Command>,
    /// Commands the change declares but the request skips.
    pub skipped: Vec<(Step, String)>,
    pub transitions: Vec<UpgradeState>,
    /// A claim that would currently refuse the upgrade.
    pub blocked_by: Option<UpgradeClaim>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    pub claim: Option<UpgradeClaim>,
    pub restored: Option<SnapshotId>,
}
