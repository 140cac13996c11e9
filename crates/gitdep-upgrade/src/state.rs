use std::fmt;

use thiserror::Error;

/// Where an upgrade transaction currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    Idle,
    Snapshotted,
    MigrationRunning,
    MigrationDone,
    VerifyRunning,
    VerifyDone,
    Committed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl UpgradeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Snapshotted => "snapshotted",
            Self::MigrationRunning => "migration_running",
            Self::MigrationDone => "migration_done",
            Self::VerifyRunning => "verify_running",
            Self::VerifyDone => "verify_done",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::RollbackFailed)
    }

    /// Skipped steps go straight to their `*Done` state.
    pub fn can_transition_to(self, next: Self) -> bool {
        use UpgradeState::*;

        match (self, next) {
            (Idle, Snapshotted) => true,
            (Snapshotted, MigrationRunning | MigrationDone) => true,
            (MigrationRunning, MigrationDone) => true,
            (MigrationDone, VerifyRunning | VerifyDone) => true,
            (VerifyRunning, VerifyDone) => true,
            (VerifyDone, Committed) => true,
            (RollingBack, RolledBack | RollbackFailed) => true,
            (current, RollingBack) => !matches!(current, Idle | RollingBack) && !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid upgrade transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: UpgradeState,
    pub to: UpgradeState,
}

/// Tracks the current state and every state visited so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeMachine {
    state: UpgradeState,
    history: Vec<UpgradeState>,
}

impl Default for UpgradeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeMachine {
    pub fn new() -> Self {
        Self {
            state: UpgradeState::Idle,
            history: vec![UpgradeState::Idle],
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    pub fn history(&self) -> &[UpgradeState] {
        &self.history
    }

    pub fn advance(&mut self, next: UpgradeState) -> Result<UpgradeState, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        self.history.push(next);
        Ok(previous)
    }
}
