//! Transactional dependency upgrades: claim, snapshot, migrate, verify,
//! commit, and roll back on any failure.

mod error;
mod observer;
mod orchestrator;
mod request;
mod state;
mod steps;

pub use error::{StepFailure, UpgradeError, EXIT_ROLLBACK_FAILED, EXIT_VALIDATION};
pub use observer::{NoopObserver, Step, UpgradeObserver};
pub use orchestrator::Orchestrator;
pub use request::{
    ApplyRequest, RepairOutcome, StepReport, UpgradeOutcome, UpgradePlan, UpgradeRequest,
};
pub use state::{InvalidTransition, UpgradeMachine, UpgradeState};
pub use steps::{ENV_DEPENDENCY, ENV_FROM_REF, ENV_SOURCE_DIR, ENV_TO_COMMIT, ENV_TO_REF};

#[cfg(test)]
mod tests;
