use std::fmt;

use gitdep_core::Command;
use gitdep_exec::OutputLine;

use crate::UpgradeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Migration,
    Verify,
    /// A command invoked directly with `gitdep run`.
    Run,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::Verify => "verify",
            Self::Run => "run",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live progress of an orchestrated operation. Every method defaults to
/// doing nothing.
pub trait UpgradeObserver {
    fn on_transition(&mut self, _from: UpgradeState, _to: UpgradeState) {}

    fn on_step_started(&mut self, _step: Step, _command: &Command, _pid: u32) {}

    fn on_output(&mut self, _step: Step, _line: &OutputLine) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl UpgradeObserver for NoopObserver {}
