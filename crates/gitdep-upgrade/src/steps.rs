use std::path::Path;
use std::time::Duration;

use gitdep_core::{Command, CommitId};
use gitdep_exec::{spawn, wait_with_output, ProcessConfig};
use gitdep_registry::ProcessRegistry;
use gitdep_state::ProjectLayout;
use tracing::info;

use crate::{Step, StepFailure, StepReport, UpgradeObserver};

pub const ENV_DEPENDENCY: &str = "GITDEP_DEPENDENCY";
pub const ENV_FROM_REF: &str = "GITDEP_FROM_REF";
pub const ENV_TO_REF: &str = "GITDEP_TO_REF";
pub const ENV_TO_COMMIT: &str = "GITDEP_TO_COMMIT";
pub const ENV_SOURCE_DIR: &str = "GITDEP_SOURCE_DIR";

pub(crate) struct StepContext<'a> {
    pub layout: &'a ProjectLayout,
    pub registry: Option<&'a ProcessRegistry>,
    pub dependency: &'a str,
    pub txid: &'a str,
    pub from_ref: Option<&'a str>,
    pub to_ref: &'a str,
    pub commit: &'a CommitId,
    pub checkout: Option<&'a Path>,
    pub timeout: Option<Duration>,
}

impl StepContext<'_> {
    fn process_config(&self, step: Step, command: &Command) -> ProcessConfig {
        let working_dir = match &command.working_dir {
            Some(dir) => self.layout.root().join(dir),
            None => self.layout.root().to_path_buf(),
        };
        let log_label = match step {
            Step::Run => format!("run-{}", command.name),
            other => other.as_str().to_string(),
        };

        let mut config = ProcessConfig::new(command.run.clone(), working_dir)
            .with_envs(&command.env)
            .with_env(ENV_DEPENDENCY, self.dependency)
            .with_env(ENV_FROM_REF, self.from_ref.unwrap_or_default())
            .with_env(ENV_TO_REF, self.to_ref)
            .with_env(ENV_TO_COMMIT, self.commit.as_str())
            .with_log_file(
                self.layout
                    .step_log_path(self.dependency, self.txid, &log_label),
            )
            .with_timeout(self.timeout)
            .with_repo(self.layout.root());
        if let Some(checkout) = self.checkout {
            config = config.with_env(ENV_SOURCE_DIR, checkout.to_string_lossy());
        }
        config
    }
}

/// Runs one declared command through the engine and registry. A command
/// that exits, even unsuccessfully, produces a report; one that could not
/// run to completion produces a failure.
pub(crate) fn execute_step(
    ctx: &StepContext<'_>,
    step: Step,
    command: &Command,
    observer: &mut dyn UpgradeObserver,
) -> Result<StepReport, StepFailure> {
    let config = ctx.process_config(step, command);
    let log_path = config.log_file.clone();
    info!(
        dependency = ctx.dependency,
        txid = ctx.txid,
        step = %step,
        command = %command.name,
        "running {step} command"
    );

    let (handle, events) = spawn(&config, ctx.registry).map_err(|error| StepFailure {
        step,
        command: command.name.clone(),
        exit_code: None,
        error: Some(error),
        output: Default::default(),
        log_path: log_path.clone(),
    })?;
    observer.on_step_started(step, command, handle.pid());

    let result = wait_with_output(events, |line| observer.on_output(step, line));
    drop(handle);

    match result {
        Ok(output) => Ok(StepReport {
            step,
            command: command.name.clone(),
            exit_code: output.exit_code.unwrap_or(-1),
            log_path: log_path.unwrap_or_default(),
            output,
        }),
        Err(failed) => Err(StepFailure {
            step,
            command: command.name.clone(),
            exit_code: None,
            error: Some(failed.error),
            output: failed.partial,
            log_path,
        }),
    }
}

impl From<StepReport> for StepFailure {
    fn from(report: StepReport) -> Self {
        Self {
            step: report.step,
            command: report.command,
            exit_code: Some(report.exit_code),
            error: None,
            output: report.output,
            log_path: Some(report.log_path),
        }
    }
}
