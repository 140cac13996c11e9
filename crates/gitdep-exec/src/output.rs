use std::sync::mpsc::Receiver;

use gitdep_registry::ProcessRegistry;
use thiserror::Error;

use crate::{spawn, ExecError, OutputLine, OutputStream, ProcessConfig, ProcessEvent};

/// Everything a finished (or partially finished) execution printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl ProcessOutput {
    fn push(&mut self, line: &OutputLine) {
        let target = match line.stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        target.push_str(&line.text);
        target.push('\n');
    }

    /// Stdout followed by stderr, for failure reports.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&self.stderr);
        combined
    }
}

/// A run that ended in [`ExecError`], with whatever output it produced first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct FailedRun {
    pub error: ExecError,
    pub partial: ProcessOutput,
}

/// Drains `events` until the terminal event, forwarding every line to
/// `on_line` as it arrives.
///
/// A non-zero exit is a successful drain with `success == false`.
pub fn wait_with_output(
    events: Receiver<ProcessEvent>,
    mut on_line: impl FnMut(&OutputLine),
) -> Result<ProcessOutput, FailedRun> {
    let mut output = ProcessOutput::default();
    for event in events {
        match event {
            ProcessEvent::Started { pid } => output.pid = Some(pid),
            ProcessEvent::OutputLine(line) => {
                on_line(&line);
                output.push(&line);
            }
            ProcessEvent::Completed { exit_code } => {
                output.exit_code = Some(exit_code);
                output.success = exit_code == 0;
                return Ok(output);
            }
            ProcessEvent::Failed { error } => {
                return Err(FailedRun {
                    error,
                    partial: output,
                });
            }
        }
    }

    Err(FailedRun {
        error: ExecError::Io("event stream ended before the process finished".to_string()),
        partial: output,
    })
}

/// Spawns `config` and blocks until it finishes.
pub fn run(
    config: &ProcessConfig,
    registry: Option<&ProcessRegistry>,
) -> Result<ProcessOutput, FailedRun> {
    let (handle, events) = spawn(config, registry).map_err(|error| FailedRun {
        error,
        partial: ProcessOutput::default(),
    })?;
    let result = wait_with_output(events, |_| {});
    drop(handle);
    result
}
