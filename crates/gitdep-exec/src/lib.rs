//! Runs shell commands with streamed output, timeouts and cancellation.
//!
//! Each execution uses two reader threads and one monitor thread that report
//! over an `mpsc` channel, so callers can stay single-threaded.

mod config;
mod engine;
mod event;
mod output;
mod terminate;

pub use config::{parse_timeout, resolve_timeout, ProcessConfig, TIMEOUT_ENV};
pub use engine::{spawn, ProcessHandle};
pub use event::{ExecError, OutputLine, OutputStream, ProcessEvent};
pub use output::{run, wait_with_output, FailedRun, ProcessOutput};
pub use terminate::kill_process_tree;
