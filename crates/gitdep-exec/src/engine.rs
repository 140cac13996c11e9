use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, LineWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gitdep_core::timestamp::now_utc;
use gitdep_registry::{ProcessEntry, ProcessRegistry, ProcessStatus};
use tracing::{debug, warn};

use crate::{kill_process_tree, ExecError, OutputLine, OutputStream, ProcessConfig, ProcessEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Killed,
    Timeout(Duration),
}

struct ChildState {
    child: Child,
    /// Set once `try_wait` has reaped the shell.
    exit: Option<ExitStatus>,
}

struct Shared {
    pid: u32,
    child: Mutex<ChildState>,
    termination: Mutex<Option<Termination>>,
    /// Both output pipes reached EOF.
    output_closed: AtomicBool,
    finished: AtomicBool,
    registry: Option<ProcessRegistry>,
}

impl Shared {
    /// The one termination path, used by timeouts, `kill()` and drop.
    fn terminate(&self, reason: Termination) -> Result<(), ExecError> {
        if self.finished.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Held throughout so the monitor cannot reap the shell mid-kill.
        let mut state = lock(&self.child);
        if state.exit.is_some() {
            // The shell is gone. Its group id stays reserved only while
            // descendants live, and only they can still hold the pipes.
            if self.output_closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            match kill_process_tree(self.pid) {
                Ok(()) => {
                    self.record_termination(reason);
                    debug!(pid = self.pid, ?reason, "terminated leftover descendants");
                }
                Err(err) => debug!(pid = self.pid, "no descendants left to terminate: {err:#}"),
            }
            return Ok(());
        }

        self.record_termination(reason);
        let tree = kill_process_tree(self.pid);
        // Never blocks: `Child::kill` only sends the signal.
        let direct = state.child.kill();
        match (tree, direct) {
            (Ok(()), _) | (_, Ok(())) => {
                debug!(pid = self.pid, ?reason, "terminated process");
                Ok(())
            }
            (Err(tree_err), Err(direct_err)) => Err(ExecError::KillFailed {
                pid: self.pid,
                message: format!("{tree_err:#}; {direct_err}"),
            }),
        }
    }

    fn record_termination(&self, reason: Termination) {
        let mut termination = lock(&self.termination);
        if termination.is_none() {
            *termination = Some(reason);
        }
    }

    fn termination(&self) -> Option<Termination> {
        *lock(&self.termination)
    }

    fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        let mut state = lock(&self.child);
        if state.exit.is_none() {
            state.exit = state.child.try_wait()?;
        }
        Ok(state.exit)
    }

    fn deregister(&self) {
        if let Some(registry) = &self.registry {
            if let Err(err) = registry.deregister(self.pid) {
                warn!(pid = self.pid, "failed deregistering process: {err:#}");
            }
        }
    }

    fn record_status(&self, status: ProcessStatus) {
        if let Some(registry) = &self.registry {
            if let Err(err) = registry.update_status(self.pid, status) {
                warn!(pid = self.pid, "failed updating process status: {err:#}");
            }
        }
    }
}

/// Control over one running command.
///
/// Dropping a handle whose process is still running kills it, unless
/// [`ProcessHandle::detach`] was called.
pub struct ProcessHandle {
    shared: Arc<Shared>,
    detached: bool,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn is_running(&self) -> bool {
        !self.shared.finished.load(Ordering::SeqCst) && matches!(self.shared.try_wait(), Ok(None))
    }

    /// Terminates the process tree. Safe to call repeatedly and from any
    /// thread; the event stream still ends with exactly one terminal event.
    pub fn kill(&self) -> Result<(), ExecError> {
        self.shared.terminate(Termination::Killed)?;
        self.shared.deregister();
        Ok(())
    }

    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.detached || self.shared.finished.load(Ordering::SeqCst) {
            return;
        }
        debug!(pid = self.shared.pid, "killing abandoned process");
        if let Err(err) = self.kill() {
            warn!(pid = self.shared.pid, "failed killing abandoned process: {err}");
        }
    }
}

/// Starts `config.command` through the platform shell and returns its handle
/// together with the event stream.
pub fn spawn(
    config: &ProcessConfig,
    registry: Option<&ProcessRegistry>,
) -> Result<(ProcessHandle, Receiver<ProcessEvent>), ExecError> {
    let spawn_failed = |message: String| ExecError::SpawnFailed {
        command: config.command.clone(),
        message,
    };

    if !config.working_dir.is_dir() {
        return Err(spawn_failed(format!(
            "working directory does not exist: {}",
            config.working_dir.display()
        )));
    }
    let timeout = config
        .effective_timeout()
        .map_err(|err| spawn_failed(format!("{err:#}")))?;
    let tee = match &config.log_file {
        Some(path) => Some(Arc::new(Mutex::new(LogTee::open(path)?))),
        None => None,
    };

    let mut command = shell_command(&config.command);
    command
        .current_dir(&config.working_dir)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .spawn()
        .map_err(|err| spawn_failed(err.to_string()))?;
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    debug!(pid, command = %config.command, "spawned process");

    if let Some(registry) = registry {
        let mut entry = ProcessEntry::running(pid, config.command.clone(), now_utc());
        entry.repo = config.repo.clone();
        entry.log_path = config.log_file.clone();
        if let Err(err) = registry.register(&entry) {
            warn!(pid, "failed registering process: {err:#}");
        }
    }

    let shared = Arc::new(Shared {
        pid,
        child: Mutex::new(ChildState { child, exit: None }),
        termination: Mutex::new(None),
        output_closed: AtomicBool::new(false),
        finished: AtomicBool::new(false),
        registry: registry.cloned(),
    });

    let (sender, receiver) = mpsc::channel();
    let _ = sender.send(ProcessEvent::Started { pid });

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = stdout {
        readers.push(spawn_reader(
            stdout,
            OutputStream::Stdout,
            sender.clone(),
            tee.clone(),
        ));
    }
    if let Some(stderr) = stderr {
        readers.push(spawn_reader(
            stderr,
            OutputStream::Stderr,
            sender.clone(),
            tee.clone(),
        ));
    }

    let monitor_shared = Arc::clone(&shared);
    let started = Instant::now();
    thread::spawn(move || monitor(monitor_shared, readers, tee, sender, timeout, started));

    Ok((
        ProcessHandle {
            shared,
            detached: false,
        },
        receiver,
    ))
}

fn shell_command(script: &str) -> Command {
    #[cfg(windows)]
    {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(script);
        command
    }

    #[cfg(not(windows))]
    {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    stream: OutputStream,
    events: Sender<ProcessEvent>,
    tee: Option<Arc<Mutex<LogTee>>>,
) -> JoinHandle<Result<(), String>> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    let text = decode_line(&buf);
                    if let Some(tee) = &tee {
                        lock(tee).write_line(&text);
                    }
                    // The receiver may be gone; keep draining so the child
                    // never blocks on a full pipe.
                    let _ = events.send(ProcessEvent::OutputLine(OutputLine { text, stream }));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(format!("failed reading {stream}: {err}")),
            }
        }
    })
}

fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

fn monitor(
    shared: Arc<Shared>,
    readers: Vec<JoinHandle<Result<(), String>>>,
    tee: Option<Arc<Mutex<LogTee>>>,
    events: Sender<ProcessEvent>,
    timeout: Option<Duration>,
    started: Instant,
) {
    let mut exit_status = None;
    let mut io_errors = Vec::new();

    // Wait for the shell to exit and for both pipes to close. Grandchildren
    // can hold the pipes after the shell is gone, so the deadline and kill
    // requests stay live until the readers finish.
    loop {
        if exit_status.is_none() {
            match shared.try_wait() {
                Ok(Some(status)) => exit_status = Some(status),
                Ok(None) => {}
                Err(err) => {
                    io_errors.push(format!("failed waiting for process: {err}"));
                    if let Err(kill_err) = shared.terminate(Termination::Killed) {
                        warn!(pid = shared.pid, "{kill_err}");
                    }
                    break;
                }
            }
        }
        if readers.iter().all(JoinHandle::is_finished) {
            shared.output_closed.store(true, Ordering::SeqCst);
            if exit_status.is_some() {
                break;
            }
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit && shared.termination().is_none() {
                debug!(pid = shared.pid, ?limit, "command exceeded its timeout");
                if let Err(err) = shared.terminate(Termination::Timeout(limit)) {
                    warn!(pid = shared.pid, "failed enforcing timeout: {err}");
                }
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    for reader in readers {
        match reader.join() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => io_errors.push(message),
            Err(_) => io_errors.push("output reader thread panicked".to_string()),
        }
    }
    if let Some(tee) = tee {
        if let Some(message) = lock(&tee).finish() {
            io_errors.push(message);
        }
    }

    let terminal = match shared.termination() {
        Some(Termination::Killed) => ProcessEvent::Failed {
            error: ExecError::Killed,
        },
        Some(Termination::Timeout(limit)) => ProcessEvent::Failed {
            error: ExecError::Timeout(limit),
        },
        None if !io_errors.is_empty() => ProcessEvent::Failed {
            error: ExecError::Io(io_errors.join("; ")),
        },
        None => ProcessEvent::Completed {
            exit_code: exit_status.map(exit_code).unwrap_or(-1),
        },
    };

    match &terminal {
        ProcessEvent::Completed { exit_code: 0 }
        | ProcessEvent::Failed {
            error: ExecError::Killed,
        } => shared.deregister(),
        ProcessEvent::Completed { exit_code } => shared.record_status(ProcessStatus::Completed {
            exit_code: *exit_code,
        }),
        ProcessEvent::Failed { error } => shared.record_status(ProcessStatus::Failed {
            error: error.to_string(),
        }),
        _ => {}
    }

    debug!(pid = shared.pid, event = ?terminal, "process finished");
    shared.finished.store(true, Ordering::SeqCst);
    let _ = events.send(terminal);
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

struct LogTee {
    path: PathBuf,
    writer: Option<LineWriter<File>>,
    error: Option<String>,
}

impl LogTee {
    fn open(path: &Path) -> Result<Self, ExecError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                ExecError::Io(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                ExecError::Io(format!("failed to open log file {}: {err}", path.display()))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(LineWriter::new(file)),
            error: None,
        })
    }

    fn write_line(&mut self, text: &str) {
        let Some(writer) = &mut self.writer else {
            return;
        };
        if let Err(err) = writeln!(writer, "{text}") {
            self.error = Some(format!(
                "failed writing log file {}: {err}",
                self.path.display()
            ));
            self.writer = None;
        }
    }

    fn finish(&mut self) -> Option<String> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.flush() {
                self.error.get_or_insert_with(|| {
                    format!("failed flushing log file {}: {err}", self.path.display())
                });
            }
        }
        self.error.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
