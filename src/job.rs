//! Worker processes.
//!
//! A [`Job`] owns one spawned test executable, the read end of its output
//! pipe, its trace file and the [`OutputParser`] that turns the output into
//! results. Jobs are driven from the outside: the I/O task calls
//! [`Job::communicate`] whenever the pipe may have data, and the job reports
//! results and its own exit through the event channel it was created with.
//!
//! # Exit classification
//!
//! | Evidence | Result |
//! |----------|--------|
//! | core dump found, or sentinel file left behind | [`Verdict::Crash`] for the running test |
//! | exit code equals the tool's error exit code | one [`Verdict::ToolMetaError`] |
//! | non-zero exit code, no failed test seen | one [`Verdict::OtherError`] |
//! | non-zero exit code after failed tests | none (normal GoogleTest failure exit) |
//! | pipe read error | one [`Verdict::OtherError`] with the error text |
//!
//! Jobs that were asked to terminate never produce exit results.

pub mod command;
pub mod parser;
pub mod pipe;

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use regex::bytes::Regex;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::artifacts::{CORE_PREFIX, core_dump_path, core_file_path, sentinel_path};
use crate::results::{JobEvent, TestResultRecord, Verdict};

pub use command::WorkerCommand;
pub use parser::{OutputParser, RecordContext};
pub use pipe::{OutputPipe, PipeReadiness, ReadOutcome};

/// Maximum number of bytes consumed per [`Job::communicate`] call.
pub const READ_CHUNK: usize = 256 * 1024;

/// Time to keep reading after exit while descendants still hold the pipe.
const EXIT_LINGER: Duration = Duration::from_secs(2);

/// Errors when starting a worker.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to create trace file {}: {source}", .path.display())]
    TraceFile { path: PathBuf, source: io::Error },

    #[error("Failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub command: WorkerCommand,
    pub trace_file: PathBuf,
    pub background: bool,
    pub expected_results: u64,

    /// Executable recorded in results (not the hardlink that is started).
    pub executable: PathBuf,
    pub executable_timestamp: u64,

    /// Directory where the OS writes `core.<pid>` files.
    pub core_dir: PathBuf,
    pub tool_core_prefix: String,

    pub clean_passed: bool,
    pub clean_core: bool,
    pub seed_pattern: Option<Regex>,
}

/// Snapshot of a running worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pid: u32,
    pub trace_file: PathBuf,
    pub background: bool,
    pub bytes_read: u64,
    pub results: u64,
    pub expected_results: u64,

    /// Test currently executing, empty between tests.
    pub current_test: String,
}

/// One running worker process.
pub struct Job {
    pid: u32,
    child: Option<Child>,
    pipe: Option<OutputPipe>,
    parser: OutputParser<File>,
    buf: Box<[u8]>,

    trace_file: PathBuf,
    sentinel: PathBuf,
    background: bool,
    expected_results: u64,

    under_tool: bool,
    tool_exit_code: Option<i32>,
    core_dir: PathBuf,
    tool_core_prefix: String,
    clean_core: bool,

    terminated: bool,
    exit: Option<(ExitStatus, Instant)>,
    finished: bool,
    io_error: Option<String>,

    events: UnboundedSender<JobEvent>,
}

impl Job {
    /// Creates the trace file and starts the worker.
    ///
    /// Must be called within a tokio runtime. On failure no process is
    /// left running and the trace file is removed again.
    pub fn spawn(spec: JobSpec, events: UnboundedSender<JobEvent>) -> Result<Self, JobError> {
        let trace = File::create(&spec.trace_file).map_err(|source| JobError::TraceFile {
            path: spec.trace_file.clone(),
            source,
        })?;
        let sentinel = sentinel_path(&spec.trace_file);
        let command = spec.command.premature_exit_file(&sentinel);
        debug!("Starting worker: {}", command.to_shell_string());

        let (child, pipe) = match pipe::spawn_merged(command.to_command()) {
            Ok(spawned) => spawned,
            Err(source) => {
                drop(trace);
                let _ = fs::remove_file(&spec.trace_file);
                return Err(JobError::Spawn {
                    program: command
                        .argv()
                        .first()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    source,
                });
            }
        };
        let pid = child.id().unwrap_or(0);
        info!(
            "Started worker {} -> {}{}",
            pid,
            spec.trace_file.display(),
            if spec.background { " (background)" } else { "" }
        );

        let context = RecordContext {
            trace_file: spec.trace_file.clone(),
            executable: Some(spec.executable),
            executable_timestamp: spec.executable_timestamp,
            under_tool: command.under_tool(),
            seed_pattern: spec.seed_pattern,
        };

        Ok(Self {
            pid,
            child: Some(child),
            pipe: Some(pipe),
            parser: OutputParser::new(context, trace, spec.clean_passed),
            buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
            trace_file: spec.trace_file,
            sentinel,
            background: spec.background,
            expected_results: spec.expected_results,
            under_tool: command.under_tool(),
            tool_exit_code: command.tool_error_exit_code,
            core_dir: spec.core_dir,
            tool_core_prefix: spec.tool_core_prefix,
            clean_core: spec.clean_core,
            terminated: false,
            exit: None,
            finished: false,
            io_error: None,
            events,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn trace_file(&self) -> &Path {
        &self.trace_file
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Readiness handle of the output pipe, if it is still open.
    pub fn readiness(&self) -> Option<PipeReadiness> {
        self.pipe.as_ref().and_then(OutputPipe::readiness)
    }

    /// Whether the job needs polling because no pipe readiness will wake it.
    pub fn needs_polling(&self) -> bool {
        !self.finished && self.readiness().is_none()
    }

    /// Reads available output and checks for process exit.
    ///
    /// Never blocks. Returns false once the job has finished.
    pub fn communicate(&mut self) -> bool {
        if self.finished {
            return false;
        }

        let outcome = self.pipe.as_mut().map(|pipe| pipe.read(&mut self.buf));
        match outcome {
            Some(Ok(ReadOutcome::Data(n))) => {
                let records = self.parser.feed(&self.buf[..n]);
                self.emit(records);
                if let Some(err) = self.parser.take_write_error() {
                    self.fail_io(err);
                }
                return true;
            }
            Some(Ok(ReadOutcome::Eof)) => self.pipe = None,
            Some(Ok(ReadOutcome::WouldBlock)) | None => {}
            Some(Err(e)) => {
                self.pipe = None;
                self.fail_io(format!("Error reading pipe from test process: {}", e));
            }
        }

        let status = match self.exit {
            Some((status, _)) => status,
            None => match self.child.as_mut().map(Child::try_wait) {
                Some(Ok(Some(status))) => status,
                Some(Ok(None)) => return true,
                Some(Err(e)) => {
                    warn!("Failed to query status of worker {}: {}", self.pid, e);
                    return true;
                }
                None => return true,
            },
        };
        let seen_at = *self.exit.get_or_insert((status, Instant::now()));

        // Output written just before exit may still be in the pipe.
        if self.pipe.is_some() && seen_at.1.elapsed() < EXIT_LINGER {
            return true;
        }

        self.process_exit(status);
        false
    }

    fn fail_io(&mut self, err: String) {
        warn!("Worker {}: {}", self.pid, err);
        self.io_error.get_or_insert(err);
        self.signal(Signal::Kill);
        self.terminated = true;
    }

    fn emit(&self, records: Vec<TestResultRecord>) {
        for record in records {
            let _ = self.events.send(JobEvent::Result {
                record,
                background: self.background,
            });
        }
    }

    fn process_exit(&mut self, status: ExitStatus) {
        let code = exit_code(status);
        let aborted = fs::remove_file(&self.sentinel).is_ok();

        let disposition = if (!status.success() || aborted) && !self.terminated {
            let core_file = self.collect_core_dump();
            if core_file.is_some() || aborted {
                let record = self.parser.finish_crash(code, core_file);
                self.emit(vec![record]);
                "crashed"
            } else if self.tool_exit_code.is_some() && code == self.tool_exit_code {
                let record = self.parser.finish_tool_error();
                self.emit(vec![record]);
                "tool error"
            } else if self.parser.failures() == 0 {
                let note = format!(
                    "Exit code: {}",
                    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                );
                let record = self.parser.finish_error(&note);
                self.emit(vec![record]);
                "error"
            } else {
                self.parser.finish_clean();
                "failed"
            }
        } else if let Some(err) = self.io_error.clone() {
            let record = self.parser.finish_error(&err);
            self.emit(vec![record]);
            "I/O error"
        } else {
            self.parser.finish_clean();
            if self.terminated { "terminated" } else { "done" }
        };

        info!(
            "Worker {} exited with {} ({}), {} results",
            self.pid,
            code.map_or_else(|| "unknown status".to_string(), |c| format!("code {}", c)),
            disposition,
            self.parser.results()
        );

        self.close_trace();
        self.child = None;
        self.pipe = None;
        self.finished = true;
        let _ = self.events.send(JobEvent::Exited { pid: self.pid });
    }

    /// Moves or deletes the core dump left by this worker.
    fn collect_core_dump(&self) -> Option<PathBuf> {
        let prefix = if self.under_tool {
            self.tool_core_prefix.as_str()
        } else {
            CORE_PREFIX
        };
        let dump = core_dump_path(&self.core_dir, prefix, self.pid);
        if !dump.is_file() {
            return None;
        }
        if self.clean_core {
            if let Err(e) = fs::remove_file(&dump) {
                warn!("Failed to remove core dump {}: {}", dump.display(), e);
            }
            return None;
        }

        let target = core_file_path(&self.trace_file, prefix);
        let moved = fs::rename(&dump, &target)
            .or_else(|_| fs::copy(&dump, &target).and_then(|_| fs::remove_file(&dump)));
        match moved {
            Ok(()) => {
                debug!("Saved core dump {} as {}", dump.display(), target.display());
                Some(target)
            }
            Err(e) => {
                warn!("Failed to move core dump {}: {}", dump.display(), e);
                None
            }
        }
    }

    fn close_trace(&mut self) {
        if self.parser.is_trace_closed() {
            return;
        }
        if !self.parser.close_trace() {
            if let Err(e) = fs::remove_file(&self.trace_file) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", self.trace_file.display(), e);
                }
            }
        }
    }

    /// Asks the worker to exit.
    ///
    /// The first request sends SIGTERM, any further request or `kill`
    /// kills the process. With `kill` the job also releases its files
    /// immediately, since no exit will be processed for it.
    pub fn terminate(&mut self, kill: bool) {
        if self.finished {
            return;
        }
        if kill || self.terminated {
            self.signal(Signal::Kill);
        } else {
            self.signal(Signal::Term);
        }
        self.terminated = true;

        if kill {
            self.parser.finish_clean();
            self.close_trace();
            let _ = fs::remove_file(&self.sentinel);
            for prefix in [CORE_PREFIX, self.tool_core_prefix.as_str()] {
                let _ = fs::remove_file(core_dump_path(&self.core_dir, prefix, self.pid));
            }
            self.finished = true;
        }
    }

    /// Sends SIGABRT so the worker dumps core in the middle of its test.
    pub fn abort(&mut self) {
        if !self.finished {
            info!("Aborting worker {}", self.pid);
            self.signal(Signal::Abort);
        }
    }

    /// Signals the worker unless its exit has already been observed.
    ///
    /// Returns whether a signal was sent.
    fn signal(&mut self, signal: Signal) -> bool {
        if self.exit.is_some() {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        if signal == Signal::Kill || !cfg!(unix) {
            if let Err(e) = child.start_kill() {
                debug!("Failed to kill worker {}: {}", self.pid, e);
                return false;
            }
            return true;
        }
        send_signal(self.pid, signal)
    }

    pub fn update_cleanup_options(&mut self, clean_passed: bool, clean_core: bool) {
        self.parser.set_clean_passed(clean_passed);
        self.clean_core = clean_core;
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            pid: self.pid,
            trace_file: self.trace_file.clone(),
            background: self.background,
            bytes_read: self.parser.bytes_read(),
            results: self.parser.results(),
            expected_results: self.expected_results,
            current_test: self.parser.current_test(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Term,
    Kill,
    Abort,
}

impl Signal {
    fn name(self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Kill => "KILL",
            Signal::Abort => "ABRT",
        }
    }
}

/// Runs `kill -<SIG> <pid>`.
///
/// Inside a runtime the `kill` process is left to tokio to reap, so the
/// caller does not wait for it while holding the job lock.
fn send_signal(pid: u32, signal: Signal) -> bool {
    if pid == 0 {
        return false;
    }

    let flag = format!("-{}", signal.name());
    if tokio::runtime::Handle::try_current().is_ok() {
        let spawned = tokio::process::Command::new("kill")
            .arg(&flag)
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        return match spawned {
            Ok(_) => true,
            Err(e) => {
                debug!("Failed to send {} signal to process {}: {}", signal.name(), pid, e);
                false
            }
        };
    }

    match std::process::Command::new("kill")
        .arg(&flag)
        .arg(pid.to_string())
        .output()
    {
        Ok(output) => output.status.success(),
        Err(e) => {
            debug!("Failed to send {} signal to process {}: {}", signal.name(), pid, e);
            false
        }
    }
}

/// Exit code, with signals mapped to `128 + signal` as shells do.
fn exit_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|s| 128 + s))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}
