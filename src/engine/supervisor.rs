//! Agent process supervisor.
//!
//! Owns spawn and termination of exactly one child per [`ProcessHandle`]:
//! - Arguments are the caller's, followed by the forced stream-json flags and,
//!   when a continuation id is known, a resume directive.
//! - Environment is passed explicitly per spawn. The isolation directory is
//!   exported under a configurable variable name and never set on the
//!   current process.
//! - Three piped streams with `kill_on_drop(true)`. A driver task reads
//!   stdout, reaps the child, and reports the exit to the engine.
//!
//! Termination is graceful first (SIGTERM on unix), then a hard kill once
//! the configured grace period runs out.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::Router;
use crate::protocol::reader::{run_reader, ReaderExit};
use crate::protocol::writer::run_writer;
use crate::{AppError, Result};

// ── Flags ────────────────────────────────────────────────────────────────────

/// Non-interactive mode.
pub const FLAG_PRINT: &str = "--print";
/// Verbose output, required for streaming output.
pub const FLAG_VERBOSE: &str = "--verbose";
/// Input format selector.
pub const FLAG_INPUT_FORMAT: &str = "--input-format";
/// Output format selector.
pub const FLAG_OUTPUT_FORMAT: &str = "--output-format";
/// Value for both format selectors.
pub const STREAM_JSON: &str = "stream-json";
/// Session-creation directive with an explicit id.
pub const FLAG_SESSION_ID: &str = "--session-id";
/// Resume-existing-session directive.
pub const FLAG_RESUME: &str = "--resume";

/// Capacity of the per-process outbound message channel.
const OUTBOUND_CAPACITY: usize = 64;

/// How long the driver waits for stderr to drain after a normal exit.
const STDERR_DRAIN: Duration = Duration::from_millis(200);

/// Whether `args` contains `flag`, either bare or as `flag=value`.
#[must_use]
pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| {
        arg == flag
            || arg
                .strip_prefix(flag)
                .is_some_and(|rest| rest.starts_with('='))
    })
}

/// Remove every occurrence of `flag` together with its value.
fn strip_flag_with_value(args: &[String], flag: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == flag {
            iter.next();
            continue;
        }
        if arg
            .strip_prefix(flag)
            .is_some_and(|rest| rest.starts_with('='))
        {
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// Build the full argument list for one spawn.
///
/// `respawn` is true when the process replaces an earlier one of the same
/// engine. On a respawn with a known continuation id the caller's
/// session-creation directive has already been used once, so it is replaced by
/// a resume directive. On a first spawn a caller-supplied `--session-id` wins
/// and no resume is added.
#[must_use]
pub fn build_args(config: &EngineConfig, continuation_id: &str, respawn: bool) -> Vec<String> {
    let mut args = strip_flag_with_value(&config.args, FLAG_INPUT_FORMAT);
    args = strip_flag_with_value(&args, FLAG_OUTPUT_FORMAT);

    let resuming = !continuation_id.is_empty();
    if respawn && resuming {
        args = strip_flag_with_value(&args, FLAG_SESSION_ID);
        args = strip_flag_with_value(&args, FLAG_RESUME);
    }

    if !has_flag(&args, FLAG_PRINT) && !args.iter().any(|a| a == "-p") {
        args.push(FLAG_PRINT.to_owned());
    }
    if !has_flag(&args, FLAG_VERBOSE) {
        args.push(FLAG_VERBOSE.to_owned());
    }
    args.extend(
        [FLAG_INPUT_FORMAT, STREAM_JSON, FLAG_OUTPUT_FORMAT, STREAM_JSON]
            .into_iter()
            .map(str::to_owned),
    );

    if resuming && !has_flag(&args, FLAG_SESSION_ID) && !has_flag(&args, FLAG_RESUME) {
        args.push(FLAG_RESUME.to_owned());
        args.push(continuation_id.to_owned());
    }

    args
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Snapshot of a live process, for callers and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// OS process id.
    pub pid: u32,
    /// Spawn counter within the owning engine, starting at 1.
    pub generation: u64,
    /// When the process was started.
    pub spawned_at: DateTime<Utc>,
    /// Arguments the process was started with.
    pub args: Vec<String>,
}

/// Exclusive handle to one running agent process.
///
/// Dropping the handle terminates the process; a new process always gets a
/// new handle.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub(crate) info: ProcessInfo,
    pub(crate) outbound: mpsc::Sender<Value>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How a process ended, as observed by its driver task.
#[derive(Debug, Clone)]
pub(crate) struct ExitReport {
    pub(crate) code: Option<i32>,
    /// True when the engine asked for the termination.
    pub(crate) requested: bool,
    pub(crate) stderr: String,
}

/// Bounded buffer of the newest stderr lines.
#[derive(Debug, Clone)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

// ── Spawn / terminate ────────────────────────────────────────────────────────

/// Spawn one agent process and its reader, writer and stderr tasks.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns [`AppError::Spawn`] if the binary cannot be started or a pipe
/// cannot be captured.
pub(crate) fn spawn_process(
    config: &EngineConfig,
    continuation_id: &str,
    generation: u64,
    router: Router,
) -> Result<ProcessHandle> {
    let args = build_args(config, continuation_id, generation > 1);

    let mut cmd = Command::new(&config.binary);
    cmd.args(&args).envs(&config.env);

    if let Some(dir) = &config.state_dir {
        cmd.env(&config.state_dir_env, dir);
    }
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn {}: {err}", config.binary)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

    let pid = child.id().unwrap_or(0);
    info!(
        pid,
        generation,
        binary = %config.binary,
        resume = !continuation_id.is_empty(),
        "agent process spawned"
    );

    let cancel = CancellationToken::new();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = run_writer(pid, stdin, outbound_rx, writer_cancel).await {
            warn!(pid, %err, "writer task ended with error");
        }
    });

    let tail = StderrTail::new(config.stream.stderr_tail_lines);
    let stderr_task = tokio::spawn(read_stderr(pid, stderr, tail.clone(), cancel.clone()));

    let driver = tokio::spawn(drive(DriverParts {
        pid,
        child,
        stdout,
        router,
        cancel: cancel.clone(),
        grace: config.terminate_grace(),
        max_line_bytes: config.stream.max_line_bytes,
        tail,
        stderr_task,
    }));

    Ok(ProcessHandle {
        info: ProcessInfo {
            pid,
            generation,
            spawned_at: Utc::now(),
            args,
        },
        outbound,
        cancel,
        driver: Some(driver),
    })
}

/// Terminate a process and wait for its driver to finish reaping it.
pub(crate) async fn terminate(mut handle: ProcessHandle) {
    let pid = handle.info.pid;
    let driver = handle.driver.take();
    drop(handle);

    if let Some(driver) = driver {
        if let Err(err) = driver.await {
            warn!(pid, %err, "driver task failed during termination");
        }
    }
    debug!(pid, "agent process terminated");
}

// ── Tasks ────────────────────────────────────────────────────────────────────

struct DriverParts {
    pid: u32,
    child: Child,
    stdout: ChildStdout,
    router: Router,
    cancel: CancellationToken,
    grace: Duration,
    max_line_bytes: usize,
    tail: StderrTail,
    stderr_task: JoinHandle<()>,
}

/// Driver task — decode stdout until EOF or cancellation, then reap.
async fn drive(parts: DriverParts) {
    let DriverParts {
        pid,
        mut child,
        stdout,
        router,
        cancel,
        grace,
        max_line_bytes,
        tail,
        stderr_task,
    } = parts;

    let exit = run_reader(pid, stdout, max_line_bytes, &router, &cancel).await;

    let (status, requested) = match exit {
        ReaderExit::Cancelled => (stop_child(pid, &mut child, grace).await, true),
        ReaderExit::Eof | ReaderExit::Failed(_) => {
            tokio::select! {
                status = child.wait() => (status.ok(), false),
                () = cancel.cancelled() => (stop_child(pid, &mut child, grace).await, true),
            }
        }
    };

    if !requested {
        // Let stderr finish so the exit report carries the agent's last words.
        let _ = tokio::time::timeout(STDERR_DRAIN, stderr_task).await;
    }

    let code = status.and_then(|s: ExitStatus| s.code());
    info!(pid, ?code, requested, "agent process exited");

    router.exited(&ExitReport {
        code,
        requested,
        stderr: tail.snapshot(),
    });
}

/// Stderr task — log every line and keep the newest ones.
async fn read_stderr(pid: u32, stderr: ChildStderr, tail: StderrTail, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    debug!(pid, stderr = %line, "agent stderr");
                    tail.push(line);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(pid, %err, "stderr read failed");
                    break;
                }
            },
        }
    }
}

/// Ask the child to exit, then kill it once `grace` runs out.
async fn stop_child(pid: u32, child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    request_termination(pid, child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!(pid, %err, "error waiting for agent process");
            None
        }
        Err(_elapsed) => {
            warn!(pid, ?grace, "agent ignored termination request, killing");
            if let Err(err) = child.kill().await {
                warn!(pid, %err, "failed to kill agent process");
            }
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn request_termination(pid: u32, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        let _ = child.start_kill();
        return;
    };
    if raw == 0 {
        let _ = child.start_kill();
        return;
    }
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn request_termination(_pid: u32, child: &mut Child) {
    let _ = child.start_kill();
}
