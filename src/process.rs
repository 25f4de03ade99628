//! Bounded execution of external inspection tools.
//!
//! Output is streamed line by line to a caller-supplied closure and never
//! materialized as a whole. Every invocation owns its own deadline and byte
//! budget:
//! - stdout is read by a pump thread in fixed-size chunks and handed over a
//!   bounded channel; the caller's thread waits on the channel with the time
//!   left until the deadline
//! - on deadline expiry the process gets SIGTERM, a short grace period, then SIGKILL
//! - once the byte budget is used up the process is terminated and the
//!   outcome is flagged `truncated` (a degraded success, not an error);
//!   a line cut at `max_line_length` flags it the same way
//! - stderr is kept separately as a bounded tail for error messages

use crate::config::AnalyzerOptions;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::borrow::Cow;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Appended to any line cut at `max_line_length`
pub const TRUNCATION_MARKER: &str = " [truncated]";

const CHUNK_SIZE: usize = 8192;
const CHANNEL_DEPTH: usize = 16;
const STDERR_TAIL_BYTES: usize = 4096;
const TERMINATE_GRACE: Duration = Duration::from_millis(500);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const STDERR_COLLECT_GRACE: Duration = Duration::from_millis(200);

/// Failures of the runner itself, as opposed to failures of the command
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{0} pipe was not attached to the child process")]
    PipeUnavailable(&'static str),
    #[error("failed to spawn reader thread: {0}")]
    ReaderThread(io::Error),
    #[error("failed to wait for child process: {0}")]
    Wait(io::Error),
}

/// Limits applied to a single command invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimits {
    pub timeout: Duration,
    pub max_output_bytes: u64,
    pub max_line_length: usize,
}

impl OutputLimits {
    pub fn from_options(options: &AnalyzerOptions) -> Self {
        Self {
            timeout: options.timeout,
            max_output_bytes: options.max_output_bytes,
            max_line_length: options.max_line_length.max(1),
        }
    }
}

/// What happened to a command that was launched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Exit code, None when the process ended by signal
    pub exit_code: Option<i32>,
    /// Bytes of stdout consumed (never more than the byte budget)
    pub bytes_read: u64,
    pub lines: u64,
    /// Lines cut at `max_line_length`
    pub lines_cut: u64,
    /// Byte budget exhausted or at least one line cut
    pub truncated: bool,
    /// Last few KiB of stderr, decoded
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessReport {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short error description: stderr if there is any, else the exit code
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit_code {
            Some(code) => format!("Exit code {}", code),
            None => "Terminated by signal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailure {
    NotFound,
    PermissionDenied,
    Other,
}

/// Expected outcomes of a bounded run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The command exited on its own, or was stopped because output hit the byte budget
    Completed(ProcessReport),
    /// The deadline expired and the command was terminated
    TimedOut(ProcessReport),
    /// The command could not be started; the line callback was never invoked
    LaunchFailed {
        program: String,
        kind: LaunchFailure,
        message: String,
    },
}

impl ProcessOutcome {
    pub fn report(&self) -> Option<&ProcessReport> {
        match self {
            ProcessOutcome::Completed(r) | ProcessOutcome::TimedOut(r) => Some(r),
            ProcessOutcome::LaunchFailed { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessOutcome::TimedOut(_))
    }
}

/// Run `program args...`, feeding every stdout line to `on_line` as soon as it arrives.
pub fn run_bounded<I, S, F>(
    program: &str,
    args: I,
    limits: &OutputLimits,
    mut on_line: F,
) -> Result<ProcessOutcome, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    F: FnMut(&str),
{
    let start = Instant::now();
    let deadline = start + limits.timeout;

    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let kind = match e.kind() {
                io::ErrorKind::NotFound => LaunchFailure::NotFound,
                io::ErrorKind::PermissionDenied => LaunchFailure::PermissionDenied,
                _ => LaunchFailure::Other,
            };
            debug!(program, error = %e, "Failed to launch command");
            return Ok(ProcessOutcome::LaunchFailed {
                program: program.to_string(),
                kind,
                message: e.to_string(),
            });
        }
    };

    let (stdout_rx, stderr_rx) = match attach_readers(&mut child) {
        Ok(receivers) => receivers,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
    };

    let mut splitter = LineSplitter::new(limits.max_line_length);
    let mut bytes_read: u64 = 0;
    let mut truncated = false;
    let mut timed_out = false;

    loop {
        let now = Instant::now();
        if now >= deadline {
            timed_out = true;
            break;
        }
        match stdout_rx.recv_timeout(deadline - now) {
            Ok(Ok(chunk)) => {
                let remaining = limits.max_output_bytes.saturating_sub(bytes_read);
                let take = (chunk.len() as u64).min(remaining) as usize;
                bytes_read += take as u64;
                splitter.push(&chunk[..take], &mut on_line);
                if take < chunk.len() {
                    truncated = true;
                    break;
                }
            }
            Ok(Err(e)) => {
                warn!(program, error = %e, "Read error on stdout, treating as end of output");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                timed_out = true;
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    splitter.finish(&mut on_line);
    // The pump thread exits on its next send once the receiver is gone.
    drop(stdout_rx);

    let status = if timed_out || truncated {
        terminate(&mut child)?
    } else {
        match wait_until(&mut child, deadline).map_err(ProcessError::Wait)? {
            Some(status) => status,
            None => {
                timed_out = true;
                terminate(&mut child)?
            }
        }
    };

    let stderr = stderr_rx
        .recv_timeout(STDERR_COLLECT_GRACE)
        .map(|tail| decode_line(&tail, false).into_owned())
        .unwrap_or_default();

    let report = ProcessReport {
        exit_code: status.code(),
        bytes_read,
        lines: splitter.lines,
        lines_cut: splitter.cut,
        truncated: truncated || splitter.cut > 0,
        stderr,
        elapsed: start.elapsed(),
    };

    debug!(
        program,
        exit_code = ?report.exit_code,
        bytes_read = report.bytes_read,
        lines = report.lines,
        truncated = report.truncated,
        lines_cut = report.lines_cut,
        timed_out,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Command finished"
    );

    if timed_out {
        Ok(ProcessOutcome::TimedOut(report))
    } else {
        Ok(ProcessOutcome::Completed(report))
    }
}

type ChunkReceiver = Receiver<io::Result<Vec<u8>>>;

fn attach_readers(child: &mut Child) -> Result<(ChunkReceiver, Receiver<Vec<u8>>), ProcessError> {
    let stdout = child
        .stdout
        .take()
        .ok_or(ProcessError::PipeUnavailable("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(ProcessError::PipeUnavailable("stderr"))?;

    let (tx, rx) = bounded(CHANNEL_DEPTH);
    thread::Builder::new()
        .name("xcoffscan-stdout".to_string())
        .spawn(move || pump_chunks(stdout, tx))
        .map_err(ProcessError::ReaderThread)?;

    let (err_tx, err_rx) = bounded(1);
    thread::Builder::new()
        .name("xcoffscan-stderr".to_string())
        .spawn(move || {
            let _ = err_tx.send(read_tail(stderr, STDERR_TAIL_BYTES));
        })
        .map_err(ProcessError::ReaderThread)?;

    Ok((rx, err_rx))
}

fn pump_chunks<R: Read>(mut source: R, tx: Sender<io::Result<Vec<u8>>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

/// Read a stream to the end, keeping only its last `limit` bytes
fn read_tail<R: Read>(mut source: R, limit: usize) -> Vec<u8> {
    let mut tail = Vec::with_capacity(limit);
    let mut buf = [0u8; 1024];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    tail
}

fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep((deadline - now).min(WAIT_POLL_INTERVAL));
    }
}

/// Graceful termination, then a forced kill after the grace period
fn terminate(child: &mut Child) -> Result<ExitStatus, ProcessError> {
    if let Some(status) = child.try_wait().map_err(ProcessError::Wait)? {
        return Ok(status);
    }
    send_terminate(child);
    if let Some(status) =
        wait_until(child, Instant::now() + TERMINATE_GRACE).map_err(ProcessError::Wait)?
    {
        return Ok(status);
    }
    debug!(pid = child.id(), "Process ignored SIGTERM, killing");
    let _ = child.kill();
    child.wait().map_err(ProcessError::Wait)
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    // SAFETY: the pid belongs to our own child, which has not been reaped yet.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.kill();
}

/// Splits a byte stream into lines with a hard per-line size bound
pub(crate) struct LineSplitter {
    buf: Vec<u8>,
    max_len: usize,
    overflowed: bool,
    lines: u64,
    cut: u64,
}

impl LineSplitter {
    pub(crate) fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len.min(CHUNK_SIZE)),
            max_len,
            overflowed: false,
            lines: 0,
            cut: 0,
        }
    }

    pub(crate) fn push<F: FnMut(&str)>(&mut self, mut bytes: &[u8], on_line: &mut F) {
        while let Some(pos) = bytes.iter().position(|&b| b == b'\n') {
            self.extend(&bytes[..pos]);
            self.emit(on_line);
            bytes = &bytes[pos + 1..];
        }
        self.extend(bytes);
    }

    pub(crate) fn finish<F: FnMut(&str)>(&mut self, on_line: &mut F) {
        if !self.buf.is_empty() || self.overflowed {
            self.emit(on_line);
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        if self.overflowed {
            return;
        }
        let room = self.max_len - self.buf.len();
        if bytes.len() > room {
            self.buf.extend_from_slice(&bytes[..room]);
            self.overflowed = true;
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }

    fn emit<F: FnMut(&str)>(&mut self, on_line: &mut F) {
        if !self.overflowed && self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let text = decode_line(&self.buf, self.overflowed);
        if self.overflowed {
            let mut line = text.into_owned();
            line.push_str(TRUNCATION_MARKER);
            on_line(&line);
            self.cut += 1;
        } else {
            on_line(&text);
        }
        self.lines += 1;
        self.buf.clear();
        self.overflowed = false;
    }
}

/// UTF-8 first, ISO-8859-1 as the fallback. A line cut mid-character keeps
/// its valid prefix instead of falling back.
pub fn decode_line(bytes: &[u8], cut: bool) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(e) if cut && e.error_len().is_none() => {
            Cow::Borrowed(std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default())
        }
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

/// True if `name` resolves to an executable on `PATH` (or is an executable path)
pub fn command_exists(name: &str) -> bool {
    if name.contains(std::path::MAIN_SEPARATOR) {
        return is_executable(Path::new(name));
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(name)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
