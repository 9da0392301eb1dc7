//! PTY engine: one child process per session, driven through a
//! pseudoterminal with quiescence-based reads.
//!
//! The child's output is pumped by a dedicated reader thread into a channel;
//! engine operations drain that channel under the session lock, feeding every
//! chunk to the capture buffer, the VT renderer, and the transcript. An
//! operation finishes when the stream has been silent for `quiescence_ms`, at
//! its deadline, on child EOF, or (for `expect`) on a pattern match.
//!
//! "Quiescent" is strictly a silence predicate on the byte stream. It does not
//! mean a command completed.

pub mod env;

use std::io::{Read, Write};
use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, LocalFlags, SetArg};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use regex::Regex;

use crate::artifacts::SessionLogger;
use crate::capture::{CaptureBuffer, CaptureResult};
use crate::vt::{ScreenView, VtRenderer};

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Upper bound on a single blocking read inside the drainer.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Rolling search window kept by `expect`.
const EXPECT_WINDOW: usize = 64 * 1024;

/// Final status of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Quiescent,
    Timeout,
    Eof,
    Error,
    Matched,
}

impl OpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OpStatus::Quiescent => "quiescent",
            OpStatus::Timeout => "timeout",
            OpStatus::Eof => "eof",
            OpStatus::Error => "error",
            OpStatus::Matched => "matched",
        }
    }
}

/// Pattern match details returned by `expect`.
#[derive(Debug, Clone)]
pub struct MatchInfo {
    /// The matched substring.
    pub text: String,
    /// Captured groups, in order; unmatched groups are `None`.
    pub groups: Vec<Option<String>>,
}

/// Uniform result of an engine operation.
#[derive(Debug, Clone)]
pub struct OpResult {
    pub status: OpStatus,
    pub output: String,
    pub output_truncated: bool,
    pub dropped_bytes: u64,
    pub error: Option<String>,
    pub matched: Option<MatchInfo>,
}

impl OpResult {
    fn from_capture(status: OpStatus, capture: CaptureResult) -> Self {
        Self {
            status,
            output: capture.output,
            output_truncated: capture.truncated,
            dropped_bytes: capture.dropped_bytes,
            error: None,
            matched: None,
        }
    }

    fn failed(status: OpStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            output: String::new(),
            output_truncated: false,
            dropped_bytes: 0,
            error: Some(message.into()),
            matched: None,
        }
    }
}

/// Options for `send_text`.
#[derive(Debug, Clone)]
pub struct TypeOptions {
    /// Operation deadline in seconds.
    pub timeout: f64,
    /// Silence threshold in milliseconds.
    pub quiescence_ms: u64,
    /// When false, this call leaves no trace in the transcript or the
    /// command/interaction logs.
    pub log: bool,
    /// When set, force terminal line-echo on or off for the duration of the
    /// call; the prior setting is restored on every path.
    pub echo: Option<bool>,
}

impl Default for TypeOptions {
    fn default() -> Self {
        Self {
            timeout: 30.0,
            quiescence_ms: 500,
            log: true,
            echo: None,
        }
    }
}

/// Child program to run on the PTY.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub shell: String,
    pub args: Vec<String>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            // Bare-bones shell: user init files would print banners and
            // install prompts we cannot predict.
            shell: "bash".to_string(),
            args: vec!["--norc".to_string(), "--noprofile".to_string()],
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

struct DrainParams {
    timeout: Duration,
    quiescence: Duration,
    /// When true, quiescence only counts after at least one byte arrived
    /// during this call.
    require_output: bool,
    log: bool,
}

struct ChildHandle {
    child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
}

struct EngineCore {
    writer: Box<dyn Write + Send>,
    output_rx: Receiver<Vec<u8>>,
    vt: VtRenderer,
    logger: SessionLogger,
    /// Monotonic timestamp of the most recent non-empty read.
    last_output_time: Instant,
}

/// A child process attached to a PTY, with serialized operations.
///
/// The child handle lives behind its own short-held lock so `terminate` can
/// close the child while another operation is blocked in the drainer; the
/// in-flight operation then observes EOF.
pub struct PtySession {
    session_id: String,
    rows: u16,
    cols: u16,
    cwd: String,
    pid: Option<u32>,
    transcript_path: PathBuf,
    session_dir: PathBuf,
    child: Mutex<ChildHandle>,
    core: Mutex<EngineCore>,
    alive: Arc<AtomicBool>,
    terminated: AtomicBool,
}

/// Survive lock poisoning: a panicking operation must not brick the session.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PtySession {
    /// Spawn the child on a PTY sized to the requested geometry, with a
    /// sanitized environment and `cwd` as working directory. Performs an
    /// initial settle drain so creation lands on a quiet shell.
    pub fn spawn(
        session_id: &str,
        cwd: &Path,
        options: &SpawnOptions,
        logger: SessionLogger,
    ) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        // Keystroke echo off: the reply stream should be program output.
        if let Some(fd) = pair.master.as_raw_fd() {
            if let Err(e) = set_echo(fd, false) {
                log::warn!("could not disable echo for {}: {}", session_id, e);
            }
        }

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.args(&options.args);
        cmd.cwd(cwd);
        cmd.env_clear();
        for (key, value) in env::sanitized_env(options.rows, options.cols) {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {}", options.shell))?;
        // A parent-held slave fd would keep the PTY open after the child
        // exits and mask EOF on the master.
        drop(pair.slave);

        let pid = child.process_id();
        let writer = pair.master.take_writer()?;
        let mut reader = pair.master.try_clone_reader()?;

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>();
        let alive = Arc::new(AtomicBool::new(true));
        let alive_clone = Arc::clone(&alive);

        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break, // EOF
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).is_err() {
                            break; // Channel closed
                        }
                    }
                    Err(_) => break,
                }
            }
            alive_clone.store(false, Ordering::SeqCst);
        });

        let cwd_str = cwd.display().to_string();
        let transcript_path = logger.transcript_path().to_path_buf();
        let session_dir = logger.session_dir().to_path_buf();

        let mut core = EngineCore {
            writer,
            output_rx,
            vt: VtRenderer::new(options.rows, options.cols),
            logger,
            last_output_time: Instant::now(),
        };

        // Let the shell print its greeting and settle before the first call.
        let settle = DrainParams {
            timeout: Duration::from_secs(2),
            quiescence: Duration::from_millis(500),
            require_output: false,
            log: true,
        };
        core.drain(None, &settle, |_| false);

        core.logger.write_meta(pid, &cwd_str, options.rows, options.cols);
        core.logger.ensure_active_pointer();
        core.logger
            .write_state(core.vt.vt100_ok(), core.vt.vt100_error());

        log::info!(
            "session {} spawned {} (pid {:?}) in {}",
            session_id,
            options.shell,
            pid,
            cwd_str
        );

        Ok(Self {
            session_id: session_id.to_string(),
            rows: options.rows,
            cols: options.cols,
            cwd: cwd_str,
            pid,
            transcript_path,
            session_dir,
            child: Mutex::new(ChildHandle {
                child,
                master: pair.master,
            }),
            core: Mutex::new(core),
            alive,
            terminated: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn transcript_path(&self) -> &Path {
        &self.transcript_path
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.is_terminated()
    }

    /// Send raw bytes exactly as given (the caller supplies any newline),
    /// then drain until quiescence, deadline, or EOF.
    pub fn send_text(&self, text: &str, opts: &TypeOptions) -> OpResult {
        let mut core = lock(&self.core);
        if !self.is_alive() {
            return OpResult::failed(OpStatus::Eof, "pty not alive");
        }

        let _echo_guard = match opts.echo {
            Some(on) => match self.echo_guard(on) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    return OpResult::failed(OpStatus::Error, format!("echo toggle failed: {e}"))
                }
            },
            None => None,
        };

        if let Err(e) = core
            .writer
            .write_all(text.as_bytes())
            .and_then(|()| core.writer.flush())
        {
            return OpResult::failed(OpStatus::Error, e.to_string());
        }
        core.last_output_time = Instant::now();

        let mut capture = CaptureBuffer::new();
        let params = DrainParams {
            timeout: secs(opts.timeout),
            quiescence: Duration::from_millis(opts.quiescence_ms),
            require_output: false,
            log: opts.log,
        };
        let status = core.drain(Some(&mut capture), &params, |_| false);
        let result = OpResult::from_capture(status, capture.finish());
        core.vt.set_preview(result.output.clone());

        if opts.log {
            core.logger.append_command(text);
            core.logger
                .append_interaction(status.as_str(), text, &result.output);
            core.logger
                .write_state(core.vt.vt100_ok(), core.vt.vt100_error());
        }
        result
    }

    /// Drain pending output without sending anything. Returns `timeout` with
    /// empty output when the stream stays silent; once any byte arrives the
    /// call honors quiescence before returning.
    pub fn poll_output(&self, timeout: f64, quiescence_ms: u64, log: bool) -> OpResult {
        let mut core = lock(&self.core);
        let mut capture = CaptureBuffer::new();
        let params = DrainParams {
            timeout: secs(timeout),
            quiescence: Duration::from_millis(quiescence_ms),
            require_output: true,
            log,
        };
        let status = core.drain(Some(&mut capture), &params, |_| false);
        let result = OpResult::from_capture(status, capture.finish());
        core.vt.set_preview(result.output.clone());
        result
    }

    /// Wait until `pattern` appears in the output. The search window is
    /// seeded with the current rendered screen, so text already visible
    /// matches immediately, and is bounded to the most recent 64 KiB.
    pub fn expect(&self, pattern: &str, timeout: f64, log: bool) -> OpResult {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                return OpResult::failed(OpStatus::Error, format!("invalid pattern: {e}"))
            }
        };

        let mut core = lock(&self.core);
        let mut capture = CaptureBuffer::new();
        let mut window = core.vt.screen_text();

        let status = if re.is_match(&window) {
            OpStatus::Matched
        } else if !self.is_alive() {
            OpStatus::Eof
        } else {
            let params = DrainParams {
                timeout: secs(timeout),
                // Expect runs to its deadline; quiescence never ends it.
                quiescence: secs(timeout) + Duration::from_secs(1),
                require_output: false,
                log,
            };
            core.drain(Some(&mut capture), &params, |chunk| {
                window.push_str(&String::from_utf8_lossy(chunk));
                trim_window(&mut window);
                re.is_match(&window)
            })
        };

        let mut result = OpResult::from_capture(status, capture.finish());
        if status == OpStatus::Matched {
            if let Some(caps) = re.captures(&window) {
                result.matched = Some(MatchInfo {
                    text: caps
                        .get(0)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                    groups: caps
                        .iter()
                        .skip(1)
                        .map(|g| g.map(|m| m.as_str().to_string()))
                        .collect(),
                });
            }
        }
        core.vt.set_preview(result.output.clone());
        result
    }

    /// Deliver `sig` to the child's foreground process group if one exists,
    /// else to the child itself, then collect any immediate output.
    pub fn send_signal(&self, sig: Signal) -> OpResult {
        let mut core = lock(&self.core);
        if !self.is_alive() {
            return OpResult::failed(OpStatus::Eof, "pty not alive");
        }

        let delivery = {
            let child = lock(&self.child);
            match child.master.process_group_leader() {
                Some(pgid) => signal::killpg(Pid::from_raw(pgid), sig),
                None => match child.child.process_id() {
                    Some(pid) => signal::kill(Pid::from_raw(pid as i32), sig),
                    None => Err(nix::errno::Errno::ESRCH),
                },
            }
        };
        if let Err(e) = delivery {
            return OpResult::failed(OpStatus::Error, format!("signal delivery failed: {e}"));
        }

        let mut capture = CaptureBuffer::new();
        let params = DrainParams {
            timeout: Duration::from_millis(500),
            quiescence: Duration::from_millis(100),
            require_output: false,
            log: true,
        };
        let status = core.drain(Some(&mut capture), &params, |_| false);
        let result = OpResult::from_capture(status, capture.finish());
        core.vt.set_preview(result.output.clone());
        result
    }

    /// Current rendered screen and cursor. With `drain_first`, anything
    /// immediately available is ingested first (no quiescence wait, no
    /// forced timeout), so the view reflects recently arrived bytes.
    pub fn screen_snapshot(&self, drain_first: bool) -> ScreenView {
        let mut core = lock(&self.core);
        if drain_first {
            core.drain_immediate();
        }
        core.vt.view()
    }

    /// Rendered screen text after a non-blocking drain.
    pub fn read_screen(&self) -> String {
        self.screen_snapshot(true).text
    }

    /// Scrollback history plus current display, optionally the last `lines`.
    pub fn scrollback(&self, lines: Option<usize>) -> String {
        let mut core = lock(&self.core);
        core.drain_immediate();
        core.vt.scrollback_text(lines)
    }

    /// Drop renderer history; never sends bytes to the child.
    pub fn clear_scrollback(&self) {
        let mut core = lock(&self.core);
        core.vt.clear_scrollback();
    }

    /// Force-terminate the child, close the transcript, stamp the end time,
    /// and remove the active pointer. Idempotent; also the only way to
    /// preempt an in-flight operation.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut child = lock(&self.child);
            if let Err(e) = child.child.kill() {
                log::debug!("kill on terminate of {}: {}", self.session_id, e);
            }
        }
        let mut core = lock(&self.core);
        core.drain_immediate();
        core.logger.close(self.pid, &self.cwd, self.rows, self.cols);
        log::info!("session {} terminated", self.session_id);
    }

    fn echo_guard(&self, on: bool) -> Result<EchoGuard> {
        let child = lock(&self.child);
        let fd = child
            .master
            .as_raw_fd()
            .context("PTY master has no file descriptor")?;
        EchoGuard::set(fd, on)
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl EngineCore {
    /// The shared drain loop.
    ///
    /// 1. Ingest everything immediately available; a call entering an
    ///    already-quiescent session must not miss bytes buffered between
    ///    calls.
    /// 2. Return `Quiescent` once the silence threshold holds (and output
    ///    was seen, when required).
    /// 3. Return `Timeout` at the deadline.
    /// 4. Otherwise block for one bounded read and loop.
    fn drain(
        &mut self,
        mut capture: Option<&mut CaptureBuffer>,
        params: &DrainParams,
        mut matcher: impl FnMut(&[u8]) -> bool,
    ) -> OpStatus {
        let deadline = Instant::now() + params.timeout;
        let mut saw_output = false;
        loop {
            loop {
                match self.output_rx.try_recv() {
                    Ok(chunk) => {
                        saw_output = true;
                        self.last_output_time = Instant::now();
                        self.ingest(&chunk, capture.as_deref_mut(), params.log);
                        if matcher(&chunk) {
                            return OpStatus::Matched;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return OpStatus::Eof,
                }
            }

            let now = Instant::now();
            let silence = now.duration_since(self.last_output_time);
            let quiet = silence >= params.quiescence;
            if quiet && (!params.require_output || saw_output) {
                return OpStatus::Quiescent;
            }
            if now >= deadline {
                return OpStatus::Timeout;
            }

            let mut wait = (deadline - now).min(READ_SLICE);
            if !quiet {
                wait = wait.min(params.quiescence - silence);
            }
            match self.output_rx.recv_timeout(wait) {
                Ok(chunk) => {
                    saw_output = true;
                    self.last_output_time = Instant::now();
                    self.ingest(&chunk, capture.as_deref_mut(), params.log);
                    if matcher(&chunk) {
                        return OpStatus::Matched;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return OpStatus::Eof,
            }
        }
    }

    /// Ingest whatever is already buffered; never blocks.
    fn drain_immediate(&mut self) {
        loop {
            match self.output_rx.try_recv() {
                Ok(chunk) => {
                    self.last_output_time = Instant::now();
                    self.ingest(&chunk, None, true);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    fn ingest(&mut self, chunk: &[u8], capture: Option<&mut CaptureBuffer>, log: bool) {
        if let Some(cap) = capture {
            cap.push_chunk(chunk);
        }
        self.vt.feed(chunk);
        if log {
            self.logger.append_transcript(chunk);
        }
    }
}

/// RAII restore of the PTY's line-echo flag.
struct EchoGuard {
    fd: RawFd,
    prior: termios::Termios,
}

impl EchoGuard {
    fn set(fd: RawFd, on: bool) -> Result<Self> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut attrs = termios::tcgetattr(borrowed).context("tcgetattr failed")?;
        let prior = attrs.clone();
        attrs.local_flags.set(LocalFlags::ECHO, on);
        termios::tcsetattr(borrowed, SetArg::TCSANOW, &attrs).context("tcsetattr failed")?;
        Ok(Self { fd, prior })
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        if let Err(e) = termios::tcsetattr(borrowed, SetArg::TCSANOW, &self.prior) {
            log::warn!("echo restore failed: {}", e);
        }
    }
}

fn set_echo(fd: RawFd, on: bool) -> Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut attrs = termios::tcgetattr(borrowed).context("tcgetattr failed")?;
    attrs.local_flags.set(LocalFlags::ECHO, on);
    termios::tcsetattr(borrowed, SetArg::TCSANOW, &attrs).context("tcsetattr failed")?;
    Ok(())
}

fn secs(t: f64) -> Duration {
    Duration::from_secs_f64(t.max(0.0))
}

/// Keep only the most recent `EXPECT_WINDOW` bytes, cut at a char boundary.
fn trim_window(window: &mut String) {
    if window.len() <= EXPECT_WINDOW {
        return;
    }
    let mut cut = window.len() - EXPECT_WINDOW;
    while !window.is_char_boundary(cut) {
        cut += 1;
    }
    window.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::SessionLogger;
    use tempfile::TempDir;

    fn spawn_shell(dir: &TempDir) -> PtySession {
        let logger = SessionLogger::create(dir.path(), "engine-test").unwrap();
        PtySession::spawn(
            "engine-test",
            dir.path(),
            &SpawnOptions::default(),
            logger,
        )
        .unwrap()
    }

    #[test]
    fn echo_command_reaches_quiescence_with_output() {
        let dir = TempDir::new().unwrap();
        let session = spawn_shell(&dir);
        let result = session.send_text("echo hello\n", &TypeOptions::default());
        assert_eq!(result.status, OpStatus::Quiescent);
        assert!(result.output.contains("hello"));
        assert!(!result.output_truncated);
        assert!(session.read_screen().contains("hello"));
        session.terminate();
    }

    #[test]
    fn poll_without_output_times_out_empty() {
        let dir = TempDir::new().unwrap();
        let session = spawn_shell(&dir);
        let started = Instant::now();
        let result = session.poll_output(0.1, 100, true);
        assert_eq!(result.status, OpStatus::Timeout);
        assert!(result.output.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(80));
        session.terminate();
    }

    #[test]
    fn expect_matches_fresh_output() {
        let dir = TempDir::new().unwrap();
        let session = spawn_shell(&dir);
        session.send_text("sleep 0.2 && echo MARKER_42\n", &TypeOptions {
            timeout: 0.05,
            ..TypeOptions::default()
        });
        let result = session.expect("MARKER_(\\d+)", 3.0, true);
        assert_eq!(result.status, OpStatus::Matched);
        let matched = result.matched.unwrap();
        assert_eq!(matched.text, "MARKER_42");
        assert_eq!(matched.groups, vec![Some("42".to_string())]);
        session.terminate();
    }

    #[test]
    fn expect_rejects_bad_pattern_without_killing_session() {
        let dir = TempDir::new().unwrap();
        let session = spawn_shell(&dir);
        let result = session.expect("([unclosed", 1.0, true);
        assert_eq!(result.status, OpStatus::Error);
        assert!(result.error.unwrap().contains("invalid pattern"));
        let ok = session.send_text("echo still_here\n", &TypeOptions::default());
        assert!(ok.output.contains("still_here"));
        session.terminate();
    }

    #[test]
    fn terminate_is_idempotent_and_final() {
        let dir = TempDir::new().unwrap();
        let session = spawn_shell(&dir);
        session.terminate();
        session.terminate();
        assert!(session.is_terminated());
        assert!(!session.is_alive());
        let result = session.send_text("echo nope\n", &TypeOptions::default());
        assert_eq!(result.status, OpStatus::Eof);
    }

    #[test]
    fn trim_window_keeps_recent_bytes() {
        let mut window = "a".repeat(EXPECT_WINDOW + 10);
        window.push_str("needle");
        trim_window(&mut window);
        assert!(window.len() <= EXPECT_WINDOW);
        assert!(window.ends_with("needle"));
    }
}
