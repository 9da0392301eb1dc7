//! Tool surface: the stable operation set exposed to controllers.
//!
//! A thin adapter over the session manager and PTY engine: it resolves the
//! session id, runs the engine operation, classifies the post-operation
//! screen, and maps everything into the uniform [`protocol::Reply`] shape.
//! Transport concerns (socket, framing loop) live in the server binary.

pub mod ansi;
pub mod protocol;

use std::sync::Arc;
use std::time::Instant;

use nix::sys::signal::Signal;
use regex::Regex;

use crate::classify::{self, StateLabel, StateOracle};
use crate::pty::{OpResult, OpStatus, TypeOptions};
use crate::session::{LiveSession, SessionError, SessionManager};

use protocol::{ErrorKind, Reply, Request};

/// Quiescence threshold for send-style operations, in milliseconds.
const TYPE_QUIESCENCE_MS: u64 = 500;

/// Quiescence threshold for polling, in milliseconds.
const POLL_QUIESCENCE_MS: u64 = 100;

/// Dispatches controller requests against the session manager.
pub struct ToolHandler {
    manager: Arc<SessionManager>,
    oracle: Option<Box<dyn StateOracle>>,
}

impl ToolHandler {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            oracle: None,
        }
    }

    /// Install an external classifier, consulted only to refine RUNNING.
    pub fn with_oracle(mut self, oracle: Box<dyn StateOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Handle one request. Never panics and never returns a transport error:
    /// every failure becomes a reply with an `error_kind`.
    pub fn handle(&self, request: Request) -> Reply {
        match request {
            Request::Ping => Reply::with_status("ok"),
            Request::Shutdown => {
                self.manager.terminate_all();
                Reply::with_status("ok")
            }
            Request::CreateSession(args) => self.create_session(args),
            Request::Run(args) => self.run(args),
            Request::SendInput(args) => self.send_input(args),
            Request::SendPassword(args) => self.send_password(args),
            Request::SendControl(args) => self.send_control(args),
            Request::SendSignal(args) => self.send_signal(args),
            Request::PollOutput(args) => self.poll_output(args),
            Request::Expect(args) => self.expect(args),
            Request::ExpectPrompt(args) => self.expect_prompt(args),
            Request::GetScreen(args) => self.get_screen(args),
            Request::GetScrollback(args) => self.get_scrollback(args),
            Request::ClearScrollback(args) => self.clear_scrollback(args),
            Request::GetMetadata(args) => self.get_metadata(args),
            Request::ListSessions => {
                let mut reply = Reply::with_status("ok");
                reply.sessions = Some(self.manager.list());
                reply
            }
            Request::ConfigureSession(args) => self.configure_session(args),
            Request::Transcript(args) => self.transcript(args),
            Request::Terminate(args) => self.terminate(args),
        }
    }

    fn create_session(&self, args: protocol::CreateSessionArgs) -> Reply {
        match self.manager.create(
            &args.id,
            &args.cwd,
            args.description,
            args.shell_prompt_regex,
        ) {
            Ok(live) => {
                let mut reply = self.state_reply(&live);
                reply.metadata = Some(live.info());
                reply
            }
            Err(e) => error_reply(&args.id, e),
        }
    }

    fn run(&self, args: protocol::RunArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let text = format!("{}\n", args.command);
        let op = live.pty.send_text(
            &text,
            &TypeOptions {
                timeout: args.timeout,
                quiescence_ms: TYPE_QUIESCENCE_MS,
                log: true,
                echo: None,
            },
        );
        self.finish_op(&live, op, args.strip_ansi)
    }

    fn send_input(&self, args: protocol::SendInputArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let op = live.pty.send_text(
            &args.text,
            &TypeOptions {
                timeout: args.timeout,
                quiescence_ms: TYPE_QUIESCENCE_MS,
                log: true,
                echo: None,
            },
        );
        self.finish_op(&live, op, args.strip_ansi)
    }

    fn send_password(&self, args: protocol::SendPasswordArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let text = format!("{}\n", args.password);
        let op = live.pty.send_text(
            &text,
            &TypeOptions {
                timeout: args.timeout,
                quiescence_ms: TYPE_QUIESCENCE_MS,
                // Neither the logs nor the terminal may see the plaintext.
                log: false,
                echo: Some(false),
            },
        );
        let mut reply = self.finish_op(&live, op, true);
        let redacted = if args.password.is_empty() {
            reply.output.clone()
        } else {
            reply.output.replace(&args.password, "[redacted]")
        };
        reply.output = if redacted.trim().is_empty() {
            "[password sent]".to_string()
        } else {
            format!("[password sent]\n{redacted}")
        };
        reply
    }

    fn send_control(&self, args: protocol::SendControlArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let bytes = match control_key_bytes(&args.key) {
            Ok(bytes) => bytes,
            Err(msg) => return Reply::failure(ErrorKind::InvalidArgument, msg),
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let op = live.pty.send_text(
            &text,
            &TypeOptions {
                timeout: args.timeout,
                quiescence_ms: POLL_QUIESCENCE_MS * 2,
                log: true,
                echo: None,
            },
        );
        self.finish_op(&live, op, true)
    }

    fn send_signal(&self, args: protocol::SendSignalArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let sig = match parse_signal(&args.signal) {
            Ok(sig) => sig,
            Err(msg) => return Reply::failure(ErrorKind::InvalidArgument, msg),
        };
        let op = live.pty.send_signal(sig);
        self.finish_op(&live, op, true)
    }

    /// The reply's `status` is the drain status here: `quiescent` means
    /// output arrived and went silent, `timeout` means nothing arrived.
    fn poll_output(&self, args: protocol::PollOutputArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let op = live.pty.poll_output(args.timeout, POLL_QUIESCENCE_MS, true);
        let mut reply = Reply::with_status(op.status.as_str());
        reply.output = op.output;
        reply.output_truncated = op.output_truncated;
        reply.dropped_bytes = op.dropped_bytes;
        reply.timed_out = op.status == OpStatus::Timeout;
        if op.status == OpStatus::Eof {
            reply.error_kind = Some(ErrorKind::Eof);
        }
        reply.error = op.error;
        reply
    }

    fn expect(&self, args: protocol::ExpectArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        if let Err(e) = Regex::new(&args.pattern) {
            return Reply::failure(ErrorKind::InvalidArgument, format!("invalid pattern: {e}"));
        }
        let op = live.pty.expect(&args.pattern, args.timeout, true);
        let mut reply = Reply::with_status(op.status.as_str());
        reply.output = op.output;
        reply.output_truncated = op.output_truncated;
        reply.dropped_bytes = op.dropped_bytes;
        reply.timed_out = op.status == OpStatus::Timeout;
        reply.matched = Some(op.status == OpStatus::Matched);
        if let Some(info) = op.matched {
            reply.match_text = Some(info.text);
            reply.groups = Some(info.groups);
        }
        if op.status == OpStatus::Eof {
            reply.error_kind = Some(ErrorKind::Eof);
        }
        reply.error = op.error;
        reply
    }

    /// Poll until the classifier reports READY or the deadline passes.
    fn expect_prompt(&self, args: protocol::ExpectPromptArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let deadline = Instant::now() + std::time::Duration::from_secs_f64(args.timeout.max(0.0));
        loop {
            let op = live.pty.poll_output(0.2, POLL_QUIESCENCE_MS, true);
            if op.status == OpStatus::Eof {
                return Reply::failure(ErrorKind::Eof, "pty closed while waiting for prompt");
            }
            let (status, prompt, reason) = self.classify_current(&live);
            if status == "ready" {
                let mut reply = Reply::with_status(status);
                reply.prompt = prompt;
                reply.state_reason = Some(reason);
                reply.matched = Some(true);
                return reply;
            }
            if Instant::now() >= deadline {
                let mut reply = Reply::with_status(status);
                reply.prompt = prompt;
                reply.state_reason = Some(reason);
                reply.matched = Some(false);
                reply.timed_out = true;
                return reply;
            }
        }
    }

    fn get_screen(&self, args: protocol::GetScreenArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let view = live.pty.screen_snapshot(true);
        let mut reply = self.state_reply(&live);
        reply.screen = Some(view.text);
        reply.cursor_x = Some(view.cursor_x);
        reply.cursor_y = Some(view.cursor_y);
        reply
    }

    fn get_scrollback(&self, args: protocol::GetScrollbackArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let text = live.pty.scrollback(args.lines);
        let mut reply = Reply::with_status("ok");
        reply.scrollback = Some(if args.strip_ansi {
            ansi::strip_ansi(&text)
        } else {
            text
        });
        reply
    }

    fn clear_scrollback(&self, args: protocol::ClearScrollbackArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        live.pty.clear_scrollback();
        Reply::with_status("ok")
    }

    fn get_metadata(&self, args: protocol::GetMetadataArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let mut reply = Reply::with_status("ok");
        reply.metadata = Some(live.info());
        reply
    }

    fn configure_session(&self, args: protocol::ConfigureSessionArgs) -> Reply {
        match self
            .manager
            .configure(&args.id, args.description, args.shell_prompt_regex)
        {
            Ok(()) => Reply::with_status("ok"),
            Err(e) => error_reply(&args.id, e),
        }
    }

    fn transcript(&self, args: protocol::TranscriptArgs) -> Reply {
        let live = match self.resolve(&args.id) {
            Ok(live) => live,
            Err(reply) => return reply,
        };
        let mut reply = Reply::with_status("ok");
        reply.transcript = Some(live.pty.transcript_path().display().to_string());
        reply
    }

    fn terminate(&self, args: protocol::TerminateArgs) -> Reply {
        match self.manager.terminate(&args.id) {
            Ok(()) => Reply::with_status("terminated"),
            Err(e) => error_reply(&args.id, e),
        }
    }

    fn resolve(&self, id: &str) -> Result<Arc<LiveSession>, Reply> {
        self.manager.get(id).map_err(|e| error_reply(id, e))
    }

    /// Turn an engine result into a classified reply.
    fn finish_op(&self, live: &LiveSession, op: OpResult, strip: bool) -> Reply {
        let mut reply = Reply {
            output: if strip {
                ansi::strip_ansi(&op.output)
            } else {
                op.output
            },
            output_truncated: op.output_truncated,
            dropped_bytes: op.dropped_bytes,
            timed_out: op.status == OpStatus::Timeout,
            error: op.error,
            ..Reply::default()
        };

        match op.status {
            OpStatus::Eof => {
                reply.status = "eof".to_string();
                reply.error_kind = Some(ErrorKind::Eof);
            }
            OpStatus::Error => {
                reply.status = "unknown".to_string();
                reply.error_kind = Some(ErrorKind::PtyError);
            }
            _ => {
                let (status, prompt, reason) = self.classify_current(live);
                reply.status = status;
                reply.prompt = prompt;
                reply.state_reason = Some(reason);
            }
        }
        reply
    }

    /// Classified reply for the current screen, no engine operation.
    fn state_reply(&self, live: &LiveSession) -> Reply {
        let (status, prompt, reason) = self.classify_current(live);
        let mut reply = Reply::with_status(status);
        reply.prompt = prompt;
        reply.state_reason = Some(reason);
        reply
    }

    fn classify_current(&self, live: &LiveSession) -> (String, Option<String>, String) {
        if live.pty.is_terminated() {
            return ("terminated".to_string(), None, "session terminated".to_string());
        }
        if !live.pty.is_alive() {
            return ("eof".to_string(), None, "child process exited".to_string());
        }
        let view = live.pty.screen_snapshot(false);
        let prompt_regex = live.prompt_regex();
        let (label, reason) = classify::determine_state(
            &view.text,
            view.cursor_x,
            prompt_regex.as_ref(),
            self.oracle.as_deref(),
        );
        let (status, prompt) = map_label(label, &reason);
        (status.to_string(), Some(prompt.to_string()), reason)
    }
}

/// Classifier label → (status, prompt) as seen on the wire.
fn map_label(label: StateLabel, reason: &str) -> (&'static str, &'static str) {
    match label {
        StateLabel::Ready => ("ready", "shell"),
        StateLabel::Password => ("password", "none"),
        StateLabel::Confirm => ("confirm", "none"),
        StateLabel::Repl => {
            let lower = reason.to_ascii_lowercase();
            if lower.contains("pdb") {
                ("repl", "pdb")
            } else if lower.contains("python") || lower.contains("ipython") {
                ("repl", "python")
            } else {
                ("repl", "unknown")
            }
        }
        StateLabel::Editor => ("editor", "none"),
        StateLabel::Pager => ("pager", "none"),
        StateLabel::Running => ("running", "none"),
        StateLabel::Error | StateLabel::Unknown => ("unknown", "unknown"),
    }
}

fn error_reply(id: &str, e: SessionError) -> Reply {
    match e {
        SessionError::NotFound => Reply::failure(
            ErrorKind::NoSuchSession,
            format!("no such session {id:?}; create it first with create_session"),
        ),
        SessionError::Terminated => Reply::terminated(),
        SessionError::InvalidArgument(msg) => Reply::failure(ErrorKind::InvalidArgument, msg),
        SessionError::Spawn(msg) => Reply::failure(ErrorKind::PtyError, msg),
    }
}

/// Map a control-key name to the bytes it puts on the wire.
fn control_key_bytes(key: &str) -> Result<Vec<u8>, String> {
    let normalized = key.trim();
    match normalized.to_ascii_lowercase().as_str() {
        "[" | "escape" | "esc" => return Ok(vec![0x1b]),
        _ => {}
    }
    let mut chars = normalized.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => {
            // Ctrl+A = 0x01 .. Ctrl+Z = 0x1a.
            Ok(vec![(c.to_ascii_lowercase() as u8) - b'a' + 1])
        }
        _ => Err(format!(
            "unsupported control key {key:?}; expected a single letter, '[', or 'escape'"
        )),
    }
}

/// Parse a decimal signal number or a name with/without the SIG prefix.
fn parse_signal(spec: &str) -> Result<Signal, String> {
    let trimmed = spec.trim();
    if let Ok(num) = trimmed.parse::<i32>() {
        return Signal::try_from(num).map_err(|e| format!("invalid signal number {num}: {e}"));
    }
    let mut name = trimmed.to_ascii_uppercase();
    if !name.starts_with("SIG") {
        name.insert_str(0, "SIG");
    }
    name.parse::<Signal>()
        .map_err(|e| format!("invalid signal name {spec:?}: {e}"))
}
