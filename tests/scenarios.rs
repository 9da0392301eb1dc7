//! End-to-end scenarios driving a real shell through the tool surface.
//!
//! These spawn `bash --norc --noprofile` children, so they need a Unix host
//! with bash on PATH. Each test uses its own artifact base under a tempdir.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use pilotty::session::SessionManager;
use pilotty::tool::protocol::{
    CreateSessionArgs, ErrorKind, ExpectArgs, ExpectPromptArgs, PollOutputArgs, Reply, Request,
    RunArgs, SendPasswordArgs, TerminateArgs, TranscriptArgs,
};
use pilotty::tool::ToolHandler;

struct Harness {
    handler: ToolHandler,
    _dir: TempDir,
    cwd: String,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(SessionManager::new(dir.path().join("state")));
        let cwd = dir.path().display().to_string();
        Self {
            handler: ToolHandler::new(manager),
            _dir: dir,
            cwd,
        }
    }

    fn create(&self, id: &str) -> Reply {
        self.handler.handle(Request::CreateSession(CreateSessionArgs {
            id: id.to_string(),
            cwd: self.cwd.clone(),
            description: None,
            shell_prompt_regex: None,
        }))
    }

    fn run(&self, id: &str, command: &str) -> Reply {
        self.run_with_timeout(id, command, 30.0)
    }

    fn run_with_timeout(&self, id: &str, command: &str, timeout: f64) -> Reply {
        self.handler.handle(Request::Run(RunArgs {
            id: id.to_string(),
            command: command.to_string(),
            timeout,
            strip_ansi: true,
        }))
    }

    fn poll(&self, id: &str, timeout: f64) -> Reply {
        self.handler.handle(Request::PollOutput(PollOutputArgs {
            id: id.to_string(),
            timeout,
        }))
    }

    fn terminate(&self, id: &str) -> Reply {
        self.handler.handle(Request::Terminate(TerminateArgs {
            id: id.to_string(),
        }))
    }

    fn transcript_contents(&self, id: &str) -> String {
        let reply = self.handler.handle(Request::Transcript(TranscriptArgs {
            id: id.to_string(),
        }));
        std::fs::read_to_string(reply.transcript.unwrap()).unwrap()
    }
}

#[test]
fn run_echo_returns_ready_with_output() {
    let h = Harness::new();
    let created = h.create("s");
    assert!(created.error.is_none(), "create failed: {:?}", created.error);

    let reply = h.run("s", "echo hello");
    assert_eq!(reply.status, "ready", "reason: {:?}", reply.state_reason);
    assert!(reply.output.contains("hello"));
    assert!(!reply.output_truncated);
    assert_eq!(reply.dropped_bytes, 0);

    h.terminate("s");
}

#[test]
fn background_job_does_not_deadlock_the_session() {
    let h = Harness::new();
    h.create("s");

    let reply = h.run("s", "sleep 1 &");
    assert!(reply.error.is_none());

    let reply = h.run("s", "echo done");
    assert!(reply.output.contains("done"));

    h.terminate("s");
}

#[test]
fn poll_collects_late_background_output_after_quiescence() {
    let h = Harness::new();
    h.create("s");

    h.run_with_timeout("s", "sh -c 'sleep 0.6; echo LATE' &", 2.0);
    let reply = h.poll("s", 2.0);
    assert_eq!(reply.status, "quiescent");
    assert!(reply.output.contains("LATE"), "output: {:?}", reply.output);
    assert!(!reply.timed_out);

    h.terminate("s");
}

#[test]
fn poll_times_out_empty_when_output_is_still_pending() {
    let h = Harness::new();
    h.create("s");

    h.run_with_timeout("s", "sh -c 'sleep 2; echo X' &", 2.0);
    let started = Instant::now();
    let reply = h.poll("s", 0.1);
    assert_eq!(reply.status, "timeout");
    assert!(reply.timed_out);
    assert!(reply.output.is_empty(), "output: {:?}", reply.output);
    assert!(started.elapsed() >= Duration::from_millis(80));

    h.terminate("s");
}

#[test]
fn expect_matches_text_already_on_screen() {
    let h = Harness::new();
    h.create("s");

    h.run("s", "echo EXPECTME");
    let reply = h.handler.handle(Request::Expect(ExpectArgs {
        id: "s".to_string(),
        pattern: "EXPECTME".to_string(),
        timeout: 0.5,
    }));
    assert_eq!(reply.matched, Some(true));
    assert_eq!(reply.match_text.as_deref(), Some("EXPECTME"));
    assert!(!reply.timed_out);

    h.terminate("s");
}

#[test]
fn expect_prompt_recovers_after_a_timed_out_run() {
    let h = Harness::new();
    h.create("s");

    let reply = h.run_with_timeout("s", "sh -c 'sleep 0.4'", 0.05);
    assert!(
        reply.status == "running" || reply.status == "unknown",
        "status: {}",
        reply.status
    );
    assert!(reply.timed_out);

    let reply = h.handler.handle(Request::ExpectPrompt(ExpectPromptArgs {
        id: "s".to_string(),
        timeout: 3.0,
    }));
    assert_eq!(reply.status, "ready", "reason: {:?}", reply.state_reason);
    assert_eq!(reply.prompt.as_deref(), Some("shell"));
    assert_eq!(reply.matched, Some(true));
    assert!(!reply.timed_out);

    h.terminate("s");
}

#[test]
fn password_plaintext_never_reaches_output_or_logs() {
    let h = Harness::new();
    h.create("s");

    // `read -s` holds the terminal without echoing, like a login prompt.
    h.run_with_timeout("s", "read -s SECRET_VAR", 0.3);
    let reply = h.handler.handle(Request::SendPassword(SendPasswordArgs {
        id: "s".to_string(),
        password: "not_a_secret".to_string(),
        timeout: 2.0,
    }));
    assert!(
        reply.output.starts_with("[password sent]"),
        "output: {:?}",
        reply.output
    );
    assert!(!reply.output.contains("not_a_secret"));

    let session_dir = {
        let meta = h
            .handler
            .handle(Request::GetMetadata(pilotty::tool::protocol::GetMetadataArgs {
                id: "s".to_string(),
            }))
            .metadata
            .unwrap();
        std::path::PathBuf::from(meta.transcript.unwrap())
            .parent()
            .unwrap()
            .to_path_buf()
    };

    h.terminate("s");

    for log_name in ["transcript.log", "commands.log", "interaction.log"] {
        let path = session_dir.join(log_name);
        if let Ok(contents) = std::fs::read_to_string(&path) {
            assert!(
                !contents.contains("not_a_secret"),
                "plaintext leaked into {log_name}"
            );
        }
    }
}

#[test]
fn terminated_session_rejects_every_operation() {
    let h = Harness::new();
    h.create("s");
    let reply = h.terminate("s");
    assert_eq!(reply.status, "terminated");

    let reply = h.run("s", "echo nope");
    assert_eq!(reply.status, "terminated");
    assert_eq!(reply.error_kind, Some(ErrorKind::Terminated));

    let reply = h.poll("s", 0.1);
    assert_eq!(reply.status, "terminated");

    // Terminating again stays terminal, not an error.
    let reply = h.terminate("s");
    assert_eq!(reply.status, "terminated");
}

#[test]
fn unknown_session_gets_a_creation_hint() {
    let h = Harness::new();
    let reply = h.run("ghost", "echo hi");
    assert_eq!(reply.error_kind, Some(ErrorKind::NoSuchSession));
    assert!(reply.error.unwrap().contains("create it first"));
}

#[test]
fn transcript_is_append_only_across_operations() {
    let h = Harness::new();
    h.create("s");

    h.run("s", "echo first");
    let t1 = h.transcript_contents("s");
    h.run("s", "echo second");
    let t2 = h.transcript_contents("s");

    assert!(t2.starts_with(&t1), "transcript was rewritten");
    assert!(t2.len() >= t1.len());
    assert!(t2.contains("second"));

    h.terminate("s");
}

#[test]
fn concurrent_runs_on_one_session_serialize_cleanly() {
    let h = Harness::new();
    h.create("s");

    let handler = &h.handler;
    std::thread::scope(|scope| {
        let a = scope.spawn(move || {
            handler.handle(Request::Run(RunArgs {
                id: "s".to_string(),
                command: "echo AAAA; sleep 0.3".to_string(),
                timeout: 5.0,
                strip_ansi: true,
            }))
        });
        let b = scope.spawn(move || {
            handler.handle(Request::Run(RunArgs {
                id: "s".to_string(),
                command: "echo BBBB".to_string(),
                timeout: 5.0,
                strip_ansi: true,
            }))
        });
        let reply_a = a.join().unwrap();
        let reply_b = b.join().unwrap();

        // Whichever ran second must not contain the first one's output: each
        // operation starts with a fresh capture under the session lock.
        let a_has_b = reply_a.output.contains("BBBB");
        let b_has_a = reply_b.output.contains("AAAA");
        assert!(
            !(a_has_b && b_has_a),
            "outputs interleaved: {:?} / {:?}",
            reply_a.output,
            reply_b.output
        );
    });

    h.terminate("s");
}

#[test]
fn spawned_shell_sees_sanitized_environment() {
    let h = Harness::new();
    h.create("s");

    let reply = h.run(
        "s",
        "echo VENV=[$VIRTUAL_ENV] PH=[$PYTHONHOME] PP=[$PYTHONPATH] PL=[$__PYVENV_LAUNCHER__]",
    );
    assert!(
        reply.output.contains("VENV=[] PH=[] PP=[] PL=[]"),
        "environment leaked: {:?}",
        reply.output
    );

    let reply = h.run("s", "echo TERM=$TERM");
    assert!(reply.output.contains("TERM=xterm-256color"));

    h.terminate("s");
}

#[test]
fn get_screen_reports_cursor_and_rendered_text() {
    let h = Harness::new();
    h.create("s");
    h.run("s", "echo rendered");

    let reply = h.handler.handle(Request::GetScreen(
        pilotty::tool::protocol::GetScreenArgs {
            id: "s".to_string(),
        },
    ));
    let screen = reply.screen.unwrap();
    assert!(screen.contains("rendered"));
    assert!(reply.cursor_x.is_some());
    assert!(reply.cursor_y.is_some());

    h.terminate("s");
}

#[test]
fn scrollback_outlives_the_visible_screen() {
    let h = Harness::new();
    h.create("s");
    h.run("s", "for i in $(seq 1 60); do echo line_$i; done");

    let reply = h.handler.handle(Request::GetScrollback(
        pilotty::tool::protocol::GetScrollbackArgs {
            id: "s".to_string(),
            lines: None,
            strip_ansi: true,
        },
    ));
    let scrollback = reply.scrollback.unwrap();
    assert!(scrollback.contains("line_1"));
    assert!(scrollback.contains("line_60"));

    h.handler.handle(Request::ClearScrollback(
        pilotty::tool::protocol::ClearScrollbackArgs {
            id: "s".to_string(),
        },
    ));
    let reply = h.handler.handle(Request::GetScrollback(
        pilotty::tool::protocol::GetScrollbackArgs {
            id: "s".to_string(),
            lines: None,
            strip_ansi: true,
        },
    ));
    let cleared = reply.scrollback.unwrap();
    assert!(cleared.len() < scrollback.len());

    h.terminate("s");
}

#[test]
fn send_control_interrupts_a_running_command() {
    let h = Harness::new();
    h.create("s");

    h.run_with_timeout("s", "sleep 30", 0.2);
    let reply = h.handler.handle(Request::SendControl(
        pilotty::tool::protocol::SendControlArgs {
            id: "s".to_string(),
            key: "c".to_string(),
            timeout: 3.0,
        },
    ));
    assert!(reply.error.is_none());

    let reply = h.handler.handle(Request::ExpectPrompt(ExpectPromptArgs {
        id: "s".to_string(),
        timeout: 3.0,
    }));
    assert_eq!(reply.status, "ready", "reason: {:?}", reply.state_reason);

    h.terminate("s");
}

#[test]
fn send_signal_accepts_names_and_numbers() {
    let h = Harness::new();
    h.create("s");

    h.run_with_timeout("s", "sleep 30", 0.2);
    let reply = h.handler.handle(Request::SendSignal(
        pilotty::tool::protocol::SendSignalArgs {
            id: "s".to_string(),
            signal: "INT".to_string(),
        },
    ));
    assert!(reply.error.is_none(), "signal failed: {:?}", reply.error);

    let reply = h.handler.handle(Request::SendSignal(
        pilotty::tool::protocol::SendSignalArgs {
            id: "s".to_string(),
            signal: "bogus".to_string(),
        },
    ));
    assert_eq!(reply.error_kind, Some(ErrorKind::InvalidArgument));

    h.terminate("s");
}
