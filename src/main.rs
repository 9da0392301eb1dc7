//! pilotty: PTY driver daemon.
//!
//! Owns the session registry and serves framed JSON tool requests on a
//! per-uid Unix socket. Connections are handled on their own threads, so a
//! slow operation on one session never blocks calls against another; each
//! session serializes its own operations internally.
//!
//! Usage:
//!   pilotty           # Run the driver
//!   pilotty --status  # Show known sessions
//!   pilotty --stop    # Graceful shutdown (terminates all sessions)

use std::fs;
use std::io::{BufReader, BufWriter};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use pilotty::artifacts;
use pilotty::session::SessionManager;
use pilotty::tool::protocol::{framing, ErrorKind, Reply, Request};
use pilotty::tool::ToolHandler;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--status" => return show_status(),
            "--stop" => return stop_daemon(),
            "--help" | "-h" => {
                println!("pilotty: agent-facing PTY driver");
                println!();
                println!("Usage:");
                println!("  pilotty           Run the driver");
                println!("  pilotty --status  Show known sessions");
                println!("  pilotty --stop    Graceful shutdown");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[1]);
                std::process::exit(1);
            }
        }
    }

    run_daemon()
}

fn socket_path() -> std::path::PathBuf {
    let uid = nix::unistd::getuid();
    std::path::PathBuf::from(format!("/tmp/pilotty-{}.sock", uid))
}

fn request_once(request: &Request) -> Result<Reply> {
    let stream = UnixStream::connect(socket_path()).context("Driver not running")?;
    stream.set_read_timeout(Some(Duration::from_secs(60)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let mut writer = BufWriter::new(&stream);
    framing::write_message(&mut writer, request)?;
    drop(writer);

    let mut reader = BufReader::new(&stream);
    Ok(framing::read_message(&mut reader)?)
}

fn show_status() -> Result<()> {
    let reply = request_once(&Request::ListSessions)?;
    match reply.sessions {
        Some(sessions) if !sessions.is_empty() => {
            println!("Driver running with {} session(s):", sessions.len());
            for info in sessions {
                println!(
                    "  {} [{:?}] {} {}",
                    info.session_id,
                    info.state,
                    info.cwd.as_deref().unwrap_or("-"),
                    if info.is_alive { "alive" } else { "dead" }
                );
            }
        }
        _ => println!("Driver running, no sessions"),
    }
    Ok(())
}

fn stop_daemon() -> Result<()> {
    match request_once(&Request::Shutdown) {
        Ok(_) => println!("Driver shutting down"),
        Err(_) => println!("Driver not running"),
    }
    Ok(())
}

fn run_daemon() -> Result<()> {
    let sock_path = socket_path();

    // A stale socket from a dead process is safe to replace; a live one
    // means another driver owns this uid's endpoint.
    if sock_path.exists() {
        if UnixStream::connect(&sock_path).is_ok() {
            eprintln!("Driver already running on {}", sock_path.display());
            std::process::exit(1);
        }
        fs::remove_file(&sock_path)?;
    }

    let listener = UnixListener::bind(&sock_path).context("Failed to bind socket")?;

    let manager = Arc::new(SessionManager::new(artifacts::default_base_dir()));
    let handler = Arc::new(ToolHandler::new(Arc::clone(&manager)));
    let shutdown = Arc::new(AtomicBool::new(false));

    log::info!("pilotty listening on {}", sock_path.display());

    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let handler = Arc::clone(&handler);
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || {
                    if let Err(e) = handle_client(&handler, stream, &shutdown) {
                        log::debug!("client connection ended: {}", e);
                    }
                });
            }
            Err(e) => log::warn!("accept failed: {}", e),
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    manager.terminate_all();
    fs::remove_file(&sock_path).ok();
    log::info!("pilotty stopped");
    Ok(())
}

/// Serve framed requests on one connection until the peer hangs up.
fn handle_client(
    handler: &ToolHandler,
    stream: UnixStream,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    // One reader for the connection's lifetime: it may buffer ahead of the
    // current frame, so it must not be recreated between requests.
    let mut reader = BufReader::new(&stream);
    loop {
        let request: Request = match framing::read_message(&mut reader) {
            Ok(request) => request,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                // Bad JSON or an unknown argument key: reject it explicitly,
                // then drop the connection since the stream may be desynced.
                let reply = Reply::failure(ErrorKind::InvalidArgument, e.to_string());
                let mut writer = BufWriter::new(&stream);
                framing::write_message(&mut writer, &reply)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let is_shutdown = matches!(request, Request::Shutdown);
        let reply = handler.handle(request);

        let mut writer = BufWriter::new(&stream);
        framing::write_message(&mut writer, &reply)?;
        drop(writer);

        if is_shutdown {
            shutdown.store(true, Ordering::SeqCst);
            // Nudge the accept loop so it observes the flag.
            let _ = UnixStream::connect(socket_path());
            return Ok(());
        }
    }
}
