//! pilotty-sessions: out-of-band inspection of session artifacts.
//!
//! Reads the `~/.pilotty` tree directly; never talks to a running driver.
//!
//! Usage:
//!   pilotty-sessions list              # Active sessions (via active/ pointers)
//!   pilotty-sessions list --all        # Every logged session
//!   pilotty-sessions show <id>         # Metadata, renderer state, recent interactions
//!   pilotty-sessions transcript <id>   # Path of the raw transcript

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use pilotty::artifacts::{default_base_dir, safe_id, RendererState, SessionMeta};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("list") => list_sessions(args.iter().any(|a| a == "--all")),
        Some("show") => match args.get(1) {
            Some(id) => show_session(id),
            None => bail!("usage: pilotty-sessions show <id>"),
        },
        Some("transcript") => match args.get(1) {
            Some(id) => print_transcript_path(id),
            None => bail!("usage: pilotty-sessions transcript <id>"),
        },
        _ => {
            eprintln!("usage: pilotty-sessions <list [--all] | show <id> | transcript <id>>");
            std::process::exit(1);
        }
    }
}

fn active_session_dirs(base: &Path) -> Vec<(String, PathBuf)> {
    let active_dir = base.join("active");
    let Ok(entries) = fs::read_dir(&active_dir) else {
        return Vec::new();
    };
    let mut out: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            fs::canonicalize(entry.path()).ok().map(|target| (name, target))
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn all_session_dirs(base: &Path) -> Vec<(String, PathBuf)> {
    let sessions_dir = base.join("sessions");
    let Ok(entries) = fs::read_dir(&sessions_dir) else {
        return Vec::new();
    };
    let mut out: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| {
            (
                entry.file_name().to_string_lossy().into_owned(),
                entry.path(),
            )
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn read_meta(dir: &Path) -> Option<SessionMeta> {
    let contents = fs::read_to_string(dir.join("session.json")).ok()?;
    serde_json::from_str(&contents).ok()
}

fn list_sessions(show_all: bool) -> Result<()> {
    let base = default_base_dir();
    let sessions = if show_all {
        all_session_dirs(&base)
    } else {
        active_session_dirs(&base)
    };

    if sessions.is_empty() {
        println!(
            "No {} sessions found under {}.",
            if show_all { "logged" } else { "active" },
            base.display()
        );
        return Ok(());
    }

    println!(
        "{} session(s) under {}:",
        sessions.len(),
        base.display()
    );
    for (name, dir) in sessions {
        match read_meta(&dir) {
            Some(meta) => {
                let ended = meta
                    .end_time
                    .as_deref()
                    .map(|t| format!("ended {t}"))
                    .unwrap_or_else(|| "running".to_string());
                println!(
                    "  {}  pid={}  {}x{}  started {}  {}",
                    name,
                    meta.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    meta.cols,
                    meta.rows,
                    meta.start_time,
                    ended
                );
            }
            None => println!("  {}  (no metadata)", name),
        }
    }
    Ok(())
}

fn resolve_session_dir(id: &str) -> Result<PathBuf> {
    let base = default_base_dir();
    let dir = base.join("sessions").join(safe_id(id));
    if !dir.is_dir() {
        bail!("session {:?} not found under {}", id, base.display());
    }
    Ok(dir)
}

fn show_session(id: &str) -> Result<()> {
    let dir = resolve_session_dir(id)?;

    println!("Session directory: {}", dir.display());
    match read_meta(&dir) {
        Some(meta) => {
            println!("  session_id: {}", meta.session_id);
            println!("  pid:        {}", meta.pid.map_or_else(|| "-".to_string(), |p| p.to_string()));
            println!("  geometry:   {}x{}", meta.cols, meta.rows);
            println!("  cwd:        {}", meta.initial_cwd);
            println!("  started:    {}", meta.start_time);
            match meta.end_time {
                Some(t) => println!("  ended:      {t}"),
                None => println!("  ended:      (still running)"),
            }
        }
        None => println!("  no session.json"),
    }

    if let Ok(contents) = fs::read_to_string(dir.join("state.json")) {
        if let Ok(state) = serde_json::from_str::<RendererState>(&contents) {
            println!(
                "  renderer:   {}",
                if state.vt100_ok {
                    "ok".to_string()
                } else {
                    format!("degraded ({})", state.vt100_error.as_deref().unwrap_or("?"))
                }
            );
        }
    }

    let interaction = dir.join("interaction.log");
    if let Ok(contents) = fs::read_to_string(&interaction) {
        let lines: Vec<&str> = contents.lines().collect();
        let tail_start = lines.len().saturating_sub(30);
        println!("\nRecent interactions ({}):", interaction.display());
        for line in &lines[tail_start..] {
            println!("  {line}");
        }
    } else {
        println!("\nNo interactions logged yet.");
    }
    Ok(())
}

fn print_transcript_path(id: &str) -> Result<()> {
    let dir = resolve_session_dir(id)?;
    let transcript = dir.join("transcript.log");
    if !transcript.is_file() {
        bail!("no transcript at {}", transcript.display());
    }
    println!("{}", transcript.display());
    Ok(())
}
