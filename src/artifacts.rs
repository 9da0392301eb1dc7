//! On-disk session artifacts.
//!
//! Each session owns a directory under `<base>/sessions/<safe-id>` holding the
//! raw transcript, timestamped command and interaction logs, and two JSON
//! files updated by write-then-rename so external readers never observe a torn
//! file. A symlink in `<base>/active/` points at each live session's directory
//! and is removed on termination.
//!
//! Everything here is best-effort: persistence failures are logged and
//! swallowed, they never abort a user-visible operation.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Session metadata persisted as `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub safe_id: String,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub pid: Option<u32>,
    pub initial_cwd: String,
    pub rows: u16,
    pub cols: u16,
}

/// Renderer status persisted as `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererState {
    pub vt100_ok: bool,
    pub vt100_error: Option<String>,
    pub transcript: String,
}

/// Default artifact base: `~/.pilotty`.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pilotty")
}

/// Derive the on-disk directory name from a caller-chosen session id:
/// characters outside `[A-Za-z0-9_.-]` become `_`, leading/trailing
/// separators are stripped, and an empty result falls back to `default`.
pub fn safe_id(session_id: &str) -> String {
    let mapped: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches(|c| c == '_' || c == '.' || c == '-');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Current time as ISO-8601 UTC.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Writer for one session's artifact directory.
pub struct SessionLogger {
    session_id: String,
    safe_id: String,
    base_dir: PathBuf,
    session_dir: PathBuf,
    transcript_path: PathBuf,
    commands_path: PathBuf,
    interaction_path: PathBuf,
    state_path: PathBuf,
    meta_path: PathBuf,
    /// None after close.
    transcript: Option<File>,
}

impl SessionLogger {
    /// Create the session directory and open the transcript for appending.
    pub fn create(base_dir: &Path, session_id: &str) -> Result<Self> {
        let safe = safe_id(session_id);
        let session_dir = base_dir.join("sessions").join(&safe);
        fs::create_dir_all(&session_dir)
            .with_context(|| format!("Failed to create session dir {}", session_dir.display()))?;

        let transcript_path = session_dir.join("transcript.log");
        let transcript = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&transcript_path)
            .with_context(|| format!("Failed to open {}", transcript_path.display()))?;

        Ok(Self {
            session_id: session_id.to_string(),
            safe_id: safe,
            base_dir: base_dir.to_path_buf(),
            transcript_path,
            commands_path: session_dir.join("commands.log"),
            interaction_path: session_dir.join("interaction.log"),
            state_path: session_dir.join("state.json"),
            meta_path: session_dir.join("session.json"),
            session_dir,
            transcript: Some(transcript),
        })
    }

    pub fn safe_id(&self) -> &str {
        &self.safe_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn transcript_path(&self) -> &Path {
        &self.transcript_path
    }

    /// Append raw child bytes to the transcript, flushing immediately.
    pub fn append_transcript(&mut self, bytes: &[u8]) {
        let Some(file) = self.transcript.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(bytes).and_then(|()| file.flush()) {
            log::warn!("transcript write failed for {}: {}", self.session_id, e);
        }
    }

    /// Record one input operation: `[<iso8601>] <quoted-input>`.
    pub fn append_command(&self, input: &str) {
        let line = format!("[{}] {:?}\n", now_iso(), input);
        if let Err(e) = append_line(&self.commands_path, &line) {
            log::warn!("commands.log write failed for {}: {}", self.session_id, e);
        }
    }

    /// Record one completed operation with its final status and output.
    pub fn append_interaction(&self, status: &str, input: &str, output: &str) {
        let mut record = format!("[{}] status={} input={:?}\n", now_iso(), status, input);
        record.push_str(output);
        if !output.ends_with('\n') {
            record.push('\n');
        }
        record.push('\n');
        if let Err(e) = append_line(&self.interaction_path, &record) {
            log::warn!(
                "interaction.log write failed for {}: {}",
                self.session_id,
                e
            );
        }
    }

    /// Persist renderer status to `state.json`.
    pub fn write_state(&self, vt100_ok: bool, vt100_error: Option<&str>) {
        let state = RendererState {
            vt100_ok,
            vt100_error: vt100_error.map(str::to_string),
            transcript: self.transcript_path.display().to_string(),
        };
        self.write_json(&self.state_path, &state);
    }

    /// Persist session metadata. `start_time` and `initial_cwd` from an
    /// existing file win, so a rewrite never moves the session's origin.
    pub fn write_meta(&self, pid: Option<u32>, initial_cwd: &str, rows: u16, cols: u16) {
        self.write_meta_inner(pid, initial_cwd, rows, cols, None);
    }

    /// Persist metadata with an end timestamp; only orderly termination calls
    /// this.
    pub fn write_meta_ended(&self, pid: Option<u32>, initial_cwd: &str, rows: u16, cols: u16) {
        self.write_meta_inner(pid, initial_cwd, rows, cols, Some(now_iso()));
    }

    fn write_meta_inner(
        &self,
        pid: Option<u32>,
        initial_cwd: &str,
        rows: u16,
        cols: u16,
        end_time: Option<String>,
    ) {
        let mut meta = SessionMeta {
            session_id: self.session_id.clone(),
            safe_id: self.safe_id.clone(),
            start_time: now_iso(),
            end_time,
            pid,
            initial_cwd: initial_cwd.to_string(),
            rows,
            cols,
        };
        if let Ok(contents) = fs::read_to_string(&self.meta_path) {
            if let Ok(existing) = serde_json::from_str::<SessionMeta>(&contents) {
                meta.start_time = existing.start_time;
                meta.initial_cwd = existing.initial_cwd;
            }
        }
        self.write_json(&self.meta_path, &meta);
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) {
        if let Err(first) = write_json_atomic(path, value) {
            // Retry once; persistent failure is logged, not surfaced.
            if let Err(second) = write_json_atomic(path, value) {
                log::warn!(
                    "atomic write of {} failed twice: {}; {}",
                    path.display(),
                    first,
                    second
                );
            }
        }
    }

    /// Create (or replace) the active pointer for this session.
    /// Last-write-wins across driver processes.
    pub fn ensure_active_pointer(&self) {
        let active_dir = self.base_dir.join("active");
        let link = active_dir.join(&self.safe_id);
        let result = fs::create_dir_all(&active_dir).and_then(|()| {
            if link.symlink_metadata().is_ok() {
                fs::remove_file(&link)?;
            }
            std::os::unix::fs::symlink(&self.session_dir, &link)
        });
        if let Err(e) = result {
            log::warn!("active pointer create failed for {}: {}", self.safe_id, e);
        }
    }

    /// Remove the active pointer, if present.
    pub fn remove_active_pointer(&self) {
        let link = self.base_dir.join("active").join(&self.safe_id);
        if link.symlink_metadata().is_ok() {
            if let Err(e) = fs::remove_file(&link) {
                log::warn!("active pointer remove failed for {}: {}", self.safe_id, e);
            }
        }
    }

    /// Orderly shutdown: close the transcript, stamp the end time, and drop
    /// the active pointer. Safe to call more than once.
    pub fn close(&mut self, pid: Option<u32>, initial_cwd: &str, rows: u16, cols: u16) {
        self.transcript = None;
        self.write_meta_ended(pid, initial_cwd, rows, cols);
        self.remove_active_pointer();
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_vec_pretty(value).context("Failed to serialize")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &contents)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn safe_id_replaces_unsafe_characters() {
        assert_eq!(safe_id("my session/1"), "my_session_1");
        assert_eq!(safe_id("abc-123.x"), "abc-123.x");
    }

    #[test]
    fn safe_id_strips_separators_and_falls_back_to_default() {
        assert_eq!(safe_id("___"), "default");
        assert_eq!(safe_id(""), "default");
        assert_eq!(safe_id("..session.."), "session");
    }

    #[test]
    fn transcript_appends_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut logger = SessionLogger::create(dir.path(), "s1").unwrap();
        logger.append_transcript(b"first ");
        logger.append_transcript(b"second");
        let contents = fs::read_to_string(logger.transcript_path()).unwrap();
        assert_eq!(contents, "first second");

        // A second logger for the same id appends, never rewrites.
        drop(logger);
        let mut logger = SessionLogger::create(dir.path(), "s1").unwrap();
        logger.append_transcript(b" third");
        let contents = fs::read_to_string(logger.transcript_path()).unwrap();
        assert_eq!(contents, "first second third");
    }

    #[test]
    fn command_log_quotes_input() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::create(dir.path(), "s1").unwrap();
        logger.append_command("echo 'hi'\n");
        let contents = fs::read_to_string(dir.path().join("sessions/s1/commands.log")).unwrap();
        assert!(contents.contains("\"echo 'hi'\\n\""));
        assert!(contents.starts_with('['));
    }

    #[test]
    fn interaction_log_records_status_input_and_output() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::create(dir.path(), "s1").unwrap();
        logger.append_interaction("quiescent", "pwd\n", "/tmp");
        let contents =
            fs::read_to_string(dir.path().join("sessions/s1/interaction.log")).unwrap();
        assert!(contents.contains("status=quiescent"));
        assert!(contents.contains("input=\"pwd\\n\""));
        assert!(contents.contains("/tmp\n\n"));
    }

    #[test]
    fn state_json_is_valid_and_replaced_atomically() {
        let dir = TempDir::new().unwrap();
        let logger = SessionLogger::create(dir.path(), "s1").unwrap();
        logger.write_state(true, None);
        logger.write_state(false, Some("parse error"));
        let contents = fs::read_to_string(dir.path().join("sessions/s1/state.json")).unwrap();
        let state: RendererState = serde_json::from_str(&contents).unwrap();
        assert!(!state.vt100_ok);
        assert_eq!(state.vt100_error.as_deref(), Some("parse error"));
        // No leftover temp file.
        assert!(!dir.path().join("sessions/s1/state.json.tmp").exists());
    }

    #[test]
    fn meta_preserves_start_time_and_gains_end_time_on_close() {
        let dir = TempDir::new().unwrap();
        let mut logger = SessionLogger::create(dir.path(), "s1").unwrap();
        logger.write_meta(Some(42), "/tmp", 24, 80);
        let first: SessionMeta = serde_json::from_str(
            &fs::read_to_string(dir.path().join("sessions/s1/session.json")).unwrap(),
        )
        .unwrap();
        assert!(first.end_time.is_none());

        logger.close(Some(42), "/tmp", 24, 80);
        let second: SessionMeta = serde_json::from_str(
            &fs::read_to_string(dir.path().join("sessions/s1/session.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(second.start_time, first.start_time);
        assert!(second.end_time.is_some());
    }

    #[test]
    fn active_pointer_tracks_liveness() {
        let dir = TempDir::new().unwrap();
        let mut logger = SessionLogger::create(dir.path(), "s1").unwrap();
        logger.ensure_active_pointer();
        let link = dir.path().join("active/s1");
        assert!(link.symlink_metadata().is_ok());
        assert_eq!(fs::read_link(&link).unwrap(), logger.session_dir());

        logger.close(None, "/tmp", 24, 80);
        assert!(link.symlink_metadata().is_err());
    }
}
