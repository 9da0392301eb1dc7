//! Wire protocol for the tool surface.
//!
//! Requests are a tagged enum (`"op"` selects the operation); every
//! operation's arguments live in their own struct with
//! `deny_unknown_fields`, so a misspelled or unsupported argument key is a
//! deserialization error instead of being silently ignored. Replies are one
//! uniform shape with operation-specific fields left out when absent.

use serde::{Deserialize, Serialize};

use crate::session::SessionInfo;

fn default_run_timeout() -> f64 {
    30.0
}

fn default_poll_timeout() -> f64 {
    0.1
}

fn default_expect_timeout() -> f64 {
    30.0
}

fn default_control_timeout() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

/// Request messages sent by controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Check the driver is alive.
    Ping,

    /// Gracefully shut the driver down, terminating all sessions.
    Shutdown,

    /// Create a session; required before any other per-session op.
    CreateSession(CreateSessionArgs),

    /// Append a newline to `command` and send it.
    Run(RunArgs),

    /// Send exact text, no newline appended.
    SendInput(SendInputArgs),

    /// Send a password with logging and echo disabled.
    SendPassword(SendPasswordArgs),

    /// Send a control key (Ctrl+letter or ESC).
    SendControl(SendControlArgs),

    /// Deliver a signal to the foreground process group.
    SendSignal(SendSignalArgs),

    /// Drain pending output without sending anything.
    PollOutput(PollOutputArgs),

    /// Wait for a regex to appear in the output.
    Expect(ExpectArgs),

    /// Poll until the classifier sees a shell prompt.
    ExpectPrompt(ExpectPromptArgs),

    /// Current rendered screen and cursor.
    GetScreen(GetScreenArgs),

    /// Scrollback history plus current display.
    GetScrollback(GetScrollbackArgs),

    /// Discard renderer history.
    ClearScrollback(ClearScrollbackArgs),

    /// Session metadata.
    GetMetadata(GetMetadataArgs),

    /// All known sessions.
    ListSessions,

    /// Store or update per-session configuration.
    ConfigureSession(ConfigureSessionArgs),

    /// Path of the session transcript file.
    Transcript(TranscriptArgs),

    /// Terminate the session and tombstone its id.
    Terminate(TerminateArgs),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionArgs {
    pub id: String,
    /// Absolute path of an existing directory.
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_prompt_regex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunArgs {
    pub id: String,
    pub command: String,
    #[serde(default = "default_run_timeout")]
    pub timeout: f64,
    #[serde(default = "default_true")]
    pub strip_ansi: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendInputArgs {
    pub id: String,
    pub text: String,
    #[serde(default = "default_run_timeout")]
    pub timeout: f64,
    #[serde(default = "default_true")]
    pub strip_ansi: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendPasswordArgs {
    pub id: String,
    pub password: String,
    #[serde(default = "default_run_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendControlArgs {
    pub id: String,
    /// A single ASCII letter (Ctrl+letter), or `[`/`escape`/`esc` for ESC.
    pub key: String,
    #[serde(default = "default_control_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendSignalArgs {
    pub id: String,
    /// Decimal number or name, with or without the `SIG` prefix.
    pub signal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollOutputArgs {
    pub id: String,
    #[serde(default = "default_poll_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectArgs {
    pub id: String,
    pub pattern: String,
    #[serde(default = "default_expect_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectPromptArgs {
    pub id: String,
    #[serde(default = "default_expect_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetScreenArgs {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetScrollbackArgs {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
    #[serde(default)]
    pub strip_ansi: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClearScrollbackArgs {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetMetadataArgs {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigureSessionArgs {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_prompt_regex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptArgs {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminateArgs {
    pub id: String,
}

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NoSuchSession,
    Terminated,
    Timeout,
    Eof,
    PtyError,
}

/// Uniform reply shape; operations fill the subset of fields they produce.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default)]
    pub output_truncated: bool,
    #[serde(default)]
    pub dropped_bytes: u64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<bool>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<Option<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_x: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_y: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrollback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionInfo>>,
}

impl Reply {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = match kind {
            ErrorKind::Terminated => "terminated",
            ErrorKind::Eof => "eof",
            ErrorKind::Timeout => "timeout",
            _ => "error",
        };
        Self {
            status: status.to_string(),
            error: Some(message.into()),
            error_kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn terminated() -> Self {
        Self {
            status: "terminated".to_string(),
            error_kind: Some(ErrorKind::Terminated),
            ..Self::default()
        }
    }
}

/// Length-prefixed message framing for the transport.
pub mod framing {
    use std::io::{Read, Write};

    use serde::{Deserialize, Serialize};

    /// Upper bound on a single frame; protects against corrupt prefixes.
    const MAX_FRAME: usize = 100 * 1024 * 1024;

    /// Write a message with a little-endian u32 length prefix.
    pub fn write_message<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> std::io::Result<()> {
        let data = serde_json::to_vec(msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let len = data.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&data)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a length-prefixed message.
    pub fn read_message<R: Read, T: for<'de> Deserialize<'de>>(
        reader: &mut R,
    ) -> std::io::Result<T> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_FRAME {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", len),
            ));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
