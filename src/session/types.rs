//! Session registry types.

use serde::{Deserialize, Serialize};

/// Caller-chosen identifier for a session.
pub type SessionId = String;

/// Per-session configuration, applied at creation.
///
/// Geometry and shell are immutable once the PTY exists; `description` and
/// `prompt_regex` may also be changed on a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Regex matched against the last screen line to recognize a custom
    /// prompt the built-in heuristics would miss.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_regex: Option<String>,
}

fn default_rows() -> u16 {
    crate::pty::DEFAULT_ROWS
}

fn default_cols() -> u16 {
    crate::pty::DEFAULT_COLS
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_shell_args() -> Vec<String> {
    vec!["--norc".to_string(), "--noprofile".to_string()]
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            shell: default_shell(),
            shell_args: default_shell_args(),
            description: None,
            prompt_regex: None,
        }
    }
}

/// Where an id stands in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryState {
    /// Config stored, no PTY yet.
    Configured,
    /// PTY attached.
    Live,
    /// Tombstoned; the id can never bind to a new PTY.
    Terminated,
}

/// Summary info about a session, for listing and metadata replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub state: RegistryState,
    pub is_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}
