//! Session manager: id → PTY registry with tombstones and LRU eviction.
//!
//! The registry lock protects only lookup, insert, and LRU bookkeeping; it is
//! never held while an engine operation (spawn, drain, terminate) runs, so
//! slow sessions cannot stall each other.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use regex::Regex;

use crate::artifacts::SessionLogger;
use crate::pty::{PtySession, SpawnOptions};

use super::types::{RegistryState, SessionConfig, SessionId, SessionInfo};

/// Default capacity bound; the least-recently-used live session is evicted
/// when a creation would exceed it.
pub const DEFAULT_MAX_SESSIONS: usize = 32;

/// Why a registry operation could not produce a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Unknown id; the caller should create it first.
    NotFound,
    /// Tombstoned id; it will never be live again.
    Terminated,
    /// Bad caller input (cwd, regex, ...).
    InvalidArgument(String),
    /// The PTY could not be spawned.
    Spawn(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotFound => write!(f, "no such session"),
            SessionError::Terminated => write!(f, "session terminated"),
            SessionError::InvalidArgument(msg) => write!(f, "{msg}"),
            SessionError::Spawn(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// A live session: the PTY plus mutable bookkeeping.
pub struct LiveSession {
    pub pty: PtySession,
    description: Mutex<Option<String>>,
    prompt_regex: Mutex<Option<(String, Regex)>>,
    last_used: Mutex<Instant>,
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession").finish_non_exhaustive()
    }
}

impl LiveSession {
    fn new(pty: PtySession, config: &SessionConfig) -> anyhow::Result<Self> {
        let prompt_regex = match &config.prompt_regex {
            Some(src) => Some((src.clone(), Regex::new(src)?)),
            None => None,
        };
        Ok(Self {
            pty,
            description: Mutex::new(config.description.clone()),
            prompt_regex: Mutex::new(prompt_regex),
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *lock(&self.last_used)
    }

    pub fn description(&self) -> Option<String> {
        lock(&self.description).clone()
    }

    pub fn set_description(&self, description: Option<String>) {
        *lock(&self.description) = description;
    }

    /// Compiled prompt regex; `Regex` clones share the compiled program.
    pub fn prompt_regex(&self) -> Option<Regex> {
        lock(&self.prompt_regex).as_ref().map(|(_, re)| re.clone())
    }

    pub fn set_prompt_regex(&self, source: Option<String>) -> Result<(), SessionError> {
        let compiled = match source {
            Some(src) => {
                let re = Regex::new(&src).map_err(|e| {
                    SessionError::InvalidArgument(format!("invalid prompt regex: {e}"))
                })?;
                Some((src, re))
            }
            None => None,
        };
        *lock(&self.prompt_regex) = compiled;
        Ok(())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.pty.session_id().to_string(),
            state: RegistryState::Live,
            is_alive: self.pty.is_alive(),
            pid: self.pty.pid(),
            cwd: Some(self.pty.cwd().to_string()),
            rows: Some(self.pty.rows()),
            cols: Some(self.pty.cols()),
            description: self.description(),
            prompt_regex: lock(&self.prompt_regex)
                .as_ref()
                .map(|(src, _)| src.clone()),
            transcript: Some(self.pty.transcript_path().display().to_string()),
        }
    }
}

enum Entry {
    Configured(SessionConfig),
    Live(Arc<LiveSession>),
    Tombstone,
}

/// Maps session ids to PTYs.
pub struct SessionManager {
    base_dir: std::path::PathBuf,
    max_sessions: usize,
    registry: Mutex<HashMap<SessionId, Entry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionManager {
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Self {
        Self::with_capacity(base_dir, DEFAULT_MAX_SESSIONS)
    }

    pub fn with_capacity(base_dir: impl Into<std::path::PathBuf>, max_sessions: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_sessions: max_sessions.max(1),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session, or return the existing live one when the cwd agrees.
    ///
    /// `cwd` must be an existing absolute directory. Stored configuration
    /// from a prior `configure` is applied; `description`/`prompt_regex`
    /// arguments override it.
    pub fn create(
        &self,
        id: &str,
        cwd: &str,
        description: Option<String>,
        prompt_regex: Option<String>,
    ) -> Result<Arc<LiveSession>, SessionError> {
        let path = Path::new(cwd);
        if !path.is_absolute() {
            return Err(SessionError::InvalidArgument(format!(
                "cwd must be an absolute path, got {cwd:?}"
            )));
        }
        if !path.is_dir() {
            return Err(SessionError::InvalidArgument(format!(
                "cwd is not an existing directory: {cwd:?}"
            )));
        }
        if let Some(src) = &prompt_regex {
            Regex::new(src).map_err(|e| {
                SessionError::InvalidArgument(format!("invalid prompt regex: {e}"))
            })?;
        }

        // Phase 1, under the registry lock: resolve the id, pick an evictee.
        let (mut config, evictee) = {
            let mut registry = lock(&self.registry);
            let config = match registry.get(id) {
                Some(Entry::Tombstone) => return Err(SessionError::Terminated),
                Some(Entry::Live(existing)) => {
                    if existing.pty.cwd() != cwd {
                        return Err(SessionError::InvalidArgument(format!(
                            "session {id:?} is already running in {:?}",
                            existing.pty.cwd()
                        )));
                    }
                    let existing = Arc::clone(existing);
                    existing.touch();
                    if let Some(desc) = description {
                        existing.set_description(Some(desc));
                    }
                    if prompt_regex.is_some() {
                        existing.set_prompt_regex(prompt_regex)?;
                    }
                    return Ok(existing);
                }
                Some(Entry::Configured(config)) => config.clone(),
                None => SessionConfig::default(),
            };

            let live_count = registry
                .values()
                .filter(|e| matches!(e, Entry::Live(_)))
                .count();
            let evictee = if live_count >= self.max_sessions {
                let oldest = registry
                    .iter()
                    .filter_map(|(id, entry)| match entry {
                        Entry::Live(live) => Some((id.clone(), live.last_used())),
                        _ => None,
                    })
                    .min_by_key(|(_, used)| *used)
                    .map(|(id, _)| id);
                oldest.and_then(|victim| {
                    match registry.insert(victim.clone(), Entry::Tombstone) {
                        Some(Entry::Live(live)) => Some((victim, live)),
                        _ => None,
                    }
                })
            } else {
                None
            };
            (config, evictee)
        };

        // Phase 2, lock released: slow work.
        if let Some((victim_id, victim)) = evictee {
            log::info!("evicting least-recently-used session {}", victim_id);
            victim.pty.terminate();
        }

        if let Some(desc) = description {
            config.description = Some(desc);
        }
        if let Some(re) = prompt_regex {
            config.prompt_regex = Some(re);
        }

        let logger = SessionLogger::create(&self.base_dir, id)
            .map_err(|e| SessionError::Spawn(format!("{e:#}")))?;
        let options = SpawnOptions {
            shell: config.shell.clone(),
            args: config.shell_args.clone(),
            rows: config.rows,
            cols: config.cols,
        };
        let pty = PtySession::spawn(id, path, &options, logger)
            .map_err(|e| SessionError::Spawn(format!("{e:#}")))?;
        let live = Arc::new(
            LiveSession::new(pty, &config).map_err(|e| SessionError::Spawn(format!("{e:#}")))?,
        );

        lock(&self.registry).insert(id.to_string(), Entry::Live(Arc::clone(&live)));
        Ok(live)
    }

    /// Resolve a live session and bump its last-used timestamp.
    pub fn get(&self, id: &str) -> Result<Arc<LiveSession>, SessionError> {
        let registry = lock(&self.registry);
        match registry.get(id) {
            Some(Entry::Live(live)) => {
                live.touch();
                Ok(Arc::clone(live))
            }
            Some(Entry::Tombstone) => Err(SessionError::Terminated),
            Some(Entry::Configured(_)) | None => Err(SessionError::NotFound),
        }
    }

    /// Store or update configuration. Works before creation (the config is
    /// applied when the session is created) and on a live session
    /// (propagated immediately). Geometry/shell changes require the session
    /// to not exist yet.
    pub fn configure(
        &self,
        id: &str,
        description: Option<String>,
        prompt_regex: Option<String>,
    ) -> Result<(), SessionError> {
        let mut registry = lock(&self.registry);
        match registry.get_mut(id) {
            Some(Entry::Tombstone) => Err(SessionError::Terminated),
            Some(Entry::Live(live)) => {
                if let Some(desc) = description {
                    live.set_description(Some(desc));
                }
                if prompt_regex.is_some() {
                    live.set_prompt_regex(prompt_regex)?;
                }
                live.touch();
                Ok(())
            }
            Some(Entry::Configured(config)) => {
                if description.is_some() {
                    config.description = description;
                }
                if let Some(src) = prompt_regex {
                    Regex::new(&src).map_err(|e| {
                        SessionError::InvalidArgument(format!("invalid prompt regex: {e}"))
                    })?;
                    config.prompt_regex = Some(src);
                }
                Ok(())
            }
            None => {
                if let Some(src) = &prompt_regex {
                    Regex::new(src).map_err(|e| {
                        SessionError::InvalidArgument(format!("invalid prompt regex: {e}"))
                    })?;
                }
                registry.insert(
                    id.to_string(),
                    Entry::Configured(SessionConfig {
                        description,
                        prompt_regex,
                        ..SessionConfig::default()
                    }),
                );
                Ok(())
            }
        }
    }

    /// All known ids with their registry state, sorted by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        let registry = lock(&self.registry);
        let mut infos: Vec<SessionInfo> = registry
            .iter()
            .map(|(id, entry)| match entry {
                Entry::Live(live) => live.info(),
                Entry::Configured(config) => SessionInfo {
                    session_id: id.clone(),
                    state: RegistryState::Configured,
                    is_alive: false,
                    pid: None,
                    cwd: None,
                    rows: Some(config.rows),
                    cols: Some(config.cols),
                    description: config.description.clone(),
                    prompt_regex: config.prompt_regex.clone(),
                    transcript: None,
                },
                Entry::Tombstone => SessionInfo {
                    session_id: id.clone(),
                    state: RegistryState::Terminated,
                    is_alive: false,
                    pid: None,
                    cwd: None,
                    rows: None,
                    cols: None,
                    description: None,
                    prompt_regex: None,
                    transcript: None,
                },
            })
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Terminate a session and tombstone its id. Idempotent on tombstones.
    pub fn terminate(&self, id: &str) -> Result<(), SessionError> {
        let previous = {
            let mut registry = lock(&self.registry);
            if !registry.contains_key(id) {
                return Err(SessionError::NotFound);
            }
            registry.insert(id.to_string(), Entry::Tombstone)
        };
        if let Some(Entry::Live(live)) = previous {
            live.pty.terminate();
        }
        Ok(())
    }

    /// Terminate every live session; used at driver shutdown.
    pub fn terminate_all(&self) {
        let victims: Vec<Arc<LiveSession>> = {
            let mut registry = lock(&self.registry);
            let ids: Vec<SessionId> = registry
                .iter()
                .filter(|(_, e)| matches!(e, Entry::Live(_)))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| match registry.insert(id, Entry::Tombstone) {
                    Some(Entry::Live(live)) => Some(live),
                    _ => None,
                })
                .collect()
        };
        for live in victims {
            live.pty.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, cap: usize) -> SessionManager {
        SessionManager::with_capacity(dir.path().join("state"), cap)
    }

    #[test]
    fn create_rejects_relative_and_missing_cwd() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 4);
        assert!(matches!(
            mgr.create("s", "relative/path", None, None),
            Err(SessionError::InvalidArgument(_))
        ));
        assert!(matches!(
            mgr.create("s", "/definitely/not/a/real/dir", None, None),
            Err(SessionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn get_before_create_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 4);
        assert_eq!(mgr.get("nope").unwrap_err(), SessionError::NotFound);
    }

    #[test]
    fn terminated_id_is_tombstoned_forever() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 4);
        let cwd = dir.path().display().to_string();
        mgr.create("s", &cwd, None, None).unwrap();
        mgr.terminate("s").unwrap();

        assert_eq!(mgr.get("s").unwrap_err(), SessionError::Terminated);
        assert_eq!(
            mgr.create("s", &cwd, None, None).unwrap_err(),
            SessionError::Terminated
        );
        // Terminating again is not an error.
        mgr.terminate("s").unwrap();
    }

    #[test]
    fn create_on_live_id_with_same_cwd_returns_existing() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 4);
        let cwd = dir.path().display().to_string();
        let first = mgr.create("s", &cwd, None, None).unwrap();
        let second = mgr.create("s", &cwd, None, None).unwrap();
        assert_eq!(first.pty.pid(), second.pty.pid());
    }

    #[test]
    fn create_on_live_id_with_other_cwd_is_an_error() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let mgr = manager(&dir, 4);
        mgr.create("s", &dir.path().display().to_string(), None, None)
            .unwrap();
        assert!(matches!(
            mgr.create("s", &other.path().display().to_string(), None, None),
            Err(SessionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn configure_before_create_applies_at_creation() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 4);
        mgr.configure("s", Some("preconfigured".to_string()), None)
            .unwrap();
        let live = mgr
            .create("s", &dir.path().display().to_string(), None, None)
            .unwrap();
        assert_eq!(live.description().as_deref(), Some("preconfigured"));
    }

    #[test]
    fn configure_rejects_invalid_regex() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 4);
        assert!(matches!(
            mgr.configure("s", None, Some("([".to_string())),
            Err(SessionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 2);
        let cwd = dir.path().display().to_string();
        mgr.create("a", &cwd, None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        mgr.create("b", &cwd, None, None).unwrap();
        // Touch "a" so "b" is the oldest.
        mgr.get("a").unwrap();
        mgr.create("c", &cwd, None, None).unwrap();

        assert!(mgr.get("a").is_ok());
        assert_eq!(mgr.get("b").unwrap_err(), SessionError::Terminated);
        assert!(mgr.get("c").is_ok());
    }

    #[test]
    fn list_reports_registry_states() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 4);
        let cwd = dir.path().display().to_string();
        mgr.configure("cfg", Some("later".to_string()), None).unwrap();
        mgr.create("live", &cwd, None, None).unwrap();
        mgr.create("dead", &cwd, None, None).unwrap();
        mgr.terminate("dead").unwrap();

        let infos = mgr.list();
        let state_of = |id: &str| {
            infos
                .iter()
                .find(|i| i.session_id == id)
                .map(|i| i.state)
                .unwrap()
        };
        assert_eq!(state_of("cfg"), RegistryState::Configured);
        assert_eq!(state_of("live"), RegistryState::Live);
        assert_eq!(state_of("dead"), RegistryState::Terminated);
    }

    #[test]
    fn terminate_all_tombstones_every_live_session() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 4);
        let cwd = dir.path().display().to_string();
        mgr.create("a", &cwd, None, None).unwrap();
        mgr.create("b", &cwd, None, None).unwrap();
        mgr.terminate_all();
        assert_eq!(mgr.get("a").unwrap_err(), SessionError::Terminated);
        assert_eq!(mgr.get("b").unwrap_err(), SessionError::Terminated);
    }
}
