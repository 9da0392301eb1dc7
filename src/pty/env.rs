//! Child environment construction.
//!
//! The child gets a terminal identity (`TERM`, `LINES`, `COLUMNS`) and a
//! cleaned inherited environment: Python virtualenv variables leak from the
//! process that launched the driver and would change what the child's shell
//! resolves, so they are dropped, along with any `PATH` entry that points into
//! a virtualenv `bin` directory.

use std::path::Path;

/// Environment variables never passed through to the child.
const DROPPED_VARS: [&str; 5] = [
    "VIRTUAL_ENV",
    "VIRTUAL_ENV_PROMPT",
    "PYTHONHOME",
    "PYTHONPATH",
    "__PYVENV_LAUNCHER__",
];

/// Build the child environment from an inherited variable set.
///
/// Returns `(key, value)` pairs: the inherited set minus the dropped
/// variables, with `PATH` filtered and the terminal identity appended.
pub fn sanitize(
    vars: impl Iterator<Item = (String, String)>,
    rows: u16,
    cols: u16,
) -> Vec<(String, String)> {
    let vars: Vec<(String, String)> = vars.collect();
    let venv_bin = vars
        .iter()
        .find(|(k, _)| k == "VIRTUAL_ENV")
        .map(|(_, v)| Path::new(v).join("bin"));

    let mut out: Vec<(String, String)> = Vec::with_capacity(vars.len() + 3);
    for (key, value) in vars {
        if DROPPED_VARS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "PATH" => {
                let filtered = filter_path(&value, venv_bin.as_deref());
                out.push((key, filtered));
            }
            "TERM" | "LINES" | "COLUMNS" => {}
            _ => out.push((key, value)),
        }
    }
    out.push(("TERM".to_string(), "xterm-256color".to_string()));
    out.push(("LINES".to_string(), rows.to_string()));
    out.push(("COLUMNS".to_string(), cols.to_string()));
    out
}

/// Convenience wrapper over the current process environment.
pub fn sanitized_env(rows: u16, cols: u16) -> Vec<(String, String)> {
    sanitize(std::env::vars(), rows, cols)
}

fn filter_path(path: &str, venv_bin: Option<&Path>) -> String {
    let kept: Vec<&str> = path
        .split(':')
        .filter(|entry| {
            let p = Path::new(entry);
            if venv_bin.is_some_and(|vb| p == vb) {
                return false;
            }
            !is_venv_bin(p)
        })
        .collect();
    kept.join(":")
}

/// A `bin` directory whose parent carries `pyvenv.cfg` belongs to a
/// virtualenv, including the one hosting the currently running interpreter.
fn is_venv_bin(entry: &Path) -> bool {
    if entry.file_name().map(|n| n != "bin").unwrap_or(true) {
        return false;
    }
    entry
        .parent()
        .map(|parent| parent.join("pyvenv.cfg").is_file())
        .unwrap_or(false)
}
