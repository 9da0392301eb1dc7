//! Terminal state classification.
//!
//! A pure heuristic over the rendered screen decides what the terminal is
//! currently showing: a shell prompt, a REPL, a password prompt, a pager, and
//! so on. Matching is anchored to the bottom of the screen: prompts are read
//! from the last visible line, and password/confirm/error text only counts
//! within the last three lines, so stale scrollback never dominates.
//!
//! An optional external oracle can refine a RUNNING verdict into a finer
//! interactive label. The oracle is never allowed to promote to READY: a
//! prompt-looking line with the cursor at column 0 is the echo of a command
//! that is still running.

use regex::Regex;

/// What the screen is currently showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLabel {
    Ready,
    Running,
    Repl,
    Password,
    Confirm,
    Editor,
    Pager,
    Error,
    Unknown,
}

impl StateLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            StateLabel::Ready => "READY",
            StateLabel::Running => "RUNNING",
            StateLabel::Repl => "REPL",
            StateLabel::Password => "PASSWORD",
            StateLabel::Confirm => "CONFIRM",
            StateLabel::Editor => "EDITOR",
            StateLabel::Pager => "PAGER",
            StateLabel::Error => "ERROR",
            StateLabel::Unknown => "UNKNOWN",
        }
    }

    /// Parse an oracle's label; anything unrecognized is `Unknown`.
    pub fn parse(s: &str) -> StateLabel {
        match s.trim().to_ascii_uppercase().as_str() {
            "READY" => StateLabel::Ready,
            "RUNNING" => StateLabel::Running,
            "REPL" => StateLabel::Repl,
            "PASSWORD" => StateLabel::Password,
            "CONFIRM" => StateLabel::Confirm,
            "EDITOR" => StateLabel::Editor,
            "PAGER" => StateLabel::Pager,
            "ERROR" => StateLabel::Error,
            _ => StateLabel::Unknown,
        }
    }
}

/// External classifier consulted to refine a heuristic RUNNING only.
pub trait StateOracle: Send + Sync {
    fn classify(&self, screen: &str) -> anyhow::Result<(StateLabel, String)>;
}

/// Lines examined for prompt-style matches.
const TAIL_WINDOW: usize = 12;

/// Lines examined for password/confirm/error text.
const RECENT_WINDOW: usize = 3;

const REPL_PROMPTS: [(&str, &str); 12] = [
    (">>>", "python prompt"),
    ("...", "python continuation prompt"),
    ("In [", "ipython prompt"),
    ("Out[", "ipython prompt"),
    ("(Pdb)", "pdb prompt"),
    ("ipdb>", "pdb prompt"),
    ("irb(", "irb prompt"),
    ("pry(", "pry prompt"),
    ("mysql>", "mysql prompt"),
    ("postgres=#", "postgres prompt"),
    ("postgres=>", "postgres prompt"),
    ("sqlite>", "sqlite prompt"),
];

const EDITOR_MARKERS: [&str; 4] = ["-- insert --", "-- normal --", "gnu nano", "^g get help"];

const PASSWORD_MARKERS: [&str; 6] = [
    "password:",
    "passphrase:",
    "[sudo]",
    "secret:",
    "enter password",
    "enter passphrase",
];

const CONFIRM_MARKERS: [&str; 5] = ["[y/n]", "[yes/no]", "continue?", "are you sure", "proceed?"];

const ERROR_MARKERS: [&str; 9] = [
    "error:",
    "failed:",
    "fatal:",
    "exception:",
    "traceback",
    "valueerror",
    "typeerror",
    "keyerror",
    "indexerror",
];

/// Classify a rendered screen.
///
/// `cursor_x` is the cursor column; column 0 under a prompt-looking line
/// means the line is a command echo, not an idle prompt.
pub fn detect_state(
    screen: &str,
    cursor_x: u16,
    prompt_regex: Option<&Regex>,
) -> (StateLabel, String) {
    let mut lines: Vec<&str> = screen.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    let Some(&last) = lines.last() else {
        return (StateLabel::Running, "empty screen".to_string());
    };

    let tail_start = lines.len().saturating_sub(TAIL_WINDOW);
    let tail = &lines[tail_start..];
    let recent_start = lines.len().saturating_sub(RECENT_WINDOW);
    let recent = &lines[recent_start..];

    // 1. REPL prompts on the last line, cursor past the prompt text.
    if cursor_x > 0 {
        for (prompt, reason) in REPL_PROMPTS {
            // A bare "..." is the python continuation prompt; as a suffix it
            // is far more often a trailing "Loading..." style message.
            let hit = if prompt == "..." {
                last == prompt
            } else {
                last.ends_with(prompt) || last.starts_with(prompt)
            };
            if hit {
                return (StateLabel::Repl, (*reason).to_string());
            }
        }
    }

    let tail_lower: Vec<String> = tail.iter().map(|l| l.to_ascii_lowercase()).collect();

    // 2. Editor status lines anywhere in the tail window.
    for marker in EDITOR_MARKERS {
        if tail_lower.iter().any(|l| l.contains(marker)) {
            return (StateLabel::Editor, format!("editor indicator {:?}", marker));
        }
    }

    // 3. Pager: bare colon on the last line, or pager banners in the window.
    if last == ":" {
        return (StateLabel::Pager, "pager prompt".to_string());
    }
    for marker in ["(end)", "manual page"] {
        if tail_lower.iter().any(|l| l.contains(marker)) {
            return (StateLabel::Pager, format!("pager indicator {:?}", marker));
        }
    }

    // 4. Caller-supplied prompt pattern.
    if let Some(re) = prompt_regex {
        if re.is_match(last) {
            if cursor_x == 0 {
                return (
                    StateLabel::Running,
                    "prompt pattern on command echo (cursor at column 0)".to_string(),
                );
            }
            return (StateLabel::Ready, "custom shell prompt".to_string());
        }
    }

    // 5. Shell prompts: $, #, bare > or % at the end of the last line.
    if looks_like_shell_prompt(last) {
        if cursor_x == 0 {
            return (
                StateLabel::Running,
                "shell prompt on command echo (cursor at column 0)".to_string(),
            );
        }
        return (StateLabel::Ready, "shell prompt".to_string());
    }

    let recent_lower: Vec<String> = recent.iter().map(|l| l.to_ascii_lowercase()).collect();

    // 6-8. Interactive prompts and errors must be recent, not scrollback.
    for marker in PASSWORD_MARKERS {
        if recent_lower.iter().any(|l| l.contains(marker)) {
            return (StateLabel::Password, "password prompt".to_string());
        }
    }
    for marker in CONFIRM_MARKERS {
        if recent_lower.iter().any(|l| l.contains(marker)) {
            return (StateLabel::Confirm, "confirmation prompt".to_string());
        }
    }
    for marker in ERROR_MARKERS {
        if recent_lower.iter().any(|l| l.contains(marker)) {
            return (StateLabel::Error, format!("error text {:?}", marker));
        }
    }

    (StateLabel::Running, "no prompt detected".to_string())
}

fn looks_like_shell_prompt(line: &str) -> bool {
    let Some(last_char) = line.chars().last() else {
        return false;
    };
    match last_char {
        '$' | '#' | '>' => {}
        '%' => {
            // "47%" is a progress readout, not a zsh prompt.
            let mut rev = line.chars().rev();
            rev.next();
            if rev.next().is_some_and(|c| c.is_ascii_digit()) {
                return false;
            }
        }
        _ => return false,
    }
    // Progress bars like "[=====>" or "[ 42%]" are not prompts.
    if line.starts_with('[') && !line.ends_with(']') && line.contains('=') {
        return false;
    }
    true
}

/// Full classification: heuristic first, then optional oracle refinement of a
/// RUNNING verdict. Oracle failures fall back to the heuristic with the
/// reason annotated; an oracle READY is ignored.
pub fn determine_state(
    screen: &str,
    cursor_x: u16,
    prompt_regex: Option<&Regex>,
    oracle: Option<&dyn StateOracle>,
) -> (StateLabel, String) {
    let (label, reason) = detect_state(screen, cursor_x, prompt_regex);
    if label != StateLabel::Running {
        return (label, reason);
    }
    let Some(oracle) = oracle else {
        return (label, reason);
    };

    match oracle.classify(screen) {
        Ok((refined, oracle_reason)) => match refined {
            StateLabel::Password
            | StateLabel::Confirm
            | StateLabel::Repl
            | StateLabel::Editor
            | StateLabel::Pager => (refined, oracle_reason),
            StateLabel::Ready => (
                StateLabel::Running,
                format!("{reason}; oracle=READY ignored"),
            ),
            _ => (StateLabel::Running, format!("{reason}; oracle=UNKNOWN")),
        },
        Err(e) => (StateLabel::Running, format!("{reason}; oracle=UNKNOWN ({e})")),
    }
}
