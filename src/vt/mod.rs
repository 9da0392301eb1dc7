//! VT100 rendering over the raw child byte stream.
//!
//! Wraps a `vt100::Parser` with degraded-mode tracking: if the emulator ever
//! fails on an escape sequence, the renderer stops feeding it and falls back
//! to a plain-text preview of the most recent captured output. Bytes keep
//! flowing to the transcript and capture buffer regardless.

use std::panic::{self, AssertUnwindSafe};

/// Number of scrollback lines the emulator retains per session.
pub const SCROLLBACK_LINES: usize = 10000;

/// Screen view returned to callers: rendered text plus cursor position.
#[derive(Debug, Clone)]
pub struct ScreenView {
    /// Rendered display, trailing blank lines trimmed.
    pub text: String,
    /// Cursor column.
    pub cursor_x: u16,
    /// Cursor row.
    pub cursor_y: u16,
    /// False when the renderer is degraded and `text` is a preview.
    pub vt100_ok: bool,
}

/// VT100 emulator wrapper with scrollback and a degraded-mode fallback.
pub struct VtRenderer {
    parser: Option<vt100::Parser>,
    rows: u16,
    cols: u16,
    vt100_error: Option<String>,
    /// Last operation's captured output, served while degraded.
    preview: String,
}

impl VtRenderer {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: Some(vt100::Parser::new(rows, cols, SCROLLBACK_LINES)),
            rows,
            cols,
            vt100_error: None,
            preview: String::new(),
        }
    }

    /// Feed raw child bytes into the emulator.
    ///
    /// A panicking parser permanently degrades the renderer; the broken parser
    /// is discarded and later reads serve the preview instead.
    pub fn feed(&mut self, bytes: &[u8]) {
        let Some(parser) = self.parser.as_mut() else {
            return;
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| parser.process(bytes)));
        if let Err(payload) = result {
            let msg = panic_message(&payload);
            log::warn!("vt100 parser failed, rendering degraded: {}", msg);
            self.vt100_error = Some(msg);
            self.parser = None;
        }
    }

    pub fn vt100_ok(&self) -> bool {
        self.parser.is_some()
    }

    /// First parser error, if the renderer is degraded.
    pub fn vt100_error(&self) -> Option<&str> {
        self.vt100_error.as_deref()
    }

    /// Remember the latest operation output for degraded-mode reads.
    pub fn set_preview(&mut self, preview: String) {
        self.preview = preview;
    }

    /// Rendered display lines: each row right-trimmed, leading and trailing
    /// blank lines dropped. Empty when degraded.
    pub fn display_lines(&self) -> Vec<String> {
        let Some(parser) = self.parser.as_ref() else {
            return Vec::new();
        };
        let screen = parser.screen();
        let (rows, cols) = screen.size();
        let mut lines: Vec<String> = Vec::with_capacity(rows as usize);
        for row in 0..rows {
            let mut line = String::with_capacity(cols as usize);
            for col in 0..cols {
                if let Some(cell) = screen.cell(row, col) {
                    line.push_str(&cell.contents());
                }
            }
            let trimmed = line.trim_end();
            if !trimmed.is_empty() || !lines.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
    }

    /// Current screen as text; the preview when degraded.
    pub fn screen_text(&self) -> String {
        if self.parser.is_none() {
            return self.preview.clone();
        }
        self.display_lines().join("\n")
    }

    /// Cursor position as (column, row). (0, 0) when degraded.
    pub fn cursor(&self) -> (u16, u16) {
        match self.parser.as_ref() {
            Some(parser) => {
                let (row, col) = parser.screen().cursor_position();
                (col, row)
            }
            None => (0, 0),
        }
    }

    pub fn view(&self) -> ScreenView {
        let (cursor_x, cursor_y) = self.cursor();
        ScreenView {
            text: self.screen_text(),
            cursor_x,
            cursor_y,
            vt100_ok: self.vt100_ok(),
        }
    }

    /// Scrollback history concatenated with the current display, optionally
    /// truncated to the last `last` lines. The preview when degraded.
    pub fn scrollback_text(&mut self, last: Option<usize>) -> String {
        let Some(parser) = self.parser.as_mut() else {
            return self.preview.clone();
        };

        // Page backwards through the emulator's scrollback: the view at
        // offset o shows a window `rows` tall ending o lines before the live
        // bottom. Walking offsets from the maximum down to 0 in `rows`-sized
        // steps reconstructs the full history without overlap.
        parser.set_scrollback(usize::MAX);
        let total = parser.screen().scrollback();
        let rows = self.rows as usize;

        let mut lines: Vec<String> = Vec::new();
        let mut offset = total;
        parser.set_scrollback(offset);
        lines.extend(render_rows(parser.screen()));
        while offset > 0 {
            let step = offset.min(rows);
            offset -= step;
            parser.set_scrollback(offset);
            let page = render_rows(parser.screen());
            lines.extend(page.into_iter().skip(rows - step));
        }
        parser.set_scrollback(0);

        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        if let Some(k) = last {
            if lines.len() > k {
                lines.drain(..lines.len() - k);
            }
        }
        lines.join("\n")
    }

    /// Discard scrollback history, keeping the current visible screen.
    ///
    /// Tries the xterm erase-saved-lines sequence first; if history survives
    /// that, the parser is reinitialized at the same geometry (scrollback
    /// forcibly empty, current screen discarded). Never touches the child.
    pub fn clear_scrollback(&mut self) {
        self.feed(b"\x1b[3J");
        let Some(parser) = self.parser.as_mut() else {
            return;
        };
        parser.set_scrollback(usize::MAX);
        let remaining = parser.screen().scrollback();
        parser.set_scrollback(0);
        if remaining > 0 {
            self.parser = Some(vt100::Parser::new(self.rows, self.cols, SCROLLBACK_LINES));
        }
    }
}

fn render_rows(screen: &vt100::Screen) -> Vec<String> {
    let (rows, cols) = screen.size();
    (0..rows)
        .map(|row| {
            let mut line = String::with_capacity(cols as usize);
            for col in 0..cols {
                if let Some(cell) = screen.cell(row, col) {
                    line.push_str(&cell.contents());
                }
            }
            line.trim_end().to_string()
        })
        .collect()
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown parser panic".to_string()
    }
}
