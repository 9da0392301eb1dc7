//! Per-operation output capture with head+tail elision.
//!
//! Every engine operation accumulates the bytes it reads into a fresh
//! `CaptureBuffer`. Small outputs are returned whole; once an operation
//! produces more than `max_lines` lines the buffer switches irreversibly to
//! keeping the first `context_lines` and a FIFO window of the most recent
//! `context_lines`, with an elision marker in between. The full byte stream is
//! always available in the session transcript.

use std::collections::VecDeque;

/// Default maximum number of lines returned verbatim.
pub const DEFAULT_MAX_LINES: usize = 100;

/// Default number of head/tail lines kept after the buffer overflows.
pub const DEFAULT_CONTEXT_LINES: usize = 20;

/// Finished capture: the text to return plus accounting for what was dropped.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Captured text (full, or head + elision marker + tail).
    pub output: String,
    /// Every byte fed to the buffer, kept or not.
    pub total_bytes: u64,
    /// Bytes that did not make it into `output` (elided lines).
    pub dropped_bytes: u64,
    /// True iff any bytes were dropped.
    pub truncated: bool,
}

/// Line accumulator for a single engine operation.
pub struct CaptureBuffer {
    max_lines: usize,
    context_lines: usize,
    /// Full line list while small; `None` after the switch to head+tail.
    full: Option<Vec<String>>,
    head: Vec<String>,
    tail: VecDeque<String>,
    total_lines: usize,
    /// Unterminated trailing fragment, held until more input or `finish`.
    line_buf: String,
    /// Set when the last character seen was a bare `\r` (may pair with `\n`).
    pending_cr: bool,
    total_bytes: u64,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_LINES, DEFAULT_CONTEXT_LINES)
    }

    /// `context_lines` is clamped to `max_lines / 2` so head and tail never
    /// overlap.
    pub fn with_limits(max_lines: usize, context_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        let context_lines = context_lines.min(max_lines / 2).max(1);
        Self {
            max_lines,
            context_lines,
            full: Some(Vec::new()),
            head: Vec::new(),
            tail: VecDeque::with_capacity(context_lines),
            total_lines: 0,
            line_buf: String::new(),
            pending_cr: false,
            total_bytes: 0,
        }
    }

    /// Feed a chunk of raw child output. Chunks are split at line boundaries
    /// (`\n`, `\r\n`, or a lone `\r`); an unterminated fragment is held until
    /// the next chunk or `finish`.
    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len() as u64;
        let text = String::from_utf8_lossy(chunk);
        for c in text.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                if c == '\n' {
                    self.line_buf.push(c);
                    self.flush_line();
                    continue;
                }
                self.flush_line();
            }
            self.line_buf.push(c);
            match c {
                '\n' => self.flush_line(),
                '\r' => self.pending_cr = true,
                _ => {}
            }
        }
    }

    fn flush_line(&mut self) {
        let line = std::mem::take(&mut self.line_buf);
        self.total_lines += 1;
        if let Some(full) = self.full.as_mut() {
            full.push(line);
            if full.len() > self.max_lines {
                // Irreversible switch: keep the first and last context_lines,
                // drop the middle from the reply (the transcript has it all).
                let full = self.full.take().unwrap_or_default();
                self.head = full[..self.context_lines].to_vec();
                self.tail = full[full.len() - self.context_lines..]
                    .iter()
                    .cloned()
                    .collect();
            }
        } else {
            if self.tail.len() == self.context_lines {
                self.tail.pop_front();
            }
            self.tail.push_back(line);
        }
    }

    /// Flush any trailing fragment and produce the final text plus accounting.
    pub fn finish(mut self) -> CaptureResult {
        self.pending_cr = false;
        if !self.line_buf.is_empty() {
            self.flush_line();
        }

        if let Some(full) = self.full.take() {
            let output: String = full.concat();
            return CaptureResult {
                output,
                total_bytes: self.total_bytes,
                dropped_bytes: 0,
                truncated: false,
            };
        }

        let head: String = self.head.concat();
        let tail: String = self.tail.iter().map(String::as_str).collect();
        let elided = self
            .total_lines
            .saturating_sub(self.head.len() + self.tail.len());
        let retained = (head.len() + tail.len()) as u64;
        let dropped = self.total_bytes.saturating_sub(retained);
        let output = format!(
            "{}\n\n... [{} lines elided, see transcript] ...\n\n{}",
            head, elided, tail
        );
        CaptureResult {
            output,
            total_bytes: self.total_bytes,
            dropped_bytes: dropped,
            truncated: dropped > 0,
        }
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new()
    }
}
