//! Rolling window of recent clean output lines.

use std::collections::VecDeque;

/// Longest trailing partial line kept, in bytes
const MAX_PARTIAL_BYTES: usize = 4096;

/// Recent lines a repainted line is compared against
const REPAINT_SPAN: usize = 8;

/// Bounded sequence of the most recent non-blank lines plus the trailing
/// partial line. Rebuilt from scratch on a full-screen clear.
#[derive(Debug, Clone)]
pub struct OutputWindow {
    lines: VecDeque<String>,
    capacity: usize,
    partial: String,
    /// Characters of new lines committed since the last clear
    committed_chars: usize,
}

impl OutputWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            partial: String::new(),
            committed_chars: 0,
        }
    }

    /// Append clean text. Completed lines enter the window; whatever follows
    /// the last newline stays partial.
    pub fn push(&mut self, text: &str) {
        let mut pieces = text.split('\n');
        if let Some(first) = pieces.next() {
            self.partial.push_str(first);
        }
        for piece in pieces {
            let line = std::mem::replace(&mut self.partial, piece.to_string());
            self.push_line(line);
        }
        self.cap_partial();
    }

    /// Apply a classified chunk, resetting first if the screen was cleared
    pub fn apply(&mut self, text: &str, screen_cleared: bool) {
        if screen_cleared {
            self.reset();
        }
        self.push(text);
    }

    pub fn reset(&mut self) {
        self.lines.clear();
        self.partial.clear();
        self.committed_chars = 0;
    }

    /// The most recent `n` lines, including a non-blank partial line
    pub fn tail(&self, n: usize) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::with_capacity(n);
        let has_partial = !self.partial.trim().is_empty();
        let from_lines = if has_partial { n.saturating_sub(1) } else { n };
        let start = self.lines.len().saturating_sub(from_lines);
        out.extend(self.lines.range(start..).map(String::as_str));
        if has_partial && n > 0 {
            out.push(self.partial.as_str());
        }
        out
    }

    pub fn lines(&self) -> Vec<&str> {
        self.tail(self.capacity + 1)
    }

    /// Window contents joined with newlines
    pub fn contents(&self) -> String {
        self.lines().join("\n")
    }

    /// Character count of the window, used to measure significant change
    pub fn text_len(&self) -> usize {
        self.lines.iter().map(|l| l.chars().count()).sum::<usize>()
            + self.partial.trim().chars().count()
    }

    /// Output produced since the last clear. Keeps growing after the window
    /// is full; lines that repeat a recent line (a repaint) do not count.
    pub fn progress_len(&self) -> usize {
        self.committed_chars + self.partial.trim().chars().count()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.trim().is_empty()
    }

    fn push_line(&mut self, line: String) {
        if line.trim().is_empty() {
            return;
        }
        let repaint = self.lines.iter().rev().take(REPAINT_SPAN).any(|l| *l == line);
        if !repaint {
            self.committed_chars += line.chars().count();
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn cap_partial(&mut self) {
        if self.partial.len() <= MAX_PARTIAL_BYTES {
            return;
        }
        let mut cut = self.partial.len() - MAX_PARTIAL_BYTES;
        while !self.partial.is_char_boundary(cut) {
            cut += 1;
        }
        self.partial.drain(..cut);
    }
}
