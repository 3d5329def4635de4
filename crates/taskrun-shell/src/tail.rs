//! Bounded stderr buffer: keeps only the most recent lines.

use std::collections::VecDeque;

/// Number of stderr lines kept for error reports.
pub const DEFAULT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: VecDeque<String>,
    limit: usize,
    dropped: usize,
}

impl StderrTail {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit.min(64)),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.limit == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines
            .push_back(line.trim_end_matches(['\n', '\r']).to_string());
    }

    /// Feed a whole block of output, line by line.
    pub fn extend_from(&mut self, text: &str) {
        for line in text.lines() {
            self.push(line);
        }
    }

    /// Render the kept lines, prefixed with a marker when earlier lines were dropped.
    pub fn render(&self) -> String {
        let body = self.lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if self.dropped == 0 {
            body
        } else {
            format!("[{} earlier line(s) omitted]\n{}", self.dropped, body)
        }
    }
}

impl Default for StderrTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}

/// Last `limit` lines of `text`, rendered like [`StderrTail::render`].
pub fn tail_lines(text: &str, limit: usize) -> String {
    let mut tail = StderrTail::new(limit);
    tail.extend_from(text);
    tail.render()
}
