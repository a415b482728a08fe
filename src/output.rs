//! Output buffering for server logs.
//!
//! This module provides the bounded, timestamped `LogBuffer` that holds the
//! recent output of one server, and the ANSI sanitization applied to every
//! line before it is stored.

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-9;]*[A-Za-z]").expect("ANSI escape pattern"));

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A single stored log line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Wall-clock time the line was appended.
    pub timestamp: SystemTime,
    /// Sanitized line content.
    pub text: String,
}

/// A fixed-capacity ring buffer of log lines.
///
/// Lines arrive fully assembled; splitting byte streams is the runner's job.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogEntry>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` holding at most `max_lines` entries.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Sanitizes and appends a line, evicting from the head when full.
    pub fn append(&mut self, line: &str) {
        self.lines.push_back(LogEntry {
            timestamp: SystemTime::now(),
            text: sanitize_line(line),
        });
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Returns a copy of the last `n` entries, oldest first.
    pub fn snapshot(&self, n: usize) -> Vec<LogEntry> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Empties the buffer.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Returns the number of lines currently stored.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns true when the buffer holds no lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Removes ANSI escape sequences and a trailing carriage return.
pub fn sanitize_line(line: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(line, "");
    stripped.trim_end_matches('\r').to_string()
}
