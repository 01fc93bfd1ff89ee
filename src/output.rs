//! Project log files.
//!
//! Processes write straight into their log file; this module reads the tail
//! of that file back for `pmctl logs` and the dashboard's log endpoint.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;

use strip_ansi_escapes::strip;

use crate::error::SupervisorResult;

/// Default number of lines shown by `pmctl logs`.
pub const DEFAULT_TAIL_LINES: usize = 50;
/// Upper bound for a single tail request.
pub const MAX_TAIL_LINES: usize = 5_000;

/// A fixed-capacity ring buffer keeping the most recent lines.
#[derive(Debug, Clone)]
pub struct LogTail {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogTail {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line, returning `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: String) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Reads the last `lines` lines of a log file. A missing file has no lines.
///
/// Invalid UTF-8 is replaced; ANSI escape codes are removed when
/// `strip_ansi` is set.
pub fn read_tail(path: &Path, lines: usize, strip_ansi: bool) -> SupervisorResult<Vec<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    if lines == 0 {
        return Ok(Vec::new());
    }
    let mut tail = LogTail::new(lines.min(MAX_TAIL_LINES));
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let text = String::from_utf8_lossy(&buf);
        tail.push(sanitize_text(&text, strip_ansi));
    }
    Ok(tail.into_lines())
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
