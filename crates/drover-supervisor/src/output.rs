//! Captured output lines.

use chrono::{DateTime, Utc};
use std::fmt;

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    /// Suffix used for per-stream log files.
    pub fn log_suffix(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "out",
            OutputStream::Stderr => "err",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line read from a supervised process.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: DateTime<Utc>,
}

impl OutputLine {
    pub fn new(stream: OutputStream, content: impl Into<String>, line_number: u32) -> Self {
        Self {
            stream,
            content: content.into(),
            line_number,
            timestamp: Utc::now(),
        }
    }
}
