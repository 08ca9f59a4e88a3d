//! Response type for raw REPL execution results.

use std::borrow::Cow;
use std::time::Duration;

use bytes::Bytes;

use crate::protocol;

/// Output of one completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Everything the command printed before the first sentinel.
    pub stdout: Bytes,

    /// Everything between the first and second sentinel (tracebacks).
    pub stderr: Bytes,

    /// Time from submission to the second sentinel.
    pub elapsed: Duration,
}

impl Response {
    /// Create a new response.
    pub fn new(stdout: impl Into<Bytes>, stderr: impl Into<Bytes>, elapsed: Duration) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            elapsed,
        }
    }

    /// Check if the command ran without writing to stderr.
    pub fn is_success(&self) -> bool {
        self.stderr.is_empty()
    }

    /// Trimmed stderr text, or `None` if the command succeeded.
    pub fn error(&self) -> Option<String> {
        protocol::extract_error(&self.stderr)
    }

    /// stdout as text (lossy UTF-8).
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stdout_str())
    }
}
