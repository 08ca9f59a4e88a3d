//! Error types for mpwire.

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Main error type for mpwire operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Byte link errors (serial, TCP, pty)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Raw REPL wire protocol violations and timeouts
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session misuse (wrong mode, overlapping commands)
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Bridge/redirector errors
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// The command ran but the device reported an error on stderr.
    #[error("Execution failed: {}", String::from_utf8_lossy(stderr).trim())]
    Execution { stdout: Bytes, stderr: Bytes },
}

impl Error {
    /// Whether this error means the underlying link went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Transport(TransportError::Disconnected) => true,
            Error::Transport(TransportError::Io(e)) => crate::transport::is_disconnect(e),
            _ => false,
        }
    }

    /// Whether the session must be re-entered from Normal mode before reuse.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            Error::Protocol(
                ProtocolError::Timeout { .. }
                    | ProtocolError::FirstEofTimeout { .. }
                    | ProtocolError::SecondEofTimeout { .. }
                    | ProtocolError::RawPasteIncomplete { .. }
                    | ProtocolError::UnexpectedRawPasteByte { .. }
                    | ProtocolError::CommandTimeout(_)
            )
        )
    }
}

/// Transport layer errors (opening and driving the byte link).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to open the link
    #[error("Failed to access {target}: {source}")]
    ConnectionFailed {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Serial port configuration or open error
    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Pseudo-terminal or child process error
    #[error("PTY error: {0}")]
    Pty(String),

    /// The remote end vanished
    #[error("Device disconnected")]
    Disconnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Wire-level protocol errors.
///
/// Every variant that waits on the device carries the bytes seen so far.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// An expected trailer never arrived.
    #[error("Timed out after {after:?} waiting for {expected:?}; received {observed:?}")]
    Timeout {
        expected: ByteStr,
        observed: ByteStr,
        after: Duration,
    },

    /// stdout never finished.
    #[error("Timeout waiting for first EOF reception; received {observed:?}")]
    FirstEofTimeout { observed: ByteStr },

    /// stderr never finished.
    #[error("Timeout waiting for second EOF reception; received {observed:?}")]
    SecondEofTimeout { observed: ByteStr },

    /// The device did not answer `OK` to a submitted command.
    #[error("Could not exec command (response: {response:?})")]
    SubmissionRejected { response: ByteStr },

    /// The reply to the raw-paste request was not a known code.
    #[error("Unknown raw-paste reply: {reply:?}")]
    UnknownRawPasteReply { reply: ByteStr },

    /// A byte other than credit or abort arrived during raw-paste.
    #[error("Unexpected read during raw paste: {byte:#04x}")]
    UnexpectedRawPasteByte { byte: u8 },

    /// The device never acknowledged the end of a raw-paste body.
    #[error("Could not complete raw paste; received {observed:?}")]
    RawPasteIncomplete { observed: ByteStr },

    /// The whole command overran its deadline.
    #[error("Command did not finish within {0:?}")]
    CommandTimeout(Duration),

    /// Device output could not be parsed as the requested value.
    #[error("Could not decode evaluated value {raw:?}: {source}")]
    Decode {
        raw: ByteStr,
        #[source]
        source: serde_json::Error,
    },
}

/// Session-level misuse errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Raw operations require a successful `enter()` first.
    #[error("Session is not in raw REPL mode - call enter() first")]
    NotInRawMode,

    /// A command has been submitted and not yet collected.
    #[error("A command is already in flight on this channel")]
    CommandInFlight,

    /// `collect()` called with nothing submitted.
    #[error("No command in flight")]
    NothingInFlight,

    /// Invalid configuration in the session builder
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Bridge/redirector errors.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Could not bind the listening socket
    #[error("Could not bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Respawning the interpreter failed; fatal to the client session.
    #[error("Process restart failed: {0}")]
    RestartFailed(String),

    /// Initial spawn failed
    #[error("Failed to start {program}: {message}")]
    SpawnFailed { program: String, message: String },
}

/// Byte string wrapper whose `Debug` renders like a Python bytes literal.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ByteStr(pub Bytes);

impl ByteStr {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for ByteStr {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for ByteStr {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<Vec<u8>> for ByteStr {
    fn from(b: Vec<u8>) -> Self {
        Self(Bytes::from(b))
    }
}

impl fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("b\"")?;
        for &b in self.0.iter() {
            match b {
                b'\r' => f.write_str("\\r")?,
                b'\n' => f.write_str("\\n")?,
                b'\t' => f.write_str("\\t")?,
                b'"' => f.write_str("\\\"")?,
                b'\\' => f.write_str("\\\\")?,
                0x20..=0x7e => write!(f, "{}", b as char)?,
                _ => write!(f, "\\x{:02x}", b)?,
            }
        }
        f.write_str("\"")
    }
}

/// Result type alias using mpwire's Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytestr_debug_escapes_controls() {
        let s = ByteStr::from(&b"raw REPL\r\n>\x04"[..]);
        assert_eq!(format!("{:?}", s), r#"b"raw REPL\r\n>\x04""#);
    }

    #[test]
    fn test_timeout_poisons_session() {
        let err: Error = ProtocolError::FirstEofTimeout {
            observed: ByteStr::default(),
        }
        .into();
        assert!(err.poisons_session());

        let err: Error = ProtocolError::SubmissionRejected {
            response: ByteStr::from(&b"XX"[..]),
        }
        .into();
        assert!(!err.poisons_session());
    }

    #[test]
    fn test_execution_error_display_trims_stderr() {
        let err = Error::Execution {
            stdout: Bytes::new(),
            stderr: Bytes::from_static(b"Traceback...\r\nNameError: x\r\n"),
        };
        assert_eq!(err.to_string(), "Execution failed: Traceback...\r\nNameError: x");
    }

    #[test]
    fn test_disconnect_classification() {
        let err: Error = TransportError::Disconnected.into();
        assert!(err.is_disconnect());

        let err: Error = TransportError::Io(io::Error::from_raw_os_error(5)).into();
        assert!(err.is_disconnect());

        let err: Error = SessionError::NotInRawMode.into();
        assert!(!err.is_disconnect());
    }
}
