//! Byte links to the device.
//!
//! A [`Channel`] is nothing more than an async byte duplex. The session
//! layer builds the raw REPL protocol on top of it; the implementations here
//! only know how to open a serial port, a TCP socket, or a pty attached to a
//! local interpreter process.

pub mod config;
mod process;
mod serial;

pub use config::{ProcessConfig, SerialConfig, Target};
pub use process::{ChildProcess, ProcessChannel};
pub use serial::open_serial;

use std::io;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

use crate::error::{Result, TransportError};

/// Minimal byte-duplex capability the session engine drives.
///
/// Reads and writes come from the tokio `AsyncRead`/`AsyncWrite` supertraits;
/// `close` is `AsyncWriteExt::shutdown`.
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Name of the remote end, for logs and errors.
    fn name(&self) -> String {
        "channel".to_string()
    }
}

impl Channel for TcpStream {
    fn name(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => format!("socket://{}", addr),
            Err(_) => "socket".to_string(),
        }
    }
}

impl Channel for tokio_serial::SerialStream {
    fn name(&self) -> String {
        use tokio_serial::SerialPort;
        SerialPort::name(self).unwrap_or_else(|| "serial".to_string())
    }
}

/// In-memory channel, used by test doubles and embedders.
impl Channel for DuplexStream {
    fn name(&self) -> String {
        "duplex".to_string()
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn name(&self) -> String {
        (**self).name()
    }
}

/// Open the link described by `target`.
pub async fn connect(target: &Target) -> Result<Box<dyn Channel>> {
    debug!("connecting to {}", target);
    let channel: Box<dyn Channel> = match target {
        Target::Serial(cfg) => Box::new(open_serial(cfg).await?),
        Target::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|source| TransportError::ConnectionFailed {
                    target: target.describe(),
                    source,
                })?;
            stream.set_nodelay(true).map_err(TransportError::Io)?;
            Box::new(stream)
        }
        Target::Process(cfg) => Box::new(ProcessChannel::spawn(cfg)?),
    };
    Ok(channel)
}

/// Messages carried by I/O errors when a USB serial device is unplugged.
const DISCONNECT_MESSAGES: &[&str] = &["Write timeout", "Device disconnected", "ClearCommError failed"];

/// Whether an I/O error means the device went away.
///
/// This looks only at transport-level signals (errno 5 / EIO, connection
/// kinds, and known driver messages), never at protocol content.
pub fn is_disconnect(err: &io::Error) -> bool {
    if err.raw_os_error() == Some(5) {
        return true;
    }

    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    ) {
        return true;
    }

    let message = err.to_string();
    DISCONNECT_MESSAGES.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_disconnect_eio() {
        assert!(is_disconnect(&io::Error::from_raw_os_error(5)));
    }

    #[test]
    fn test_is_disconnect_kinds() {
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::TimedOut)));
    }

    #[test]
    fn test_is_disconnect_messages() {
        let err = io::Error::new(io::ErrorKind::Other, "ClearCommError failed (OSError(22))");
        assert!(is_disconnect(&err));
        let err = io::Error::new(io::ErrorKind::Other, "permission denied");
        assert!(!is_disconnect(&err));
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = Target::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let err = connect(&target).await.err().unwrap();
        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::ConnectionFailed { .. })
        ));
    }
}
