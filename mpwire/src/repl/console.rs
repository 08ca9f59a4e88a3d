//! Console side of the interactive loop: escaping and capture.

use std::io;

use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::protocol::escape_non_printable;

/// Local terminal output, optionally mirrored into a capture file.
pub(crate) struct Console<O> {
    output: O,
    capture: Option<File>,
    escape: bool,
}

impl<O: AsyncWrite + Unpin> Console<O> {
    pub fn new(output: O, capture: Option<File>, escape: bool) -> Self {
        Self {
            output,
            capture,
            escape,
        }
    }

    /// Show bytes received from the device.
    pub async fn device_output(&mut self, data: &[u8]) -> io::Result<()> {
        if self.escape {
            let escaped = escape_non_printable(data);
            self.write(&escaped).await
        } else {
            self.write(data).await
        }
    }

    /// Write local messages or device output.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.output.write_all(data).await?;
        self.output.flush().await?;
        if let Some(capture) = &mut self.capture {
            capture.write_all(data).await?;
            capture.flush().await?;
        }
        Ok(())
    }
}
