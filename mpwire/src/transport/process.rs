//! Pseudo-terminal channel attached to a local interpreter process.
//!
//! portable-pty only hands out blocking `Read`/`Write` halves, so each half
//! gets a dedicated thread and talks to the async side over tokio mpsc
//! channels. Reading after the child exits yields EOF or EIO, which the
//! session and bridge layers treat as a disconnect.

use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use log::{debug, trace, warn};
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use super::Channel;
use super::config::ProcessConfig;
use crate::error::{Result, TransportError};

/// Lifecycle control over a child process standing in for a device.
pub trait ChildProcess {
    /// Whether the child has exited. Never blocks.
    fn has_exited(&mut self) -> bool;

    /// Kill the child (if still running) and reap it.
    fn terminate(&mut self);
}

/// Channel backed by a child process on a pseudo-terminal.
pub struct ProcessChannel {
    name: String,
    output: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
    input: mpsc::UnboundedSender<Bytes>,
    child: Box<dyn Child + Send + Sync>,
    /// Held so the pty stays open for the child's lifetime.
    _master: Box<dyn MasterPty + Send>,
    eof: bool,
}

impl ProcessChannel {
    /// Spawn `config.program` with a fresh pty as stdin/stdout/stderr.
    pub fn spawn(config: &ProcessConfig) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TransportError::Pty(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&config.program);
        cmd.args(&config.args);
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TransportError::Pty(format!("failed to spawn {}: {e}", config.program.display())))?;
        // The child owns the slave side now.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TransportError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TransportError::Pty(format!("failed to take PTY writer: {e}")))?;

        let name = format!("exec:{}", config.program.display());
        let output = spawn_reader(&name, reader)?;
        let input = spawn_writer(&name, writer)?;

        debug!("spawned {} (pid {:?})", name, child.process_id());

        Ok(Self {
            name,
            output,
            pending: Bytes::new(),
            input,
            child,
            _master: pair.master,
            eof: false,
        })
    }

    /// OS process id of the child, if known.
    pub fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }
}

fn spawn_reader(
    name: &str,
    mut reader: Box<dyn Read + Send>,
) -> Result<mpsc::Receiver<io::Result<Bytes>>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::Builder::new()
        .name(format!("{name} reader"))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        trace!("pty read {} bytes", n);
                        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        })
        .map_err(TransportError::Io)?;
    Ok(rx)
}

fn spawn_writer(
    name: &str,
    mut writer: Box<dyn Write + Send>,
) -> Result<mpsc::UnboundedSender<Bytes>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    std::thread::Builder::new()
        .name(format!("{name} writer"))
        .spawn(move || {
            while let Some(data) = rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    warn!("pty write failed: {}", e);
                    break;
                }
            }
        })
        .map_err(TransportError::Io)?;
    Ok(tx)
}

impl ChildProcess for ProcessChannel {
    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} exited: {:?}", self.name, status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("{}: try_wait failed: {}", self.name, e);
                true
            }
        }
    }

    fn terminate(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                warn!("{}: kill failed: {}", self.name, e);
            }
        }
        let _ = self.child.wait();
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl AsyncRead for ProcessChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.output.poll_recv(cx)) {
                Some(Ok(chunk)) => this.pending = chunk,
                Some(Err(e)) => {
                    this.eof = true;
                    return Poll::Ready(Err(e));
                }
                None => {
                    this.eof = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ProcessChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.input.send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Channel for ProcessChannel {
    fn name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_cat_echoes_through_pty() {
        let cfg = ProcessConfig {
            program: "cat".into(),
            args: vec![],
            cwd: None,
        };
        let mut ch = ProcessChannel::spawn(&cfg).unwrap();
        ch.write_all(b"hello\n").await.unwrap();

        let mut seen = Vec::new();
        let mut buf = [0u8; 64];
        while !seen.windows(5).any(|w| w == b"hello") {
            let n = tokio::time::timeout(std::time::Duration::from_secs(5), ch.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }
        assert!(!ch.has_exited());
        ch.terminate();
        assert!(ch.has_exited());
    }
}
