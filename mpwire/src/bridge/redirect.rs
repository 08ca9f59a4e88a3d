//! Per-client redirect loop and soft-reboot emulation.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, trace};
use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, MissedTickBehavior};

use super::device::Spawner;
use super::rfc2217::PortManager;
use super::{Bridge, LinkState};
use crate::error::{BridgeError, ByteStr, Error, Result, TransportError};
use crate::protocol::{ENTER_RAW, FRIENDLY_PROMPT, Mode, RAW_REPL_PROMPT, RAW_SOFT_RESET_BANNER, SOFT_REBOOT};
use crate::transport::{self, ChildProcess};

const DEVICE_READ: usize = 4096;
const CLIENT_READ: usize = 1024;

/// Write half of the client connection.
///
/// Everything the client receives goes through [`send`](Self::send).
pub(super) struct ClientSink<W> {
    writer: W,
    sent: u64,
}

impl<W: AsyncWrite + Unpin> ClientSink<W> {
    fn new(writer: W) -> Self {
        Self { writer, sent: 0 }
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.writer.write_all(data).await.map_err(client_io)?;
        self.writer.flush().await.map_err(client_io)?;
        self.sent += data.len() as u64;
        Ok(())
    }

    /// Send whatever negotiation replies the port manager has queued.
    async fn send_replies(&mut self, ports: &mut PortManager) -> Result<()> {
        match ports.take_outgoing() {
            Some(replies) => self.send(&replies).await,
            None => Ok(()),
        }
    }
}

fn client_io(e: io::Error) -> Error {
    if transport::is_disconnect(&e) {
        TransportError::Disconnected.into()
    } else {
        TransportError::Io(e).into()
    }
}

fn restart_failed(reason: impl std::fmt::Display) -> Error {
    BridgeError::RestartFailed(reason.to_string()).into()
}

enum Step {
    Continue,
    Restart,
}

impl<S: Spawner> Bridge<S> {
    /// Serve one client until it disconnects.
    ///
    /// The interpreter is started on first use and left running afterwards.
    /// A failed restart ends the client with [`BridgeError::RestartFailed`]
    /// and drops the interpreter, so the next client starts a fresh one.
    pub async fn handle_client<T>(&mut self, stream: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let mut sink = ClientSink::new(writer);
        let mut ports = PortManager::new();

        self.client = LinkState::Connected;
        let result = self.redirect(&mut reader, &mut sink, &mut ports).await;
        self.client = LinkState::Disconnected;
        debug!("client session ended after {} bytes", sink.sent);
        match result {
            Err(e) if e.is_disconnect() => Ok(()),
            other => other,
        }
    }

    async fn redirect<R, W>(
        &mut self,
        reader: &mut R,
        sink: &mut ClientSink<W>,
        ports: &mut PortManager,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        sink.send_replies(ports).await?;

        if self.device.is_none() {
            info!("starting {}", self.spawner.describe());
            let device = self.spawner.spawn().map_err(|e| BridgeError::SpawnFailed {
                program: self.spawner.describe(),
                message: e.to_string(),
            })?;
            self.device = Some(device);
            self.shadow.set(Mode::Normal);
        }

        let period = self.config.modem_poll;
        let mut poll = tokio::time::interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut from_device = vec![0u8; DEVICE_READ];
        let mut from_client = vec![0u8; CLIENT_READ];

        loop {
            let Some(device) = self.device.as_mut() else {
                return Err(restart_failed("no interpreter process"));
            };

            let step = tokio::select! {
                read = device.read(&mut from_device) => match read {
                    Ok(0) => Step::Restart,
                    Ok(n) => {
                        let data = &from_device[..n];
                        trace!("device -> client {:?}", ByteStr::from(data));
                        self.shadow.outbound(data);
                        sink.send(&ports.escape(data)).await?;
                        Step::Continue
                    }
                    Err(e) if transport::is_disconnect(&e) => Step::Restart,
                    Err(e) => return Err(TransportError::Io(e).into()),
                },

                read = reader.read(&mut from_client) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        let data = ports.filter(&from_client[..n]);
                        sink.send_replies(ports).await?;
                        if data.is_empty() {
                            Step::Continue
                        } else {
                            trace!("client -> device {:?}", ByteStr::from(&data[..]));
                            self.shadow.inbound(&data);
                            match device.write_all(&data).await {
                                Ok(()) => Step::Continue,
                                Err(e) if transport::is_disconnect(&e) => Step::Restart,
                                Err(e) => return Err(TransportError::Io(e).into()),
                            }
                        }
                    }
                    Err(e) => return Err(client_io(e)),
                },

                _ = poll.tick() => {
                    ports.check_modem_lines(false);
                    sink.send_replies(ports).await?;
                    if device.has_exited() {
                        Step::Restart
                    } else {
                        Step::Continue
                    }
                }
            };

            if let Step::Restart = step {
                self.restart(sink, ports).await?;
            }
            self.update_client_state();
        }
    }

    /// Replace an exited interpreter and show the client a soft reboot.
    async fn restart<W>(&mut self, sink: &mut ClientSink<W>, ports: &PortManager) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let raw = self.shadow.is_raw();
        info!(
            "interpreter exited in {} mode, emulating soft reboot",
            if raw { "raw" } else { "normal" }
        );

        if !raw {
            sink.send(SOFT_REBOOT).await?;
        }

        if let Some(mut old) = self.device.take() {
            old.terminate();
        }
        info!("restarting {}", self.spawner.describe());
        let mut device = self.spawner.spawn().map_err(restart_failed)?;

        tokio::time::sleep(self.config.restart_settle).await;
        let banner = read_startup(&mut device, FRIENDLY_PROMPT, self.config.banner_wait)
            .await
            .map_err(restart_failed)?;

        if raw {
            trace!("discarding banner {:?}", ByteStr::from(banner.freeze()));
            device.write_all(ENTER_RAW).await.map_err(restart_failed)?;
            device.flush().await.map_err(restart_failed)?;
            let echo = read_startup(&mut device, RAW_REPL_PROMPT, self.config.banner_wait)
                .await
                .map_err(restart_failed)?;
            if memmem::find(&echo, RAW_REPL_PROMPT).is_none() {
                return Err(restart_failed(format!(
                    "no raw REPL prompt after restart; received {:?}",
                    ByteStr::from(echo.freeze())
                )));
            }
            self.device = Some(device);
            self.shadow.set(Mode::Raw);
            sink.send(RAW_SOFT_RESET_BANNER).await?;
        } else {
            self.device = Some(device);
            self.shadow.set(Mode::Normal);
            sink.send(&ports.escape(&banner)).await?;
        }
        debug!("interpreter restarted");
        Ok(())
    }
}

/// Read from a new child until `marker` appears or `wait` runs out.
///
/// Running out of time is not an error; the bytes seen so far are returned.
async fn read_startup<D>(device: &mut D, marker: &[u8], wait: Duration) -> io::Result<BytesMut>
where
    D: AsyncRead + Unpin,
{
    let deadline = Instant::now() + wait;
    let mut seen = BytesMut::new();
    let mut buf = [0u8; DEVICE_READ];
    while memmem::find(&seen, marker).is_none() {
        match tokio::time::timeout_at(deadline, device.read(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "interpreter exited during startup",
                ));
            }
            Ok(Ok(n)) => seen.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(seen)
}
