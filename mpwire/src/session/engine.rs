//! Async raw REPL engine driving a single [`Channel`].

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use super::builder::SessionConfig;
use super::response::Response;
use super::stream::OutputStream;
use super::{Repl, SharedSession};
use crate::error::{ByteStr, Error, ProtocolError, Result, SessionError, TransportError};
use crate::protocol::{
    self, ACCEPTED, CTRL_A, CTRL_D, ENTER_RAW, EXIT_RAW, INTERRUPT, Mode, RAW_PASTE_REQUEST,
    RAW_PASTE_SUPPORTED, RAW_PROMPT, RAW_REPL_BANNER, RAW_REPL_PROMPT, RAW_REPL_PROMPT_TAIL,
    ReadBuffer, SENTINEL, SOFT_REBOOT,
};
use crate::transport::{self, Channel, Target};

const READ_CHUNK: usize = 1024;

/// Chunk size used when free memory cannot be determined.
pub const DEFAULT_CHUNK_SIZE_HINT: usize = 256;

/// Outcome of a bounded read. Timeouts hand back whatever was seen.
pub(super) enum Until {
    Found(Bytes),
    TimedOut(Bytes),
}

/// Which half of a response a sentinel read is closing.
#[derive(Clone, Copy)]
pub(super) enum Section {
    Stdout,
    Stderr,
}

#[derive(Clone, Copy)]
pub(super) struct Deadline {
    at: Instant,
    limit: Duration,
}

/// Run `fut`, failing with `CommandTimeout` if the command deadline passes.
pub(super) async fn bounded<T>(deadline: Option<Deadline>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some(d) => match tokio::time::timeout_at(d.at, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::CommandTimeout(d.limit).into()),
        },
        None => fut.await,
    }
}

fn map_io(err: io::Error) -> Error {
    if transport::is_disconnect(&err) {
        TransportError::Disconnected.into()
    } else {
        TransportError::Io(err).into()
    }
}

/// Pick a transfer chunk size from the device's free heap.
pub fn chunk_size_for_free_memory(free_bytes: u64) -> usize {
    let free_kb = free_bytes / 1024;
    if free_kb >= 100 {
        2048
    } else if free_kb >= 50 {
        1024
    } else if free_kb >= 20 {
        512
    } else {
        256
    }
}

/// Raw REPL session over one channel.
///
/// The session tracks the device's [`Mode`], owns the read buffer, and
/// enforces that at most one command is outstanding. A timeout while waiting
/// on the device leaves the session *poisoned*: every raw operation fails
/// with [`SessionError::NotInRawMode`] until [`enter`](Repl::enter)
/// succeeds again.
///
/// # Example
///
/// ```rust,no_run
/// use mpwire::{Repl, Session, SessionConfig};
///
/// # async fn example() -> Result<(), mpwire::Error> {
/// let target = "socket://localhost:2218".parse().unwrap();
/// let mut session = Session::connect(&target, SessionConfig::default()).await?;
/// session.enter(false).await?;
/// let value = session.evaluate("1+1").await?;
/// assert_eq!(&value[..], b"2");
/// session.exit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Session<C: Channel> {
    channel: C,
    name: String,
    pub(super) config: SessionConfig,
    pub(super) buffer: ReadBuffer,
    mode: Mode,
    poisoned: bool,
    pub(super) in_flight: bool,
    /// stdout of the in-flight command was already consumed by a stream.
    pub(super) stdout_done: bool,
    use_raw_paste: bool,
    chunk_size_hint: Option<usize>,
    submitted_at: Option<Instant>,
    pub(super) deadline: Option<Deadline>,
}

impl Session<Box<dyn Channel>> {
    /// Open `target` and wrap it in a session (Normal mode).
    pub async fn connect(target: &Target, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let channel = transport::connect(target).await?;
        Self::new(channel, config)
    }
}

impl<C: Channel> Session<C> {
    /// Wrap an open channel. The device is assumed to be in Normal mode.
    pub fn new(channel: C, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let name = channel.name();
        debug!("new session on {}", name);
        Ok(Self {
            channel,
            name,
            use_raw_paste: config.use_raw_paste,
            config,
            buffer: ReadBuffer::default(),
            mode: Mode::Normal,
            poisoned: false,
            in_flight: false,
            stdout_done: false,
            chunk_size_hint: None,
            submitted_at: None,
            deadline: None,
        })
    }

    /// Name of the underlying channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a timeout left the device in an unknown state.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Whether a command was submitted and not yet collected.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Whether the next submission will attempt raw-paste.
    pub fn uses_raw_paste(&self) -> bool {
        self.use_raw_paste
    }

    /// Wrap the session for use from several tasks.
    pub fn into_shared(self) -> SharedSession<C> {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Give back the channel, dropping any buffered input.
    pub fn into_inner(self) -> C {
        self.channel
    }

    // ---------------------------------------------------------------------
    // Byte-level helpers
    // ---------------------------------------------------------------------

    pub(super) async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        trace!("{} <- {:?}", self.name, ByteStr::from(data));
        self.channel.write_all(data).await.map_err(map_io)?;
        self.channel.flush().await.map_err(map_io)?;
        Ok(())
    }

    /// Read once into the buffer. `Ok(false)` if nothing arrived in `wait`.
    pub(super) async fn fill(&mut self, wait: Option<Duration>) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let read = match wait {
            Some(wait) => match tokio::time::timeout(wait, self.channel.read(&mut chunk)).await {
                Ok(read) => read,
                Err(_) => return Ok(false),
            },
            None => self.channel.read(&mut chunk).await,
        };

        match read {
            Ok(0) => Err(TransportError::Disconnected.into()),
            Ok(n) => {
                trace!("{} -> {:?}", self.name, ByteStr::from(&chunk[..n]));
                self.buffer.extend(&chunk[..n]);
                Ok(true)
            }
            Err(e) => Err(map_io(e)),
        }
    }

    /// Read until `ending` with an inter-byte and an optional overall limit.
    async fn read_until(
        &mut self,
        ending: &[u8],
        inter_byte: Option<Duration>,
        overall: Option<Duration>,
    ) -> Result<Until> {
        let start = Instant::now();
        let mut last_byte = start;
        loop {
            if let Some(data) = self.buffer.take_through(ending) {
                return Ok(Until::Found(data));
            }

            let mut wait = inter_byte.map(|t| t.saturating_sub(last_byte.elapsed()));
            if let Some(overall) = overall {
                let left = overall.saturating_sub(start.elapsed());
                wait = Some(wait.map_or(left, |w| w.min(left)));
            }
            if wait.is_some_and(|w| w.is_zero()) {
                return Ok(Until::TimedOut(self.buffer.take_all()));
            }

            if self.fill(wait).await? {
                last_byte = Instant::now();
            }
        }
    }

    /// Read exactly `n` bytes, or time out after `inter_byte` of silence.
    async fn read_exact(&mut self, n: usize, inter_byte: Option<Duration>) -> Result<Until> {
        let mut last_byte = Instant::now();
        while self.buffer.len() < n {
            let wait = inter_byte.map(|t| t.saturating_sub(last_byte.elapsed()));
            if wait.is_some_and(|w| w.is_zero()) {
                return Ok(Until::TimedOut(self.buffer.take_all()));
            }
            if self.fill(wait).await? {
                last_byte = Instant::now();
            }
        }
        Ok(Until::Found(self.buffer.take_up_to(n)))
    }

    /// Wait for a trailer during `enter()`.
    async fn expect(&mut self, trailer: &[u8]) -> Result<Bytes> {
        let overall = self.config.overall_timeout;
        match self
            .read_until(trailer, Some(self.config.timeout), Some(overall))
            .await?
        {
            Until::Found(data) => Ok(data),
            Until::TimedOut(observed) => {
                warn!(
                    "{}: no {:?} after {:?}",
                    self.name,
                    ByteStr::from(trailer),
                    overall
                );
                Err(ProtocolError::Timeout {
                    expected: trailer.into(),
                    observed: observed.into(),
                    after: overall,
                }
                .into())
            }
        }
    }

    /// Discard whatever the device is still printing.
    async fn drain(&mut self) -> Result<()> {
        tokio::time::sleep(self.config.drain_settle).await;
        let start = Instant::now();
        while start.elapsed() < self.config.drain_max {
            let wait = self
                .config
                .drain_quiet
                .min(self.config.drain_max.saturating_sub(start.elapsed()));
            if !self.fill(Some(wait)).await? {
                break;
            }
        }
        let discarded = self.buffer.take_all();
        if !discarded.is_empty() {
            trace!("{}: drained {} bytes", self.name, discarded.len());
        }
        Ok(())
    }

    /// Read one sentinel-terminated section of a response.
    pub(super) async fn read_section(&mut self, section: Section) -> Result<Bytes> {
        match self
            .read_until(&[SENTINEL], Some(self.config.timeout), None)
            .await?
        {
            Until::Found(mut data) => {
                data.truncate(data.len() - 1);
                Ok(data)
            }
            Until::TimedOut(observed) => {
                let observed = ByteStr::from(observed);
                Err(match section {
                    Section::Stdout => ProtocolError::FirstEofTimeout { observed },
                    Section::Stderr => ProtocolError::SecondEofTimeout { observed },
                }
                .into())
            }
        }
    }

    /// Record a failed command; timeouts poison the session.
    pub(super) fn note_failure(&mut self, err: &Error) {
        if err.poisons_session() {
            warn!("{}: {} - session needs enter() before reuse", self.name, err);
            self.poisoned = true;
        }
        if self.mode == Mode::RawPaste {
            self.mode = Mode::Raw;
        }
        self.in_flight = false;
        self.deadline = None;
    }

    pub(super) fn finish_command(&mut self) -> Duration {
        self.in_flight = false;
        self.deadline = None;
        self.submitted_at
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.poisoned || !self.mode.is_raw() {
            return Err(SessionError::NotInRawMode.into());
        }
        if self.in_flight {
            return Err(SessionError::CommandInFlight.into());
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    async fn write_command(&mut self, body: &[u8]) -> Result<()> {
        let timeout = self.config.timeout;

        if let Until::TimedOut(observed) = self.read_until(RAW_PROMPT, Some(timeout), None).await? {
            return Err(ProtocolError::Timeout {
                expected: RAW_PROMPT.into(),
                observed: observed.into(),
                after: timeout,
            }
            .into());
        }

        if self.use_raw_paste {
            self.write_all(RAW_PASTE_REQUEST).await?;
            let reply = match self.read_exact(2, Some(timeout)).await? {
                Until::Found(reply) => reply,
                Until::TimedOut(observed) => {
                    return Err(ProtocolError::Timeout {
                        expected: RAW_PASTE_SUPPORTED.into(),
                        observed: observed.into(),
                        after: timeout,
                    }
                    .into());
                }
            };

            match protocol::is_raw_paste_supported(&reply) {
                Ok(true) => return self.raw_paste_write(body).await,
                Ok(false) => debug!("{}: raw-paste declined", self.name),
                Err(e) => {
                    // Firmware without raw-paste reprints the raw REPL banner.
                    debug!("{}: {}, falling back to standard raw mode", self.name, e);
                    if let Until::TimedOut(observed) = self
                        .read_until(RAW_REPL_PROMPT_TAIL, Some(timeout), None)
                        .await?
                    {
                        return Err(ProtocolError::Timeout {
                            expected: RAW_REPL_PROMPT_TAIL.into(),
                            observed: observed.into(),
                            after: timeout,
                        }
                        .into());
                    }
                }
            }
            self.use_raw_paste = false;
        }

        for chunk in body.chunks(self.config.chunk_size) {
            self.write_all(chunk).await?;
        }
        self.write_all(&[CTRL_D]).await?;

        match self.read_exact(ACCEPTED.len(), Some(timeout)).await? {
            Until::Found(reply) if &reply[..] == ACCEPTED => Ok(()),
            Until::Found(reply) => Err(ProtocolError::SubmissionRejected {
                response: reply.into(),
            }
            .into()),
            Until::TimedOut(observed) => Err(ProtocolError::Timeout {
                expected: ACCEPTED.into(),
                observed: observed.into(),
                after: timeout,
            }
            .into()),
        }
    }

    /// Flow-controlled body transfer after the device answered `R\x01`.
    async fn raw_paste_write(&mut self, body: &[u8]) -> Result<()> {
        let timeout = self.config.timeout;
        self.mode = Mode::RawPaste;

        let header = match self.read_exact(2, Some(timeout)).await? {
            Until::Found(header) => header,
            Until::TimedOut(observed) => {
                return Err(ProtocolError::RawPasteIncomplete {
                    observed: observed.into(),
                }
                .into());
            }
        };
        let window_size = u16::from_le_bytes([header[0], header[1]]) as usize;
        trace!("{}: raw-paste window {}", self.name, window_size);

        let mut window = window_size;
        let mut sent = 0;
        while sent < body.len() {
            while window == 0 {
                let byte = match self.read_exact(1, None).await? {
                    Until::Found(b) => b[0],
                    Until::TimedOut(observed) => {
                        return Err(ProtocolError::RawPasteIncomplete {
                            observed: observed.into(),
                        }
                        .into());
                    }
                };
                match byte {
                    CTRL_A => window += window_size,
                    CTRL_D => {
                        debug!("{}: device aborted raw-paste after {} bytes", self.name, sent);
                        self.write_all(&[CTRL_D]).await?;
                        self.mode = Mode::Raw;
                        return Ok(());
                    }
                    other => {
                        return Err(ProtocolError::UnexpectedRawPasteByte { byte: other }.into());
                    }
                }
            }

            let end = (sent + window).min(body.len());
            self.write_all(&body[sent..end]).await?;
            window -= end - sent;
            sent = end;
        }

        self.write_all(&[CTRL_D]).await?;
        if let Until::TimedOut(observed) = self.read_until(&[CTRL_D], Some(timeout), None).await? {
            return Err(ProtocolError::RawPasteIncomplete {
                observed: observed.into(),
            }
            .into());
        }
        self.mode = Mode::Raw;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Higher-level helpers
    // ---------------------------------------------------------------------

    /// Stream stdout of the in-flight command as it arrives.
    pub fn follow_stream(&mut self) -> Result<OutputStream<'_, C>> {
        if !self.in_flight {
            return Err(SessionError::NothingInFlight.into());
        }
        Ok(OutputStream::new(self))
    }

    /// Evaluate `expression` on the device and decode its JSON form.
    pub async fn evaluate_json<T: DeserializeOwned>(&mut self, expression: &str) -> Result<T> {
        let code = format!("import json\nprint(json.dumps({expression}))");
        let stdout = self.exec(code.as_bytes()).await?;
        let raw = stdout.trim_ascii();
        serde_json::from_slice(raw).map_err(|source| {
            ProtocolError::Decode {
                raw: raw.into(),
                source,
            }
            .into()
        })
    }

    /// Transfer chunk size suited to the device's free memory.
    ///
    /// Detected once with `gc.mem_free()` and cached until
    /// [`invalidate_chunk_size`](Self::invalidate_chunk_size) or a soft reset.
    pub async fn chunk_size_hint(&mut self) -> Result<usize> {
        if let Some(size) = self.chunk_size_hint {
            return Ok(size);
        }

        let size = match self.evaluate("__import__('gc').mem_free()").await {
            Ok(raw) => match std::str::from_utf8(&raw).ok().and_then(|s| s.parse::<u64>().ok()) {
                Some(free) => {
                    let size = chunk_size_for_free_memory(free);
                    debug!("{}: {} bytes free, chunk size {}", self.name, free, size);
                    size
                }
                None => DEFAULT_CHUNK_SIZE_HINT,
            },
            Err(e) if e.is_disconnect() || e.poisons_session() => return Err(e),
            Err(e) => {
                debug!("{}: mem_free unavailable ({}), chunk size {}", self.name, e, DEFAULT_CHUNK_SIZE_HINT);
                DEFAULT_CHUNK_SIZE_HINT
            }
        };

        self.chunk_size_hint = Some(size);
        Ok(size)
    }

    /// Forget the cached chunk size, e.g. after a reset or large allocation.
    pub fn invalidate_chunk_size(&mut self) {
        self.chunk_size_hint = None;
    }

    // ---------------------------------------------------------------------
    // Pass-through for interactive use
    // ---------------------------------------------------------------------

    /// Send keystrokes straight to the device, tracking mode changes.
    pub async fn forward(&mut self, data: &[u8]) -> Result<()> {
        self.write_all(data).await?;
        let mode = self.mode.after_bytes(data);
        if mode != self.mode {
            debug!("{}: mode {:?} -> {:?} via keystroke", self.name, self.mode, mode);
            self.mode = mode;
        }
        Ok(())
    }

    /// Return up to `max` bytes already available from the device, waiting
    /// at most `wait`. An empty result means nothing arrived.
    pub async fn read_available(&mut self, max: usize, wait: Duration) -> Result<Bytes> {
        if self.buffer.is_empty() && !self.fill(Some(wait)).await? {
            return Ok(Bytes::new());
        }
        Ok(self.buffer.take_up_to(max))
    }
}

impl<C: Channel> Repl for Session<C> {
    async fn enter(&mut self, soft_reset: bool) -> Result<()> {
        info!("{}: entering raw REPL", self.name);
        // Stays set until the final banner has been seen.
        self.poisoned = true;
        self.in_flight = false;
        self.deadline = None;

        self.write_all(INTERRUPT).await?;
        self.drain().await?;
        self.write_all(ENTER_RAW).await?;
        self.mode = Mode::Raw;

        if soft_reset {
            self.expect(RAW_REPL_PROMPT).await?;
            self.write_all(&[CTRL_D]).await?;
            self.expect(SOFT_REBOOT).await?;
            self.chunk_size_hint = None;
        }
        self.expect(RAW_REPL_BANNER).await?;

        self.poisoned = false;
        debug!("{}: raw REPL ready", self.name);
        Ok(())
    }

    async fn exit(&mut self) -> Result<()> {
        self.write_all(EXIT_RAW).await?;
        self.mode = Mode::Normal;
        self.in_flight = false;
        self.deadline = None;
        debug!("{}: left raw REPL", self.name);
        Ok(())
    }

    async fn submit_no_follow(&mut self, command: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        let body = protocol::encode(command);

        let now = Instant::now();
        self.submitted_at = Some(now);
        self.deadline = self.config.command_timeout.map(|limit| Deadline {
            at: now + limit,
            limit,
        });

        let result = bounded(self.deadline, self.write_command(&body)).await;
        match &result {
            Ok(()) => {
                self.in_flight = true;
                self.stdout_done = false;
            }
            Err(e) => self.note_failure(e),
        }
        result
    }

    async fn collect(&mut self) -> Result<Response> {
        if !self.in_flight {
            return Err(SessionError::NothingInFlight.into());
        }

        let result = bounded(self.deadline, async {
            let stdout = if self.stdout_done {
                Bytes::new()
            } else {
                self.read_section(Section::Stdout).await?
            };
            let stderr = self.read_section(Section::Stderr).await?;
            Ok((stdout, stderr))
        })
        .await;

        match result {
            Ok((stdout, stderr)) => {
                let elapsed = self.finish_command();
                Ok(Response::new(stdout, stderr, elapsed))
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    async fn close(&mut self) -> Result<()> {
        self.in_flight = false;
        self.channel.shutdown().await.map_err(map_io)
    }
}
