//! Interactive terminal loop.
//!
//! Two tasks share one [`SharedSession`]: the keyboard task forwards
//! keystrokes (and handles detach and injection), and the device task polls
//! for output and writes it to the console. Every channel write happens under
//! the session lock. The loop ends when either task finishes; the other task
//! is aborted and joined before [`ReplBuilder::run`] returns.

mod console;
mod keys;

pub use keys::Key;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{Either, select};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex;

use console::Console;

use crate::error::Error;
use crate::session::{Repl, SharedSession};
use crate::transport::{self, Channel};

/// How an interactive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplOutcome {
    /// The user pressed Ctrl-] or Ctrl-X, or the input closed.
    Detached,
    /// The device went away.
    Disconnected,
    /// Anything else, with a message for the user.
    Failed(String),
}

impl ReplOutcome {
    fn from_error(err: &Error) -> Self {
        if err.is_disconnect() {
            ReplOutcome::Disconnected
        } else {
            ReplOutcome::Failed(err.to_string())
        }
    }

    fn from_io(err: &std::io::Error) -> Self {
        if transport::is_disconnect(err) {
            ReplOutcome::Disconnected
        } else {
            ReplOutcome::Failed(err.to_string())
        }
    }
}

/// Options for an interactive loop.
///
/// # Example
///
/// ```rust,no_run
/// use mpwire::{ReplBuilder, ReplOutcome, Session, SessionConfig};
///
/// # async fn example() -> Result<(), mpwire::Error> {
/// let target = "/dev/ttyACM0".parse().unwrap();
/// let session = Session::connect(&target, SessionConfig::default()).await?.into_shared();
/// let outcome = ReplBuilder::new()
///     .inject_code("import machine\\nmachine.reset()")
///     .run(session, tokio::io::stdin(), tokio::io::stdout())
///     .await;
/// if outcome == ReplOutcome::Disconnected {
///     eprintln!("device disconnected");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ReplBuilder {
    escape_non_printable: bool,
    inject_code: Option<Bytes>,
    inject_file: Option<PathBuf>,
    capture: Option<PathBuf>,
    read_size: usize,
    poll_interval: Duration,
}

impl Default for ReplBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplBuilder {
    pub fn new() -> Self {
        Self {
            escape_non_printable: false,
            inject_code: None,
            inject_file: None,
            capture: None,
            read_size: 256,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Show non-printable device bytes as `[xx]`.
    pub fn escape_non_printable(mut self, enabled: bool) -> Self {
        self.escape_non_printable = enabled;
        self
    }

    /// Code sent on Ctrl-J. A literal `\n` in `code` becomes `\r\n`.
    pub fn inject_code(mut self, code: &str) -> Self {
        self.inject_code = Some(Bytes::from(code.replace("\\n", "\r\n")));
        self
    }

    /// File run in raw mode on Ctrl-K.
    pub fn inject_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.inject_file = Some(path.into());
        self
    }

    /// Copy everything written to the console into `path`.
    pub fn capture(mut self, path: impl Into<PathBuf>) -> Self {
        self.capture = Some(path.into());
        self
    }

    /// How long the device task waits for output per poll (default: 100ms).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Lines worth printing before the loop starts.
    pub fn intro(&self, device: &str) -> Vec<String> {
        let mut lines = vec![
            format!("Connected to MicroPython at {device}"),
            "Use Ctrl-] or Ctrl-x to exit this shell".to_string(),
        ];
        if self.escape_non_printable {
            lines.push("Escaping non-printable bytes/characters by printing their hex code".to_string());
        }
        if let Some(path) = &self.capture {
            lines.push(format!("Capturing session to file \"{}\"", path.display()));
        }
        if let Some(code) = &self.inject_code {
            lines.push(format!("Use Ctrl-J to inject {:?}", crate::error::ByteStr(code.clone())));
        }
        if let Some(path) = &self.inject_file {
            lines.push(format!("Use Ctrl-K to inject file \"{}\"", path.display()));
        }
        lines
    }

    /// Run until detach, disconnect, or failure.
    pub async fn run<C, I, O>(self, session: SharedSession<C>, input: I, output: O) -> ReplOutcome
    where
        C: Channel,
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let capture = match &self.capture {
            Some(path) => match tokio::fs::File::create(path).await {
                Ok(file) => Some(file),
                Err(e) => {
                    return ReplOutcome::Failed(format!("cannot create {}: {e}", path.display()));
                }
            },
            None => None,
        };
        let console = Arc::new(Mutex::new(Console::new(
            output,
            capture,
            self.escape_non_printable,
        )));

        let keyboard = tokio::spawn(keyboard_task(
            session.clone(),
            input,
            console.clone(),
            self.inject_code,
            self.inject_file,
        ));
        let device = tokio::spawn(device_task(
            session,
            console,
            self.read_size,
            self.poll_interval,
        ));

        let (finished, loser) = match select(keyboard, device).await {
            Either::Left((finished, device)) => (finished, device),
            Either::Right((finished, keyboard)) => (finished, keyboard),
        };
        loser.abort();
        let _ = loser.await;

        let outcome = match finished {
            Ok(outcome) => outcome,
            Err(e) => ReplOutcome::Failed(format!("interactive task failed: {e}")),
        };
        debug!("interactive loop ended: {:?}", outcome);
        outcome
    }
}

type SharedConsole<O> = Arc<Mutex<Console<O>>>;

async fn keyboard_task<C, I, O>(
    session: SharedSession<C>,
    mut input: I,
    console: SharedConsole<O>,
    inject_code: Option<Bytes>,
    inject_file: Option<PathBuf>,
) -> ReplOutcome
where
    C: Channel,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 64];
    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) => return ReplOutcome::Detached,
            Ok(n) => n,
            Err(e) => return ReplOutcome::Failed(format!("keyboard: {e}")),
        };

        // Forward runs of ordinary keys in one write.
        let mut pending = Vec::with_capacity(n);
        for &byte in &buf[..n] {
            let key = Key::classify(byte, inject_code.is_some(), inject_file.is_some());
            if let Key::Forward(b) = key {
                pending.push(b);
                continue;
            }

            if !pending.is_empty() {
                if let Err(e) = session.lock().await.forward(&pending).await {
                    return ReplOutcome::from_error(&e);
                }
                pending.clear();
            }

            let result = match (key, &inject_code, &inject_file) {
                (Key::Detach, _, _) => return ReplOutcome::Detached,
                (Key::InjectCode, Some(code), _) => session.lock().await.forward(code).await,
                (Key::InjectFile, _, Some(path)) => {
                    match run_file(&session, &console, path).await {
                        Ok(result) => result,
                        Err(e) => return ReplOutcome::from_io(&e),
                    }
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                return ReplOutcome::from_error(&e);
            }
        }

        if !pending.is_empty() {
            if let Err(e) = session.lock().await.forward(&pending).await {
                return ReplOutcome::from_error(&e);
            }
        }
    }
}

/// Enter raw mode, start `path` running, and return to the friendly REPL,
/// all under one lock. Output arrives through the device task.
///
/// The outer error is console I/O; the inner one is from the device.
async fn run_file<C, O>(
    session: &SharedSession<C>,
    console: &SharedConsole<O>,
    path: &Path,
) -> std::io::Result<crate::Result<()>>
where
    C: Channel,
    O: AsyncWrite + Unpin,
{
    console
        .lock()
        .await
        .write(format!("Injecting {}\r\n", path.display()).as_bytes())
        .await?;

    let code = match tokio::fs::read(path).await {
        Ok(code) => code,
        Err(e) => {
            warn!("cannot read {}: {}", path.display(), e);
            let mut console = console.lock().await;
            console.write(b"Error:\r\n").await?;
            console.write(e.to_string().as_bytes()).await?;
            return Ok(Ok(()));
        }
    };

    let mut session = session.lock().await;
    if let Err(e) = session.enter(false).await {
        return Ok(Err(e));
    }
    if let Err(e) = session.submit_no_follow(&code).await {
        if e.is_disconnect() {
            return Ok(Err(e));
        }
        let mut console = console.lock().await;
        console.write(b"Error:\r\n").await?;
        console.write(e.to_string().as_bytes()).await?;
    }
    Ok(session.exit().await)
}

async fn device_task<C, O>(
    session: SharedSession<C>,
    console: SharedConsole<O>,
    read_size: usize,
    poll_interval: Duration,
) -> ReplOutcome
where
    C: Channel,
    O: AsyncWrite + Unpin,
{
    loop {
        let data = {
            let mut session = session.lock().await;
            session.read_available(read_size, poll_interval).await
        };
        match data {
            Ok(data) if data.is_empty() => continue,
            Ok(data) => {
                if let Err(e) = console.lock().await.device_output(&data).await {
                    return ReplOutcome::Failed(format!("console: {e}"));
                }
            }
            Err(e) => return ReplOutcome::from_error(&e),
        }
    }
}
