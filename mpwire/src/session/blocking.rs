//! Synchronous facade over the async engine.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::runtime::{Builder, Runtime};

use super::builder::SessionConfig;
use super::engine::Session;
use super::response::Response;
use super::Repl;
use crate::error::{Result, TransportError};
use crate::protocol::Mode;
use crate::transport::{Channel, Target};

/// A [`Session`] driven on a private current-thread runtime.
///
/// Every call blocks until the engine finishes, so the bytes on the wire are
/// identical to the async API. Do not use from inside another tokio runtime.
///
/// # Example
///
/// ```rust,no_run
/// use mpwire::{BlockingSession, SessionConfig};
///
/// # fn example() -> Result<(), mpwire::Error> {
/// let target = "/dev/ttyACM0".parse().unwrap();
/// let mut session = BlockingSession::connect(&target, SessionConfig::default())?;
/// session.enter(false)?;
/// println!("{}", session.submit(b"print('hello')")?);
/// session.exit()?;
/// # Ok(())
/// # }
/// ```
pub struct BlockingSession<C: Channel> {
    runtime: Runtime,
    session: Session<C>,
}

fn new_runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| TransportError::Io(e).into())
}

impl BlockingSession<Box<dyn Channel>> {
    /// Open `target` on a fresh runtime.
    pub fn connect(target: &Target, config: SessionConfig) -> Result<Self> {
        let runtime = new_runtime()?;
        let session = runtime.block_on(Session::connect(target, config))?;
        Ok(Self { runtime, session })
    }
}

impl<C: Channel> BlockingSession<C> {
    /// Wrap a runtime-independent channel (e.g. an in-memory duplex).
    pub fn new(channel: C, config: SessionConfig) -> Result<Self> {
        Ok(Self {
            runtime: new_runtime()?,
            session: Session::new(channel, config)?,
        })
    }

    pub fn enter(&mut self, soft_reset: bool) -> Result<()> {
        self.runtime.block_on(self.session.enter(soft_reset))
    }

    pub fn exit(&mut self) -> Result<()> {
        self.runtime.block_on(self.session.exit())
    }

    pub fn submit_no_follow(&mut self, command: &[u8]) -> Result<()> {
        self.runtime.block_on(self.session.submit_no_follow(command))
    }

    pub fn collect(&mut self) -> Result<Response> {
        self.runtime.block_on(self.session.collect())
    }

    pub fn submit(&mut self, command: &[u8]) -> Result<Response> {
        self.runtime.block_on(self.session.submit(command))
    }

    pub fn exec(&mut self, command: &[u8]) -> Result<Bytes> {
        self.runtime.block_on(self.session.exec(command))
    }

    pub fn evaluate(&mut self, expression: &str) -> Result<Bytes> {
        self.runtime.block_on(self.session.evaluate(expression))
    }

    pub fn evaluate_json<T: DeserializeOwned>(&mut self, expression: &str) -> Result<T> {
        self.runtime.block_on(self.session.evaluate_json(expression))
    }

    pub fn chunk_size_hint(&mut self) -> Result<usize> {
        self.runtime.block_on(self.session.chunk_size_hint())
    }

    pub fn mode(&self) -> Mode {
        self.session.mode()
    }

    pub fn close(&mut self) -> Result<()> {
        self.runtime.block_on(self.session.close())
    }

    /// Borrow the async engine.
    pub fn session_mut(&mut self) -> &mut Session<C> {
        &mut self.session
    }
}
