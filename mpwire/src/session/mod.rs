//! Raw REPL sessions.
//!
//! [`Session`] is the single engine: it owns a [`Channel`](crate::Channel),
//! enters and leaves raw mode, and runs commands with either standard raw
//! submission or flow-controlled raw-paste. [`BlockingSession`] drives the
//! same engine from synchronous code, and [`SharedSession`] serializes
//! callers from several tasks.

mod blocking;
mod builder;
mod engine;
pub(crate) mod response;
mod stream;

pub use blocking::BlockingSession;
pub use builder::{SessionBuilder, SessionConfig};
pub use engine::{DEFAULT_CHUNK_SIZE_HINT, Session, chunk_size_for_free_memory};
pub use response::Response;
pub use stream::OutputStream;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::Mode;

/// A session behind an async mutex.
///
/// Each holder locks for a whole exchange (`submit`, or `enter` followed by
/// submissions), so commands from different tasks never interleave on the
/// wire. Waiters queue on the lock instead of failing.
pub type SharedSession<C> = Arc<tokio::sync::Mutex<Session<C>>>;

/// Raw REPL capability.
pub trait Repl: Send {
    /// Interrupt the device, drain its output, and switch to raw mode.
    ///
    /// With `soft_reset`, the interpreter is restarted once the raw prompt
    /// appears. Clears a poisoned session on success.
    fn enter(&mut self, soft_reset: bool) -> impl Future<Output = Result<()>> + Send;

    /// Return the device to the friendly REPL.
    fn exit(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Send a command without waiting for its output.
    fn submit_no_follow(&mut self, command: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the in-flight command's stdout and stderr.
    fn collect(&mut self) -> impl Future<Output = Result<Response>> + Send;

    /// Submit a command and wait for its output.
    fn submit(&mut self, command: &[u8]) -> impl Future<Output = Result<Response>> + Send {
        async move {
            self.submit_no_follow(command).await?;
            self.collect().await
        }
    }

    /// Run a command; device-side errors become [`Error::Execution`].
    fn exec(&mut self, command: &[u8]) -> impl Future<Output = Result<Bytes>> + Send {
        async move {
            let response = self.submit(command).await?;
            if response.is_success() {
                Ok(response.stdout)
            } else {
                Err(Error::Execution {
                    stdout: response.stdout,
                    stderr: response.stderr,
                })
            }
        }
    }

    /// Print `expression` on the device and return the trimmed text.
    fn evaluate(&mut self, expression: &str) -> impl Future<Output = Result<Bytes>> + Send {
        async move {
            let code = format!("print({expression})");
            let stdout = self.exec(code.as_bytes()).await?;
            Ok(Bytes::copy_from_slice(stdout.trim_ascii()))
        }
    }

    /// Current REPL mode as tracked by the engine.
    fn mode(&self) -> Mode;

    /// Close the underlying channel.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConfig, FakeDevice, fast_config};

    #[tokio::test]
    async fn test_shared_session_never_interleaves() {
        let (host, device) = FakeDevice::spawn(FakeConfig {
            window: 4,
            ..FakeConfig::default()
        });
        let mut session = Session::new(host, fast_config()).unwrap();
        session.enter(false).await.unwrap();
        let shared = session.into_shared();

        let a = format!("print('{}')", "a".repeat(64));
        let b = format!("print('{}')", "b".repeat(64));

        let first = {
            let shared = shared.clone();
            let code = a.clone();
            tokio::spawn(async move { shared.lock().await.exec(code.as_bytes()).await })
        };
        let second = {
            let shared = shared.clone();
            let code = b.clone();
            tokio::spawn(async move { shared.lock().await.exec(code.as_bytes()).await })
        };

        let out_a = first.await.unwrap().unwrap();
        let out_b = second.await.unwrap().unwrap();
        assert_eq!(out_a.trim_ascii(), "a".repeat(64).as_bytes());
        assert_eq!(out_b.trim_ascii(), "b".repeat(64).as_bytes());

        // Each body reached the device whole.
        let executed = device.executed();
        assert_eq!(executed.len(), 2);
        assert!(executed.contains(&a.clone().into_bytes()));
        assert!(executed.contains(&b.clone().into_bytes()));

        // And the payload bytes on the wire form exactly two runs.
        let payload: Vec<u8> = device
            .wire()
            .into_iter()
            .filter(|c| *c == b'a' || *c == b'b')
            .collect();
        let switches = payload.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1);
    }
}
