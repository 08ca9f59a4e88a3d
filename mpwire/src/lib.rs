//! # mpwire
//!
//! Async client for the MicroPython raw REPL, plus an interactive terminal
//! loop and an RFC 2217 bridge for the unix port.
//!
//! mpwire talks to a board over a serial port, a TCP socket, or a local
//! interpreter on a pseudo-terminal, and runs code with explicit command
//! boundaries instead of scraping the friendly `>>>` prompt.
//!
//! ## Features
//!
//! - Raw REPL entry, soft reset, and exit
//! - Standard raw submission and flow-controlled raw-paste, with fallback
//! - Separate stdout and stderr for every command, streamed or collected
//! - Async [`Session`] and a [`BlockingSession`] with identical wire behavior
//! - Pass-through terminal loop with detach and code injection keys
//! - RFC 2217 bridge that emulates soft reboot for a restarting process
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mpwire::{Repl, SessionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mpwire::Error> {
//!     let mut session = SessionBuilder::new("/dev/ttyACM0".parse().unwrap())
//!         .connect()
//!         .await?;
//!
//!     session.enter(false).await?;
//!
//!     let response = session.submit(b"import sys\nprint(sys.platform)").await?;
//!     println!("{}", response.stdout_str());
//!
//!     session.exit().await?;
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod error;
pub mod protocol;
pub mod repl;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use bridge::{Bridge, BridgeConfig, LinkState, ModeShadow, PortManager, PtySpawner, Spawner};
pub use error::{BridgeError, Error, ProtocolError, Result, SessionError, TransportError};
pub use protocol::Mode;
pub use repl::{ReplBuilder, ReplOutcome};
pub use session::{
    BlockingSession, OutputStream, Repl, Response, Session, SessionBuilder, SessionConfig,
    SharedSession,
};
pub use transport::{Channel, ChildProcess, ProcessConfig, SerialConfig, Target};
