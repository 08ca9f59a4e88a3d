//! RFC 2217 bridge for a local interpreter process.
//!
//! [`Bridge`] listens on TCP and exposes a MicroPython executable (the unix
//! port, for instance) as if it were a board on a network serial port, so
//! tools that speak `rfc2217://` can drive it.
//!
//! The unix port exits where a board would soft reset. The bridge hides
//! that: when the child exits it starts a new one and sends the client the
//! bytes a board would have sent, using a [`ModeShadow`] to know whether the
//! client expected to stay in raw REPL.
//!
//! # Example
//!
//! ```rust,no_run
//! use mpwire::{Bridge, BridgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mpwire::Error> {
//!     let listener = mpwire::bridge::bind("0.0.0.0", 2217).await?;
//!     let mut bridge = Bridge::new(BridgeConfig::new("./micropython"));
//!     bridge.serve(listener).await
//! }
//! ```

mod device;
mod redirect;
pub mod rfc2217;
mod shadow;

pub use device::{PtySpawner, Spawner};
pub use rfc2217::PortManager;
pub use shadow::ModeShadow;

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::error::{BridgeError, Result};
use crate::protocol::Mode;
use crate::transport::{ChildProcess, ProcessConfig};
use crate::transport::config::millis;

/// Bridge settings.
///
/// Durations serialize as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Interpreter executable.
    pub program: PathBuf,

    /// Passed to the interpreter on every start.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the interpreter.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Pause after a restart before reading the new banner.
    #[serde(default = "default_restart_settle", with = "millis")]
    pub restart_settle: Duration,

    /// How long to wait for the new process's banner.
    #[serde(default = "default_banner_wait", with = "millis")]
    pub banner_wait: Duration,

    /// Modem status poll interval.
    #[serde(default = "default_modem_poll", with = "millis")]
    pub modem_poll: Duration,
}

fn default_restart_settle() -> Duration {
    Duration::from_millis(300)
}

fn default_banner_wait() -> Duration {
    Duration::from_millis(500)
}

fn default_modem_poll() -> Duration {
    Duration::from_secs(1)
}

impl BridgeConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            restart_settle: default_restart_settle(),
            banner_wait: default_banner_wait(),
            modem_poll: default_modem_poll(),
        }
    }

    /// Split a shell-style argument string, e.g. `"-X heapsize=1M"`.
    pub fn args_from_str(mut self, args: &str) -> Self {
        self.args = args.split_whitespace().map(str::to_string).collect();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Process settings used for every spawn.
    pub fn process(&self) -> ProcessConfig {
        ProcessConfig {
            program: self.program.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

/// Connection state of one side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connected,
    InRawRepl,
}

impl LinkState {
    fn connected(mode: Mode) -> Self {
        if mode.is_raw() {
            LinkState::InRawRepl
        } else {
            LinkState::Connected
        }
    }
}

/// Bind the listening socket.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| BridgeError::Bind { addr, source })?;
    Ok(listener)
}

/// RFC 2217 server in front of a restartable interpreter process.
pub struct Bridge<S: Spawner> {
    spawner: S,
    config: BridgeConfig,
    /// Started on the first client and kept across clients.
    device: Option<S::Device>,
    shadow: ModeShadow,
    client: LinkState,
}

impl Bridge<PtySpawner> {
    /// Bridge that runs `config.program` on a pty.
    pub fn new(config: BridgeConfig) -> Self {
        let spawner = PtySpawner::new(config.process());
        Self::with_spawner(spawner, config)
    }
}

impl<S: Spawner> Bridge<S> {
    pub fn with_spawner(spawner: S, config: BridgeConfig) -> Self {
        Self {
            spawner,
            config,
            device: None,
            shadow: ModeShadow::default(),
            client: LinkState::Disconnected,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Mode the child is believed to be in.
    pub fn shadow_mode(&self) -> Mode {
        self.shadow.mode()
    }

    /// Whether an interpreter process is currently held.
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// State of the interpreter process.
    pub fn device_state(&self) -> LinkState {
        match self.device {
            Some(_) => LinkState::connected(self.shadow.mode()),
            None => LinkState::Disconnected,
        }
    }

    /// State of the current client, as the client sees it.
    pub fn client_state(&self) -> LinkState {
        self.client
    }

    fn update_client_state(&mut self) {
        let state = LinkState::connected(self.shadow.mode());
        if state != self.client {
            debug!("client link {:?} -> {:?}", self.client, state);
            self.client = state;
        }
    }

    /// Serve clients one at a time, forever.
    ///
    /// A connection that arrives while another is being served waits in the
    /// listen backlog. Errors end only the client they occurred on.
    pub async fn serve(&mut self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("RFC 2217 server listening on {}", addr);
            info!("connect with: mpremote connect rfc2217://localhost:{}", addr.port());
        }
        loop {
            info!("waiting for connection...");
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            info!("connected by {}", peer);
            if let Err(e) = stream.set_nodelay(true) {
                warn!("could not set TCP_NODELAY for {}: {}", peer, e);
            }

            match self.handle_client(stream).await {
                Ok(()) => info!("{} disconnected", peer),
                Err(e) => error!("{}: {}", peer, e),
            }
        }
    }

    /// Stop the interpreter, if one is running.
    pub fn shutdown(&mut self) {
        if let Some(mut device) = self.device.take() {
            info!("terminating {}", self.spawner.describe());
            device.terminate();
        }
        self.shadow.set(Mode::Normal);
    }
}

impl<S: Spawner> Drop for Bridge<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
