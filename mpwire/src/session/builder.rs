//! Session configuration and builder.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::blocking::BlockingSession;
use super::engine::Session;
use crate::error::{Result, SessionError};
use crate::transport::config::millis;
use crate::transport::{self, Channel, Target};

/// Timing and transfer settings for a [`Session`].
///
/// All durations serialize as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inter-byte timeout while waiting for a trailer or sentinel.
    #[serde(with = "millis")]
    pub timeout: Duration,

    /// Overall timeout for each trailer read during `enter()`.
    #[serde(with = "millis")]
    pub overall_timeout: Duration,

    /// Deadline for a whole command, from submission to the second sentinel.
    #[serde(with = "millis::option")]
    pub command_timeout: Option<Duration>,

    /// Sleep after the interrupt before draining the backlog.
    #[serde(with = "millis")]
    pub drain_settle: Duration,

    /// Stop draining once the link has been quiet this long.
    #[serde(with = "millis")]
    pub drain_quiet: Duration,

    /// Upper bound on draining, even if the device keeps talking.
    #[serde(with = "millis")]
    pub drain_max: Duration,

    /// Write size in standard raw mode.
    pub chunk_size: usize,

    /// Try raw-paste first. Cleared for the rest of the session as soon as
    /// the device declines.
    pub use_raw_paste: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(10),
            command_timeout: None,
            drain_settle: Duration::from_millis(100),
            drain_quiet: Duration::from_millis(100),
            drain_max: Duration::from_secs(1),
            chunk_size: 256,
            use_raw_paste: true,
        }
    }
}

impl SessionConfig {
    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SessionError::InvalidConfig {
                message: "chunk_size must be at least 1".to_string(),
            }
            .into());
        }
        if self.timeout.is_zero() || self.overall_timeout.is_zero() {
            return Err(SessionError::InvalidConfig {
                message: "timeouts must be non-zero".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Builder for connecting a [`Session`].
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use mpwire::{Repl, SessionBuilder};
///
/// # async fn example() -> Result<(), mpwire::Error> {
/// let mut session = SessionBuilder::new("/dev/ttyACM0".parse().unwrap())
///     .timeout(Duration::from_secs(5))
///     .connect()
///     .await?;
/// session.enter(false).await?;
/// let response = session.submit(b"print(1+1)").await?;
/// assert_eq!(&response.stdout[..], b"2\r\n");
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    target: Target,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Create a builder for the given link.
    pub fn new(target: Target) -> Self {
        Self {
            target,
            config: SessionConfig::default(),
        }
    }

    /// Replace all settings at once.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the inter-byte timeout (default: 10s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the overall trailer timeout for `enter()` (default: 10s).
    pub fn overall_timeout(mut self, timeout: Duration) -> Self {
        self.config.overall_timeout = timeout;
        self
    }

    /// Bound every command end to end.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = Some(timeout);
        self
    }

    /// Set the write size in standard raw mode (default: 256).
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Enable or disable raw-paste (default: enabled).
    pub fn raw_paste(mut self, enabled: bool) -> Self {
        self.config.use_raw_paste = enabled;
        self
    }

    /// Wrap an already-open channel.
    pub fn build<C: Channel>(self, channel: C) -> Result<Session<C>> {
        Session::new(channel, self.config)
    }

    /// Open the link and return a session in Normal mode.
    pub async fn connect(self) -> Result<Session<Box<dyn Channel>>> {
        self.config.validate()?;
        let channel = transport::connect(&self.target).await?;
        Session::new(channel, self.config)
    }

    /// Open the link on a private runtime and return a blocking session.
    pub fn connect_blocking(self) -> Result<BlockingSession<Box<dyn Channel>>> {
        BlockingSession::connect(&self.target, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert_eq!(cfg.chunk_size, 256);
        assert!(cfg.use_raw_paste);
        assert!(cfg.command_timeout.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let cfg = SessionConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(crate::Error::Session(SessionError::InvalidConfig { .. }))
        ));
    }

    #[test]
    fn test_config_from_json_millis() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"timeout": 2500, "command_timeout": 30000, "use_raw_paste": false}"#)
                .unwrap();
        assert_eq!(cfg.timeout, Duration::from_millis(2500));
        assert_eq!(cfg.command_timeout, Some(Duration::from_secs(30)));
        assert!(!cfg.use_raw_paste);
        assert_eq!(cfg.drain_max, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_sets_fields() {
        let builder = SessionBuilder::new("socket://localhost:2218".parse().unwrap())
            .chunk_size(64)
            .raw_paste(false)
            .command_timeout(Duration::from_secs(3));
        assert_eq!(builder.config.chunk_size, 64);
        assert!(!builder.config.use_raw_paste);
        assert_eq!(builder.config.command_timeout, Some(Duration::from_secs(3)));
    }
}
