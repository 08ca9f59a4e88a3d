//! Link target configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where the interpreter lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    /// A serial device such as `/dev/ttyACM0` or `COM3`.
    Serial(SerialConfig),

    /// A raw TCP socket (includes an RFC 2217 bridge used as a plain socket).
    Tcp { host: String, port: u16 },

    /// A local interpreter binary run on a pseudo-terminal.
    Process(ProcessConfig),
}

impl Target {
    /// Short human-readable description used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Target::Serial(cfg) => cfg.device.clone(),
            Target::Tcp { host, port } => format!("socket://{}:{}", host, port),
            Target::Process(cfg) => format!("exec:{}", cfg.program.display()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl FromStr for Target {
    type Err = String;

    /// Parse `socket://host:port`, `exec:program [args...]`, or a serial
    /// device path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("socket://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| format!("missing port in {s:?}"))?;
            let port = port
                .parse()
                .map_err(|_| format!("invalid port in {s:?}"))?;
            return Ok(Target::Tcp {
                host: host.to_string(),
                port,
            });
        }

        if let Some(rest) = s.strip_prefix("exec:") {
            let mut parts = rest.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| format!("missing program in {s:?}"))?;
            return Ok(Target::Process(ProcessConfig {
                program: PathBuf::from(program),
                args: parts.map(str::to_string).collect(),
                cwd: None,
            }));
        }

        if s.is_empty() {
            return Err("empty target".to_string());
        }

        Ok(Target::Serial(SerialConfig::new(s)))
    }
}

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path.
    pub device: String,

    /// Line speed (default: 115200).
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Seconds to keep retrying while the device does not exist yet.
    #[serde(default)]
    pub wait_secs: u32,

    /// Open the port exclusively (unix only).
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
}

impl SerialConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: default_baud_rate(),
            wait_secs: 0,
            exclusive: default_exclusive(),
        }
    }
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_exclusive() -> bool {
    true
}

/// Local interpreter process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Interpreter executable.
    pub program: PathBuf,

    /// Arguments passed through unchanged, also on restart.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Serde helper storing a `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket_target() {
        let t: Target = "socket://localhost:2218".parse().unwrap();
        assert_eq!(
            t,
            Target::Tcp {
                host: "localhost".into(),
                port: 2218
            }
        );
        assert!("socket://localhost".parse::<Target>().is_err());
    }

    #[test]
    fn test_parse_exec_target() {
        let t: Target = "exec:./micropython -X heapsize=1M".parse().unwrap();
        match t {
            Target::Process(cfg) => {
                assert_eq!(cfg.program, PathBuf::from("./micropython"));
                assert_eq!(cfg.args, vec!["-X", "heapsize=1M"]);
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_parse_serial_target() {
        let t: Target = "/dev/ttyACM0".parse().unwrap();
        match t {
            Target::Serial(cfg) => {
                assert_eq!(cfg.device, "/dev/ttyACM0");
                assert_eq!(cfg.baud_rate, 115_200);
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_target_deserializes_from_json() {
        let t: Target =
            serde_json::from_str(r#"{"kind":"serial","device":"COM3","wait_secs":2}"#).unwrap();
        assert_eq!(t.describe(), "COM3");
    }
}
