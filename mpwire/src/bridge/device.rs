//! Interpreter processes the bridge serves.

use crate::error::Result;
use crate::transport::{Channel, ChildProcess, ProcessChannel, ProcessConfig};

/// Starts interpreter processes, the same way every time.
pub trait Spawner: Send {
    /// A running interpreter.
    type Device: Channel + ChildProcess;

    fn spawn(&mut self) -> Result<Self::Device>;

    /// Command line, for logs.
    fn describe(&self) -> String;
}

/// Runs the interpreter on a fresh pseudo-terminal.
#[derive(Debug, Clone)]
pub struct PtySpawner {
    config: ProcessConfig,
}

impl PtySpawner {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }
}

impl Spawner for PtySpawner {
    type Device = ProcessChannel;

    fn spawn(&mut self) -> Result<ProcessChannel> {
        ProcessChannel::spawn(&self.config)
    }

    fn describe(&self) -> String {
        let mut line = self.config.program.display().to_string();
        for arg in &self.config.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let spawner = PtySpawner::new(ProcessConfig {
            program: "./micropython".into(),
            args: vec!["-X".into(), "heapsize=1M".into()],
            cwd: None,
        });
        assert_eq!(spawner.describe(), "./micropython -X heapsize=1M");
    }
}
