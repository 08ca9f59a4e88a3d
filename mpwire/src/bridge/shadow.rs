use log::trace;
use memchr::memmem;

use crate::protocol::{CTRL_A, CTRL_B, FRIENDLY_PROMPT, Mode, RAW_REPL_MARKER};

/// The bridge's copy of the REPL mode the child process believes it is in.
///
/// Outbound bytes (child to client) are searched for the raw REPL banner and
/// the friendly prompt; inbound bytes (client to child) for the mode control
/// keys. Matching is per chunk: a marker split across two reads is missed,
/// and a marker that happens to appear in program output counts.
#[derive(Debug, Default)]
pub struct ModeShadow {
    mode: Mode,
    /// Ctrl-A was sent from Normal and the banner has not been seen yet.
    pending_raw: bool,
}

impl ModeShadow {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_raw(&self) -> bool {
        self.mode.is_raw()
    }

    /// Whether a raw REPL request is waiting for the device's banner.
    pub fn raw_pending(&self) -> bool {
        self.pending_raw
    }

    /// Force the shadow after the bridge itself changed the child's mode.
    pub fn set(&mut self, mode: Mode) {
        self.mode = mode;
        self.pending_raw = false;
    }

    /// Bytes the child wrote.
    pub fn outbound(&mut self, data: &[u8]) {
        if memmem::find(data, RAW_REPL_MARKER).is_some() {
            if self.mode != Mode::Raw {
                trace!("shadow: raw REPL banner seen");
            }
            self.set(Mode::Raw);
        } else if self.mode.is_raw() && memmem::find(data, FRIENDLY_PROMPT).is_some() {
            trace!("shadow: friendly prompt seen");
            self.set(Mode::Normal);
        }
    }

    /// Bytes the client wrote.
    pub fn inbound(&mut self, data: &[u8]) {
        for &b in data {
            match (self.mode, b) {
                (Mode::Normal, CTRL_A) => self.pending_raw = true,
                (Mode::Raw | Mode::RawPaste, CTRL_B) => {
                    trace!("shadow: Ctrl-B");
                    self.set(Mode::Normal);
                }
                _ => {}
            }
        }
    }
}
