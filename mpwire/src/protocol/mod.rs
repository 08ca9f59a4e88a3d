//! Raw REPL wire codec.
//!
//! Pure constants and functions for talking to a MicroPython raw REPL.
//! Nothing here performs I/O or holds state between calls.

mod buffer;

pub use buffer::ReadBuffer;

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr_iter;
use serde::{Deserialize, Serialize};

use crate::error::{ByteStr, ProtocolError};

/// Ctrl-A: enter raw REPL. Also the raw-paste credit signal.
pub const CTRL_A: u8 = 0x01;
/// Ctrl-B: exit raw REPL.
pub const CTRL_B: u8 = 0x02;
/// Ctrl-C: keyboard interrupt.
pub const CTRL_C: u8 = 0x03;
/// Ctrl-D: end of input, soft reset, and the stdout/stderr sentinel.
pub const CTRL_D: u8 = 0x04;
/// Ctrl-E: raw-paste request prefix.
pub const CTRL_E: u8 = 0x05;

/// Sentinel separating stdout from stderr, and terminating a body.
pub const SENTINEL: u8 = CTRL_D;

/// Interrupt any running program.
pub const INTERRUPT: &[u8] = b"\r\x03";
/// Switch the device into raw REPL.
pub const ENTER_RAW: &[u8] = b"\r\x01";
/// Return to the friendly REPL.
pub const EXIT_RAW: &[u8] = b"\r\x02";
/// Ask for raw-paste mode.
pub const RAW_PASTE_REQUEST: &[u8] = b"\x05A\x01";

/// Raw REPL ready trailer without the prompt character.
pub const RAW_REPL_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n";
/// Raw REPL ready trailer including the `>` prompt.
pub const RAW_REPL_PROMPT: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
/// Tail of the raw REPL trailer, used after an unrecognised raw-paste reply.
pub const RAW_REPL_PROMPT_TAIL: &[u8] = b"w REPL; CTRL-B to exit\r\n>";
/// Marker substring used by the bridge to detect raw REPL entry.
pub const RAW_REPL_MARKER: &[u8] = b"raw REPL; CTRL-B to exit";
/// Soft reboot banner fragment.
pub const SOFT_REBOOT: &[u8] = b"soft reboot\r\n";
/// Bytes a real board emits after Ctrl-D while sitting in raw REPL.
pub const RAW_SOFT_RESET_BANNER: &[u8] = b"OK\r\nMPY: soft reboot\r\nraw REPL; CTRL-B to exit\r\n>";
/// Friendly REPL prompt.
pub const FRIENDLY_PROMPT: &[u8] = b">>>";
/// Raw REPL input prompt.
pub const RAW_PROMPT: &[u8] = b">";

/// Reply to a standard raw submission.
pub const ACCEPTED: &[u8] = b"OK";
/// Raw-paste request understood and supported.
pub const RAW_PASTE_SUPPORTED: &[u8] = b"R\x01";
/// Raw-paste request understood but not supported.
pub const RAW_PASTE_UNSUPPORTED: &[u8] = b"R\x00";

/// REPL mode the remote interpreter is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Friendly interactive REPL (`>>>`).
    #[default]
    Normal,
    /// Raw REPL: explicit command boundaries.
    Raw,
    /// Flow-controlled raw-paste transfer in progress.
    RawPaste,
}

impl Mode {
    /// Mode after a single keystroke is sent through to the device.
    pub fn after_keystroke(self, byte: u8) -> Mode {
        match (self, byte) {
            (Mode::Normal, CTRL_A) => Mode::Raw,
            (Mode::Raw, CTRL_B) => Mode::Normal,
            (mode, _) => mode,
        }
    }

    /// Fold [`after_keystroke`](Self::after_keystroke) over a byte run.
    pub fn after_bytes(self, data: &[u8]) -> Mode {
        data.iter().fold(self, |mode, &b| mode.after_keystroke(b))
    }

    /// Whether commands can be submitted in this mode.
    pub fn is_raw(self) -> bool {
        matches!(self, Mode::Raw | Mode::RawPaste)
    }
}

/// Encode a command for standard raw mode. No framing is added.
pub fn encode(command: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(command.as_ref())
}

/// Build the raw-paste header for a command.
///
/// The header is [`RAW_PASTE_REQUEST`] followed by the little-endian `u32`
/// length of the body.
pub fn encode_raw_paste_header(command: impl AsRef<[u8]>) -> (Bytes, Bytes) {
    let body = encode(command);
    let mut header = BytesMut::with_capacity(RAW_PASTE_REQUEST.len() + 4);
    header.put_slice(RAW_PASTE_REQUEST);
    header.put_u32_le(body.len() as u32);
    (header.freeze(), body)
}

/// Split a raw REPL response into `(stdout, stderr)`.
///
/// The first sentinel ends stdout and the second ends stderr, the same
/// framing `collect` applies while reading. With one sentinel, stderr is
/// whatever follows it; with none, everything is stdout still in progress.
/// Bytes after the second sentinel are ignored.
pub fn decode_response(data: &[u8]) -> (Bytes, Bytes) {
    let mut sentinels = memchr_iter(SENTINEL, data);
    match sentinels.next() {
        Some(first) => {
            let end = sentinels.next().unwrap_or(data.len());
            (
                Bytes::copy_from_slice(&data[..first]),
                Bytes::copy_from_slice(&data[first + 1..end]),
            )
        }
        None => (Bytes::copy_from_slice(data), Bytes::new()),
    }
}

/// Frame `(stdout, stderr)` the way the device sends it after `OK`.
pub fn encode_device_response(stdout: &[u8], stderr: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(stdout.len() + stderr.len() + 2);
    out.put_slice(stdout);
    out.put_u8(SENTINEL);
    out.put_slice(stderr);
    out.put_u8(SENTINEL);
    out.freeze()
}

/// Interpret the 2-byte reply to [`RAW_PASTE_REQUEST`].
///
/// `Ok(true)` means raw-paste can be used, `Ok(false)` means the device
/// understood the request but wants standard raw mode.
pub fn is_raw_paste_supported(reply: &[u8]) -> Result<bool, ProtocolError> {
    match reply {
        RAW_PASTE_SUPPORTED => Ok(true),
        RAW_PASTE_UNSUPPORTED => Ok(false),
        other => Err(ProtocolError::UnknownRawPasteReply {
            reply: ByteStr::from(other),
        }),
    }
}

/// Trim device stderr and return it as text, or `None` if nothing is left.
pub fn extract_error(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Render non-printable bytes as `[xx]` for terminal display.
pub fn escape_non_printable(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &c in data {
        if matches!(c, 8 | 9 | 10 | 13 | 27) || (32..=126).contains(&c) {
            out.push(c);
        } else {
            out.extend_from_slice(format!("[{:02x}]", c).as_bytes());
        }
    }
    out
}
