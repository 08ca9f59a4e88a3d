//! Control keys the interactive loop handles itself.

/// Ctrl-]
pub const DETACH: u8 = 0x1d;
/// Ctrl-X
pub const DETACH_ALT: u8 = 0x18;
/// Ctrl-J
pub const INJECT_CODE: u8 = 0x0a;
/// Ctrl-K
pub const INJECT_FILE: u8 = 0x0b;

/// What a keystroke means to the interactive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// Leave the loop.
    Detach,
    /// Send the configured code snippet.
    InjectCode,
    /// Run the configured file in raw mode.
    InjectFile,
    /// Pass the byte to the device.
    Forward(u8),
}

impl Key {
    /// Classify `byte`. Inject keys only count when something is configured
    /// to inject; otherwise they are forwarded like any other key.
    pub fn classify(byte: u8, inject_code: bool, inject_file: bool) -> Key {
        match byte {
            DETACH | DETACH_ALT => Key::Detach,
            INJECT_CODE if inject_code => Key::InjectCode,
            INJECT_FILE if inject_file => Key::InjectFile,
            other => Key::Forward(other),
        }
    }
}
