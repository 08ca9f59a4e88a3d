//! In-memory raw REPL device for tests.
//!
//! `FakeDevice` speaks enough of the MicroPython REPL protocol to exercise
//! the engine: friendly prompt, raw REPL entry and exit, soft reset,
//! standard submission, and raw-paste with a configurable window. Every byte
//! the host writes is recorded so tests can assert on the wire.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::AbortHandle;

use crate::protocol::{self, CTRL_A, CTRL_B, CTRL_C, CTRL_D, CTRL_E, RAW_REPL_PROMPT};
use crate::session::SessionConfig;
use crate::transport::{Channel, ChildProcess};

pub(crate) const GREETING: &[u8] =
    b"MicroPython v1.24.0 on 2026-01-01; fake with fakecpu\r\nType \"help()\" for more information.\r\n>>> ";

impl Channel for tokio_test::io::Mock {}

/// Engine config with timings short enough for tests.
pub(crate) fn fast_config() -> SessionConfig {
    SessionConfig {
        timeout: Duration::from_millis(300),
        overall_timeout: Duration::from_millis(500),
        command_timeout: None,
        drain_settle: Duration::from_millis(5),
        drain_quiet: Duration::from_millis(10),
        drain_max: Duration::from_millis(100),
        chunk_size: 256,
        use_raw_paste: true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PasteSupport {
    /// Answers `R\x01` and the window size.
    Supported,
    /// Answers `R\x00`.
    Declined,
    /// Firmware that predates raw-paste and treats the request as input.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stall {
    /// Swallow a standard raw submission without answering `OK`.
    BeforeAccept,
    BeforeFirstEof,
    BeforeSecondEof,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeConfig {
    pub raw_paste: PasteSupport,
    pub window: u16,
    /// Abort a raw-paste transfer once this many body bytes arrived.
    pub abort_after: Option<usize>,
    pub reject_submission: bool,
    pub stall: Option<Stall>,
    pub mem_free: u64,
    /// Printed as soon as the device starts.
    pub banner: Option<&'static [u8]>,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            raw_paste: PasteSupport::Supported,
            window: 32,
            abort_after: None,
            reject_submission: false,
            stall: None,
            mem_free: 120 * 1024,
            banner: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PasteStats {
    /// Body bytes accepted during raw-paste.
    pub bytes: usize,
    /// Window refills sent after the initial window.
    pub credits_granted: usize,
    /// Bytes that arrived with no credit outstanding.
    pub overruns: usize,
}

#[derive(Debug, Default)]
struct Record {
    wire: Vec<u8>,
    soft_resets: usize,
    paste_requests: usize,
    submissions: usize,
    paste: PasteStats,
    executed: Vec<Vec<u8>>,
}

/// Handle for inspecting and killing a running fake device.
#[derive(Clone)]
pub(crate) struct FakeHandle {
    record: Arc<Mutex<Record>>,
    task: AbortHandle,
}

impl FakeHandle {
    /// Every byte the host has written.
    pub fn wire(&self) -> Vec<u8> {
        self.record.lock().unwrap().wire.clone()
    }

    pub fn soft_resets(&self) -> usize {
        self.record.lock().unwrap().soft_resets
    }

    pub fn paste_requests(&self) -> usize {
        self.record.lock().unwrap().paste_requests
    }

    /// Commands received in raw mode (both submission paths).
    pub fn submissions(&self) -> usize {
        self.record.lock().unwrap().submissions
    }

    pub fn paste_stats(&self) -> PasteStats {
        self.record.lock().unwrap().paste
    }

    /// Bodies the device ran, in order.
    pub fn executed(&self) -> Vec<Vec<u8>> {
        self.record.lock().unwrap().executed.clone()
    }

    /// Simulate the device dying; the host side sees EOF.
    pub fn kill(&self) {
        self.task.abort();
    }

    pub fn is_dead(&self) -> bool {
        self.task.is_finished()
    }
}

pub(crate) struct FakeDevice;

impl FakeDevice {
    /// Start a device task on the current runtime and return the host end.
    pub fn spawn(config: FakeConfig) -> (DuplexStream, FakeHandle) {
        let (host, device) = tokio::io::duplex(64 * 1024);
        let record = Arc::new(Mutex::new(Record::default()));
        let task = tokio::spawn(run(device, config, record.clone()));
        let handle = FakeHandle {
            record,
            task: task.abort_handle(),
        };
        (host, handle)
    }
}

async fn run(mut io: DuplexStream, config: FakeConfig, record: Arc<Mutex<Record>>) {
    if let Some(banner) = config.banner {
        if io.write_all(banner).await.is_err() {
            return;
        }
    }

    let mut machine = Machine::new(config, record);
    let mut buf = [0u8; 512];
    loop {
        let n = match io.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut out = Vec::new();
        for &b in &buf[..n] {
            machine.feed(b, &mut out);
        }
        if !out.is_empty() && io.write_all(&out).await.is_err() {
            break;
        }
    }
}

/// Simulated device wrapped as a child process, for the bridge.
pub(crate) struct FakeProcess {
    pub stream: DuplexStream,
    pub handle: FakeHandle,
}

impl tokio::io::AsyncRead for FakeProcess {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for FakeProcess {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Channel for FakeProcess {
    fn name(&self) -> String {
        "fake".to_string()
    }
}

impl ChildProcess for FakeProcess {
    fn has_exited(&mut self) -> bool {
        self.handle.is_dead()
    }

    fn terminate(&mut self) {
        self.handle.kill();
    }
}

#[derive(Debug)]
enum State {
    Friendly,
    Raw,
    /// Saw Ctrl-E on an empty line; `usize` bytes of `A\x01` matched.
    PasteRequest(usize),
    Paste { credit: usize, consumed: usize },
    PasteAborted,
    Stalled { stdout_done: bool },
}

struct Machine {
    config: FakeConfig,
    record: Arc<Mutex<Record>>,
    state: State,
    line: Vec<u8>,
}

impl Machine {
    fn new(config: FakeConfig, record: Arc<Mutex<Record>>) -> Self {
        Self {
            config,
            record,
            state: State::Friendly,
            line: Vec::new(),
        }
    }

    fn feed(&mut self, b: u8, out: &mut Vec<u8>) {
        self.record.lock().unwrap().wire.push(b);

        match self.state {
            State::Friendly => match b {
                CTRL_A => {
                    out.extend_from_slice(b"\r\n");
                    out.extend_from_slice(RAW_REPL_PROMPT);
                    self.line.clear();
                    self.state = State::Raw;
                }
                CTRL_C => {
                    self.line.clear();
                    out.extend_from_slice(b"\r\nKeyboardInterrupt\r\n>>> ");
                }
                CTRL_D if self.line.is_empty() => {
                    self.record.lock().unwrap().soft_resets += 1;
                    out.extend_from_slice(b"MPY: soft reboot\r\n");
                    out.extend_from_slice(GREETING);
                }
                b'\r' => {
                    let line = std::mem::take(&mut self.line);
                    out.extend_from_slice(b"\r\n");
                    if !line.is_empty() {
                        let (stdout, stderr) = execute(&line, self.config.mem_free);
                        out.extend_from_slice(&stdout);
                        out.extend_from_slice(&stderr);
                    }
                    out.extend_from_slice(b">>> ");
                }
                b'\n' => {}
                other => {
                    self.line.push(other);
                    out.push(other);
                }
            },

            State::Raw => match b {
                CTRL_A => {
                    self.line.clear();
                    out.extend_from_slice(RAW_REPL_PROMPT);
                }
                CTRL_B => {
                    self.line.clear();
                    out.extend_from_slice(b"\r\n");
                    out.extend_from_slice(GREETING);
                    self.state = State::Friendly;
                }
                CTRL_C => self.line.clear(),
                CTRL_D if self.line.is_empty() => {
                    self.record.lock().unwrap().soft_resets += 1;
                    out.extend_from_slice(b"OK\r\nMPY: soft reboot\r\n");
                    out.extend_from_slice(RAW_REPL_PROMPT);
                }
                CTRL_D => {
                    let body = std::mem::take(&mut self.line);
                    self.record.lock().unwrap().submissions += 1;
                    if self.config.reject_submission {
                        out.extend_from_slice(b"XX");
                        out.push(b'>');
                    } else if self.config.stall == Some(Stall::BeforeAccept) {
                        self.state = State::Stalled { stdout_done: false };
                    } else {
                        out.extend_from_slice(b"OK");
                        self.respond(&body, out);
                    }
                }
                CTRL_E if self.line.is_empty() && self.config.raw_paste != PasteSupport::Legacy => {
                    self.state = State::PasteRequest(0);
                }
                other => self.line.push(other),
            },

            State::PasteRequest(matched) => {
                if b != b"A\x01"[matched] {
                    self.state = State::Raw;
                    self.line.push(b);
                    return;
                }
                if matched == 0 {
                    self.state = State::PasteRequest(1);
                    return;
                }
                self.record.lock().unwrap().paste_requests += 1;
                match self.config.raw_paste {
                    PasteSupport::Supported => {
                        out.extend_from_slice(b"R\x01");
                        out.extend_from_slice(&self.config.window.to_le_bytes());
                        self.state = State::Paste {
                            credit: self.config.window as usize,
                            consumed: 0,
                        };
                    }
                    _ => {
                        out.extend_from_slice(b"R\x00");
                        self.state = State::Raw;
                    }
                }
            }

            State::Paste { credit, consumed } => {
                if b == CTRL_D {
                    let body = std::mem::take(&mut self.line);
                    self.record.lock().unwrap().submissions += 1;
                    out.push(CTRL_D);
                    self.respond(&body, out);
                    return;
                }

                let window = self.config.window as usize;
                let mut record = self.record.lock().unwrap();
                if credit == 0 {
                    record.paste.overruns += 1;
                }
                record.paste.bytes += 1;
                let accepted = record.paste.bytes;
                self.line.push(b);

                if self.config.abort_after.is_some_and(|limit| accepted >= limit) {
                    out.push(CTRL_D);
                    self.state = State::PasteAborted;
                    return;
                }

                let (mut credit, mut consumed) = (credit.saturating_sub(1), consumed + 1);
                if consumed == window {
                    out.push(CTRL_A);
                    record.paste.credits_granted += 1;
                    credit += window;
                    consumed = 0;
                }
                self.state = State::Paste { credit, consumed };
            }

            State::PasteAborted => {
                if b == CTRL_D {
                    self.line.clear();
                    self.record.lock().unwrap().submissions += 1;
                    out.extend_from_slice(&protocol::encode_device_response(b"", b"aborted\r\n"));
                    out.push(b'>');
                    self.state = State::Raw;
                }
            }

            State::Stalled { stdout_done } => {
                if b == CTRL_C {
                    if !stdout_done {
                        out.push(CTRL_D);
                    }
                    out.extend_from_slice(b"KeyboardInterrupt: \r\n");
                    out.push(CTRL_D);
                    out.push(b'>');
                    self.state = State::Raw;
                }
            }
        }
    }

    /// Run a body and frame its output, honouring the stall setting.
    fn respond(&mut self, body: &[u8], out: &mut Vec<u8>) {
        self.record.lock().unwrap().executed.push(body.to_vec());
        let (stdout, stderr) = execute(body, self.config.mem_free);
        match self.config.stall {
            Some(Stall::BeforeFirstEof) => {
                out.extend_from_slice(&stdout);
                self.state = State::Stalled { stdout_done: false };
            }
            Some(Stall::BeforeSecondEof) => {
                out.extend_from_slice(&stdout);
                out.push(CTRL_D);
                out.extend_from_slice(&stderr);
                self.state = State::Stalled { stdout_done: true };
            }
            Some(Stall::BeforeAccept) | None => {
                out.extend_from_slice(&protocol::encode_device_response(&stdout, &stderr));
                out.push(b'>');
                self.state = State::Raw;
            }
        }
    }
}

enum Value {
    Int(i64),
    Str(String),
    Literal(String),
}

impl Value {
    fn printed(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Str(s) | Value::Literal(s) => s.clone(),
        }
    }

    fn json(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Str(s) => format!("\"{s}\""),
            Value::Literal(s) => s.clone(),
        }
    }
}

fn traceback(kind: &str) -> Vec<u8> {
    format!("Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\n{kind}\r\n")
        .into_bytes()
}

/// A tiny evaluator covering the expressions the tests send.
fn evaluate(expr: &str, mem_free: u64) -> Result<Value, Vec<u8>> {
    let expr = expr.trim();
    if let Some(inner) = expr.strip_prefix("json.dumps(").and_then(|s| s.strip_suffix(')')) {
        return evaluate(inner, mem_free).map(|v| Value::Literal(v.json()));
    }
    if expr == "__import__('gc').mem_free()" {
        return Ok(Value::Int(mem_free as i64));
    }
    if expr.len() >= 2
        && ((expr.starts_with('\'') && expr.ends_with('\''))
            || (expr.starts_with('"') && expr.ends_with('"')))
    {
        return Ok(Value::Str(expr[1..expr.len() - 1].to_string()));
    }
    if expr.starts_with('[') {
        return Ok(Value::Literal(expr.to_string()));
    }
    if let Ok(n) = expr.parse::<i64>() {
        return Ok(Value::Int(n));
    }
    if expr.contains('+') {
        let mut sum = 0;
        for term in expr.split('+') {
            match evaluate(term, mem_free)? {
                Value::Int(n) => sum += n,
                _ => return Err(traceback("TypeError: unsupported types for __add__")),
            }
        }
        return Ok(Value::Int(sum));
    }
    Err(traceback(&format!("NameError: name '{expr}' isn't defined")))
}

fn execute(body: &[u8], mem_free: u64) -> (Vec<u8>, Vec<u8>) {
    let text = String::from_utf8_lossy(body);
    let mut stdout = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() || line.starts_with("import ") {
            continue;
        }
        if line.starts_with("raise") {
            return (stdout, traceback("ValueError: boom"));
        }
        let result = match line.strip_prefix("print(").and_then(|s| s.strip_suffix(')')) {
            Some(inner) => evaluate(inner, mem_free).map(|v| Some(v.printed())),
            None => evaluate(line, mem_free).map(|_| None),
        };
        match result {
            Ok(Some(printed)) => {
                stdout.extend_from_slice(printed.as_bytes());
                stdout.extend_from_slice(b"\r\n");
            }
            Ok(None) => {}
            Err(stderr) => return (stdout, stderr),
        }
    }
    (stdout, Vec::new())
}
