//! Server side of RFC 2217 (Telnet COM-PORT-OPTION).
//!
//! The port being served is virtual: a child process on a pty has no baud
//! rate or modem lines. Settings requested by the client are stored and
//! echoed back so client tooling is satisfied, and the modem lines always
//! read as CTS, DSR and CD active.
//!
//! [`PortManager`] never touches the socket itself. Negotiation replies are
//! queued and handed out by [`PortManager::take_outgoing`], so the redirect
//! loop stays the only writer.

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};
use tokio_serial::{DataBits, FlowControl, Parity, StopBits};

// Telnet commands.
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

// Telnet options.
pub const BINARY: u8 = 0;
pub const ECHO: u8 = 1;
pub const SGA: u8 = 3;
pub const COM_PORT_OPTION: u8 = 44;

// COM-PORT-OPTION client requests. Server replies add `SERVER_OFFSET`.
pub const SET_BAUDRATE: u8 = 1;
pub const SET_DATASIZE: u8 = 2;
pub const SET_PARITY: u8 = 3;
pub const SET_STOPSIZE: u8 = 4;
pub const SET_CONTROL: u8 = 5;
pub const NOTIFY_LINESTATE: u8 = 6;
pub const NOTIFY_MODEMSTATE: u8 = 7;
pub const FLOWCONTROL_SUSPEND: u8 = 8;
pub const FLOWCONTROL_RESUME: u8 = 9;
pub const SET_LINESTATE_MASK: u8 = 10;
pub const SET_MODEMSTATE_MASK: u8 = 11;
pub const PURGE_DATA: u8 = 12;
pub const SERVER_OFFSET: u8 = 100;

// SET_CONTROL values.
const CONTROL_REQ_FLOW_SETTING: u8 = 0;
const CONTROL_USE_NO_FLOW_CONTROL: u8 = 1;
const CONTROL_USE_SW_FLOW_CONTROL: u8 = 2;
const CONTROL_USE_HW_FLOW_CONTROL: u8 = 3;
const CONTROL_REQ_BREAK_STATE: u8 = 4;
const CONTROL_BREAK_ON: u8 = 5;
const CONTROL_BREAK_OFF: u8 = 6;
const CONTROL_REQ_DTR: u8 = 7;
const CONTROL_DTR_ON: u8 = 8;
const CONTROL_DTR_OFF: u8 = 9;
const CONTROL_REQ_RTS: u8 = 10;
const CONTROL_RTS_ON: u8 = 11;
const CONTROL_RTS_OFF: u8 = 12;

// PURGE_DATA values.
const PURGE_RECEIVE_BUFFER: u8 = 1;
const PURGE_TRANSMIT_BUFFER: u8 = 2;
const PURGE_BOTH_BUFFERS: u8 = 3;

// NOTIFY_MODEMSTATE bits.
pub const MODEMSTATE_CD: u8 = 0x80;
pub const MODEMSTATE_RI: u8 = 0x40;
pub const MODEMSTATE_DSR: u8 = 0x20;
pub const MODEMSTATE_CTS: u8 = 0x10;
pub const MODEMSTATE_CD_CHANGE: u8 = 0x08;
pub const MODEMSTATE_RI_CHANGE: u8 = 0x04;
pub const MODEMSTATE_DSR_CHANGE: u8 = 0x02;
pub const MODEMSTATE_CTS_CHANGE: u8 = 0x01;

/// Settings of the virtual serial port, as last requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    pub dtr: bool,
    pub rts: bool,
    pub break_condition: bool,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            dtr: true,
            rts: true,
            break_condition: false,
        }
    }
}

/// Modem input lines. A subprocess has no real lines, so they are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemLines {
    pub cts: bool,
    pub dsr: bool,
    pub ri: bool,
    pub cd: bool,
}

impl Default for ModemLines {
    fn default() -> Self {
        Self {
            cts: true,
            dsr: true,
            ri: false,
            cd: true,
        }
    }
}

impl ModemLines {
    fn state(self) -> u8 {
        let mut state = 0;
        if self.cts {
            state |= MODEMSTATE_CTS;
        }
        if self.dsr {
            state |= MODEMSTATE_DSR;
        }
        if self.ri {
            state |= MODEMSTATE_RI;
        }
        if self.cd {
            state |= MODEMSTATE_CD;
        }
        state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionState {
    Requested,
    Active,
    Inactive,
}

/// One side of one Telnet option.
#[derive(Debug)]
struct TelnetOption {
    name: &'static str,
    option: u8,
    send_yes: u8,
    send_no: u8,
    ack_yes: u8,
    ack_no: u8,
    state: OptionState,
    /// Agreement on this option means the client speaks RFC 2217.
    com_port: bool,
}

impl TelnetOption {
    /// An option we offer (`WILL`), acknowledged by `DO`.
    fn ours(name: &'static str, option: u8, state: OptionState) -> Self {
        Self {
            name,
            option,
            send_yes: WILL,
            send_no: WONT,
            ack_yes: DO,
            ack_no: DONT,
            state,
            com_port: false,
        }
    }

    /// An option we ask the client for (`DO`), acknowledged by `WILL`.
    fn theirs(name: &'static str, option: u8, state: OptionState) -> Self {
        Self {
            name,
            option,
            send_yes: DO,
            send_no: DONT,
            ack_yes: WILL,
            ack_no: WONT,
            state,
            com_port: false,
        }
    }

    fn com_port(mut self) -> Self {
        self.com_port = true;
        self
    }
}

/// What an option wants done after an incoming negotiation.
struct Negotiated {
    reply: Option<u8>,
    activated: bool,
}

impl TelnetOption {
    fn process_incoming(&mut self, command: u8) -> Negotiated {
        let mut result = Negotiated {
            reply: None,
            activated: false,
        };
        if command == self.ack_yes {
            match self.state {
                OptionState::Requested => {
                    self.state = OptionState::Active;
                    result.activated = true;
                }
                OptionState::Active => {}
                OptionState::Inactive => {
                    self.state = OptionState::Active;
                    result.reply = Some(self.send_yes);
                    result.activated = true;
                }
            }
        } else if command == self.ack_no {
            match self.state {
                OptionState::Requested => self.state = OptionState::Inactive,
                OptionState::Active => {
                    self.state = OptionState::Inactive;
                    result.reply = Some(self.send_no);
                }
                OptionState::Inactive => {}
            }
        }
        trace!("telnet option {} -> {:?}", self.name, self.state);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Normal,
    IacSeen,
    Negotiate(u8),
}

/// RFC 2217 port manager for one client connection.
#[derive(Debug)]
pub struct PortManager {
    options: Vec<TelnetOption>,
    settings: PortSettings,
    lines: ModemLines,
    state: FilterState,
    suboption: Option<Vec<u8>>,
    outgoing: BytesMut,
    client_is_rfc2217: bool,
    last_modemstate: Option<u8>,
    linestate_mask: u8,
    modemstate_mask: u8,
    remote_suspend_flow: bool,
}

impl Default for PortManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PortManager {
    /// Create a manager and queue the initial option requests.
    pub fn new() -> Self {
        let options = vec![
            TelnetOption::ours("ECHO", ECHO, OptionState::Requested),
            TelnetOption::ours("we-SGA", SGA, OptionState::Requested),
            TelnetOption::theirs("they-SGA", SGA, OptionState::Inactive),
            TelnetOption::ours("we-BINARY", BINARY, OptionState::Inactive),
            TelnetOption::theirs("they-BINARY", BINARY, OptionState::Requested),
            TelnetOption::ours("we-RFC2217", COM_PORT_OPTION, OptionState::Requested).com_port(),
            TelnetOption::theirs("they-RFC2217", COM_PORT_OPTION, OptionState::Inactive).com_port(),
        ];
        let mut manager = Self {
            options,
            settings: PortSettings::default(),
            lines: ModemLines::default(),
            state: FilterState::Normal,
            suboption: None,
            outgoing: BytesMut::new(),
            client_is_rfc2217: false,
            last_modemstate: None,
            linestate_mask: 0,
            modemstate_mask: 0xff,
            remote_suspend_flow: false,
        };
        let initial = manager.initial_requests();
        manager.outgoing.put_slice(&initial);
        manager
    }

    /// Option requests the server opens a connection with.
    pub fn initial_requests(&self) -> Bytes {
        let mut out = BytesMut::new();
        for opt in self.options.iter().filter(|o| o.state == OptionState::Requested) {
            out.put_slice(&[IAC, opt.send_yes, opt.option]);
        }
        out.freeze()
    }

    /// Current virtual port settings.
    pub fn settings(&self) -> &PortSettings {
        &self.settings
    }

    /// Whether the client has agreed to COM-PORT-OPTION.
    pub fn client_is_rfc2217(&self) -> bool {
        self.client_is_rfc2217
    }

    /// Whether the client asked the server to pause sending.
    pub fn flow_suspended(&self) -> bool {
        self.remote_suspend_flow
    }

    /// Replies queued since the last call.
    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        (!self.outgoing.is_empty()).then(|| self.outgoing.split().freeze())
    }

    /// Escape device output for the Telnet stream (double every `IAC`).
    pub fn escape(&self, data: &[u8]) -> Bytes {
        if !data.contains(&IAC) {
            return Bytes::copy_from_slice(data);
        }
        let mut out = BytesMut::with_capacity(data.len() + 8);
        for &b in data {
            out.put_u8(b);
            if b == IAC {
                out.put_u8(IAC);
            }
        }
        out.freeze()
    }

    /// Strip Telnet negotiation from client input and return the payload.
    ///
    /// Negotiation may be split across calls; state carries over.
    pub fn filter(&mut self, data: &[u8]) -> Bytes {
        let mut payload = BytesMut::with_capacity(data.len());
        for &b in data {
            match self.state {
                FilterState::Normal => {
                    if b == IAC {
                        self.state = FilterState::IacSeen;
                    } else {
                        self.push_data(b, &mut payload);
                    }
                }
                FilterState::IacSeen => {
                    self.state = FilterState::Normal;
                    match b {
                        IAC => self.push_data(IAC, &mut payload),
                        SB => self.suboption = Some(Vec::new()),
                        SE => match self.suboption.take() {
                            Some(sub) => self.process_subnegotiation(&sub),
                            None => warn!("telnet SE without SB"),
                        },
                        DO | DONT | WILL | WONT => self.state = FilterState::Negotiate(b),
                        other => debug!("ignoring telnet command {}", other),
                    }
                }
                FilterState::Negotiate(command) => {
                    self.state = FilterState::Normal;
                    self.negotiate(command, b);
                }
            }
        }
        payload.freeze()
    }

    fn push_data(&mut self, b: u8, payload: &mut BytesMut) {
        match &mut self.suboption {
            Some(sub) => sub.push(b),
            None => payload.put_u8(b),
        }
    }

    fn send_option(&mut self, action: u8, option: u8) {
        self.outgoing.put_slice(&[IAC, action, option]);
    }

    fn send_subnegotiation(&mut self, code: u8, value: &[u8]) {
        self.outgoing.put_slice(&[IAC, SB, COM_PORT_OPTION, code]);
        for &b in value {
            self.outgoing.put_u8(b);
            if b == IAC {
                self.outgoing.put_u8(IAC);
            }
        }
        self.outgoing.put_slice(&[IAC, SE]);
    }

    fn negotiate(&mut self, command: u8, option: u8) {
        let mut known = false;
        let mut replies = Vec::new();
        let mut client_ok = false;
        for opt in self.options.iter_mut().filter(|o| o.option == option) {
            known = true;
            let result = opt.process_incoming(command);
            if let Some(action) = result.reply {
                replies.push((action, opt.option));
            }
            client_ok |= result.activated && opt.com_port;
        }

        for (action, option) in replies {
            self.send_option(action, option);
        }

        if !known && (command == WILL || command == DO) {
            let refusal = if command == WILL { DONT } else { WONT };
            debug!("rejecting unknown telnet option {}", option);
            self.send_option(refusal, option);
        }

        if client_ok {
            debug!("client speaks RFC 2217");
            self.client_is_rfc2217 = true;
            self.check_modem_lines(true);
        }
    }

    fn process_subnegotiation(&mut self, sub: &[u8]) {
        let [COM_PORT_OPTION, code, value @ ..] = sub else {
            warn!("unknown telnet subnegotiation {:?}", sub);
            return;
        };
        let first = value.first().copied();

        match *code {
            SET_BAUDRATE => {
                if let Ok(raw) = <[u8; 4]>::try_from(value) {
                    let baud = u32::from_be_bytes(raw);
                    if baud != 0 {
                        self.settings.baud_rate = baud;
                    }
                    debug!("baud rate: {}", self.settings.baud_rate);
                } else {
                    warn!("malformed SET_BAUDRATE {:?}", value);
                }
                let reply = self.settings.baud_rate.to_be_bytes();
                self.send_subnegotiation(SET_BAUDRATE + SERVER_OFFSET, &reply);
            }
            SET_DATASIZE => {
                if let Some(bits) = first.and_then(data_bits_from_wire) {
                    self.settings.data_bits = bits;
                }
                let reply = [data_bits_to_wire(self.settings.data_bits)];
                self.send_subnegotiation(SET_DATASIZE + SERVER_OFFSET, &reply);
            }
            SET_PARITY => {
                if let Some(parity) = first.and_then(parity_from_wire) {
                    self.settings.parity = parity;
                }
                let reply = [parity_to_wire(self.settings.parity)];
                self.send_subnegotiation(SET_PARITY + SERVER_OFFSET, &reply);
            }
            SET_STOPSIZE => {
                if let Some(stop) = first.and_then(stop_bits_from_wire) {
                    self.settings.stop_bits = stop;
                }
                let reply = [stop_bits_to_wire(self.settings.stop_bits)];
                self.send_subnegotiation(SET_STOPSIZE + SERVER_OFFSET, &reply);
            }
            SET_CONTROL => self.process_control(first),
            NOTIFY_LINESTATE => self.send_subnegotiation(NOTIFY_LINESTATE + SERVER_OFFSET, &[0]),
            NOTIFY_MODEMSTATE => self.check_modem_lines(true),
            FLOWCONTROL_SUSPEND => self.remote_suspend_flow = true,
            FLOWCONTROL_RESUME => self.remote_suspend_flow = false,
            SET_LINESTATE_MASK => {
                self.linestate_mask = first.unwrap_or(0);
                let reply = [self.linestate_mask];
                self.send_subnegotiation(SET_LINESTATE_MASK + SERVER_OFFSET, &reply);
            }
            SET_MODEMSTATE_MASK => {
                self.modemstate_mask = first.unwrap_or(0xff);
                let reply = [self.modemstate_mask];
                self.send_subnegotiation(SET_MODEMSTATE_MASK + SERVER_OFFSET, &reply);
            }
            PURGE_DATA => match first {
                // Nothing is buffered on a virtual port; just acknowledge.
                Some(which @ (PURGE_RECEIVE_BUFFER | PURGE_TRANSMIT_BUFFER | PURGE_BOTH_BUFFERS)) => {
                    self.send_subnegotiation(PURGE_DATA + SERVER_OFFSET, &[which]);
                }
                other => warn!("undefined PURGE_DATA: {:?}", other),
            },
            other => warn!("undefined COM_PORT_OPTION: {}", other),
        }
    }

    fn process_control(&mut self, value: Option<u8>) {
        let reply = match value {
            Some(CONTROL_REQ_FLOW_SETTING) => Some(match self.settings.flow_control {
                FlowControl::Software => CONTROL_USE_SW_FLOW_CONTROL,
                FlowControl::Hardware => CONTROL_USE_HW_FLOW_CONTROL,
                FlowControl::None => CONTROL_USE_NO_FLOW_CONTROL,
            }),
            Some(CONTROL_USE_NO_FLOW_CONTROL) => {
                self.settings.flow_control = FlowControl::None;
                value
            }
            Some(CONTROL_USE_SW_FLOW_CONTROL) => {
                self.settings.flow_control = FlowControl::Software;
                value
            }
            Some(CONTROL_USE_HW_FLOW_CONTROL) => {
                self.settings.flow_control = FlowControl::Hardware;
                value
            }
            Some(CONTROL_BREAK_ON) => {
                self.settings.break_condition = true;
                value
            }
            Some(CONTROL_BREAK_OFF) => {
                self.settings.break_condition = false;
                value
            }
            Some(CONTROL_DTR_ON) => {
                self.settings.dtr = true;
                value
            }
            Some(CONTROL_DTR_OFF) => {
                self.settings.dtr = false;
                value
            }
            Some(CONTROL_RTS_ON) => {
                self.settings.rts = true;
                value
            }
            Some(CONTROL_RTS_OFF) => {
                self.settings.rts = false;
                value
            }
            Some(CONTROL_REQ_BREAK_STATE | CONTROL_REQ_DTR | CONTROL_REQ_RTS) => {
                warn!("SET_CONTROL request {:?} not implemented", value);
                None
            }
            other => {
                warn!("undefined SET_CONTROL: {:?}", other);
                None
            }
        };
        if let Some(reply) = reply {
            self.send_subnegotiation(SET_CONTROL + SERVER_OFFSET, &[reply]);
        }
    }

    /// Queue a modem state notification if the lines changed, or always when
    /// `force` is set.
    pub fn check_modem_lines(&mut self, force: bool) {
        let mut state = self.lines.state();
        let deltas = state ^ self.last_modemstate.unwrap_or(0);
        if deltas & MODEMSTATE_CTS != 0 {
            state |= MODEMSTATE_CTS_CHANGE;
        }
        if deltas & MODEMSTATE_DSR != 0 {
            state |= MODEMSTATE_DSR_CHANGE;
        }
        if deltas & MODEMSTATE_RI != 0 {
            state |= MODEMSTATE_RI_CHANGE;
        }
        if deltas & MODEMSTATE_CD != 0 {
            state |= MODEMSTATE_CD_CHANGE;
        }

        if Some(state) != self.last_modemstate || force {
            if (self.client_is_rfc2217 && state & self.modemstate_mask != 0) || force {
                let masked = state & self.modemstate_mask;
                trace!("modem state notification {:#04x}", masked);
                self.send_subnegotiation(NOTIFY_MODEMSTATE + SERVER_OFFSET, &[masked]);
            }
            self.last_modemstate = Some(state & 0xf0);
        }
    }
}

fn data_bits_from_wire(v: u8) -> Option<DataBits> {
    match v {
        5 => Some(DataBits::Five),
        6 => Some(DataBits::Six),
        7 => Some(DataBits::Seven),
        8 => Some(DataBits::Eight),
        _ => None,
    }
}

fn data_bits_to_wire(bits: DataBits) -> u8 {
    match bits {
        DataBits::Five => 5,
        DataBits::Six => 6,
        DataBits::Seven => 7,
        DataBits::Eight => 8,
    }
}

// Mark and space parity have no counterpart on the host side and are refused.
fn parity_from_wire(v: u8) -> Option<Parity> {
    match v {
        1 => Some(Parity::None),
        2 => Some(Parity::Odd),
        3 => Some(Parity::Even),
        _ => None,
    }
}

fn parity_to_wire(parity: Parity) -> u8 {
    match parity {
        Parity::None => 1,
        Parity::Odd => 2,
        Parity::Even => 3,
    }
}

fn stop_bits_from_wire(v: u8) -> Option<StopBits> {
    match v {
        1 => Some(StopBits::One),
        2 => Some(StopBits::Two),
        _ => None,
    }
}

fn stop_bits_to_wire(stop: StopBits) -> u8 {
    match stop {
        StopBits::One => 1,
        StopBits::Two => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> PortManager {
        let mut pm = PortManager::new();
        pm.take_outgoing();
        pm
    }

    #[test]
    fn test_initial_requests() {
        let mut pm = PortManager::new();
        let expected = [
            IAC, WILL, ECHO, IAC, WILL, SGA, IAC, DO, BINARY, IAC, WILL, COM_PORT_OPTION,
        ];
        assert_eq!(&pm.initial_requests()[..], &expected);
        assert_eq!(pm.take_outgoing().as_deref(), Some(&expected[..]));
        assert_eq!(pm.take_outgoing(), None);
    }

    #[test]
    fn test_escape_doubles_iac() {
        let pm = fresh();
        assert_eq!(&pm.escape(b"ab")[..], b"ab");
        assert_eq!(&pm.escape(&[1, 0xff, 2])[..], &[1, 0xff, 0xff, 2]);
    }

    #[test]
    fn test_filter_strips_negotiation() {
        let mut pm = fresh();
        let data = pm.filter(&[b'a', IAC, DO, ECHO, b'b', IAC, IAC, b'c']);
        assert_eq!(&data[..], &[b'a', b'b', 0xff, b'c']);
        // DO ECHO acknowledges our request; nothing to answer.
        assert_eq!(pm.take_outgoing(), None);
    }

    #[test]
    fn test_filter_across_chunks() {
        let mut pm = fresh();
        assert!(pm.filter(&[b'x', IAC]).len() == 1);
        assert!(pm.filter(&[WILL]).is_empty());
        let data = pm.filter(&[24, b'y']);
        assert_eq!(&data[..], b"y");
        assert_eq!(pm.take_outgoing().as_deref(), Some(&[IAC, DONT, 24][..]));
    }

    #[test]
    fn test_unknown_do_is_refused() {
        let mut pm = fresh();
        pm.filter(&[IAC, DO, 31]);
        assert_eq!(pm.take_outgoing().as_deref(), Some(&[IAC, WONT, 31][..]));
    }

    #[test]
    fn test_inactive_option_follows_client() {
        let mut pm = fresh();
        pm.filter(&[IAC, DO, BINARY]);
        assert_eq!(pm.take_outgoing().as_deref(), Some(&[IAC, WILL, BINARY][..]));
        pm.filter(&[IAC, DO, BINARY]);
        assert_eq!(pm.take_outgoing(), None);

        pm.filter(&[IAC, DONT, BINARY]);
        assert_eq!(pm.take_outgoing().as_deref(), Some(&[IAC, WONT, BINARY][..]));
        pm.filter(&[IAC, DONT, BINARY]);
        assert_eq!(pm.take_outgoing(), None);
    }

    #[test]
    fn test_com_port_agreement_forces_modem_state() {
        let mut pm = fresh();
        pm.filter(&[IAC, DO, COM_PORT_OPTION]);
        assert!(pm.client_is_rfc2217());
        // CTS, DSR and CD active, each flagged as changed.
        let state = MODEMSTATE_CTS
            | MODEMSTATE_DSR
            | MODEMSTATE_CD
            | MODEMSTATE_CTS_CHANGE
            | MODEMSTATE_DSR_CHANGE
            | MODEMSTATE_CD_CHANGE;
        let expected = [IAC, SB, COM_PORT_OPTION, NOTIFY_MODEMSTATE + SERVER_OFFSET, state, IAC, SE];
        assert_eq!(pm.take_outgoing().as_deref(), Some(&expected[..]));

        // Lines never change, so the periodic poll stays quiet.
        pm.check_modem_lines(false);
        pm.check_modem_lines(false);
        let quiet = pm.take_outgoing();
        assert!(quiet.is_none(), "{quiet:?}");
    }

    #[test]
    fn test_set_baudrate() {
        let mut pm = fresh();
        pm.filter(&[IAC, SB, COM_PORT_OPTION, SET_BAUDRATE, 0, 0, 0x25, 0x80, IAC, SE]);
        assert_eq!(pm.settings().baud_rate, 9600);
        let expected = [
            IAC, SB, COM_PORT_OPTION, SET_BAUDRATE + SERVER_OFFSET, 0, 0, 0x25, 0x80, IAC, SE,
        ];
        assert_eq!(pm.take_outgoing().as_deref(), Some(&expected[..]));
    }

    #[test]
    fn test_baudrate_query_and_iac_in_value() {
        let mut pm = fresh();
        // Zero asks for the current value.
        pm.filter(&[IAC, SB, COM_PORT_OPTION, SET_BAUDRATE, 0, 0, 0, 0, IAC, SE]);
        assert_eq!(pm.settings().baud_rate, 115_200);
        pm.take_outgoing();

        // 0xff inside a value is doubled both ways.
        pm.filter(&[IAC, SB, COM_PORT_OPTION, SET_BAUDRATE, 0, 0, 0, IAC, IAC, IAC, SE]);
        assert_eq!(pm.settings().baud_rate, 255);
        let expected = [
            IAC, SB, COM_PORT_OPTION, SET_BAUDRATE + SERVER_OFFSET, 0, 0, 0, IAC, IAC, IAC, SE,
        ];
        assert_eq!(pm.take_outgoing().as_deref(), Some(&expected[..]));
    }

    #[test]
    fn test_line_settings() {
        let mut pm = fresh();
        pm.filter(&[IAC, SB, COM_PORT_OPTION, SET_DATASIZE, 7, IAC, SE]);
        pm.filter(&[IAC, SB, COM_PORT_OPTION, SET_PARITY, 3, IAC, SE]);
        pm.filter(&[IAC, SB, COM_PORT_OPTION, SET_STOPSIZE, 2, IAC, SE]);
        // Mark parity is refused and the current value reported.
        pm.filter(&[IAC, SB, COM_PORT_OPTION, SET_PARITY, 4, IAC, SE]);

        let s = pm.settings();
        assert_eq!(s.data_bits, DataBits::Seven);
        assert_eq!(s.parity, Parity::Even);
        assert_eq!(s.stop_bits, StopBits::Two);

        let out = pm.take_outgoing().unwrap();
        let parity_reply = [IAC, SB, COM_PORT_OPTION, SET_PARITY + SERVER_OFFSET, 3, IAC, SE];
        assert!(out.ends_with(&parity_reply));
    }

    #[test]
    fn test_control_and_purge() {
        let mut pm = fresh();
        pm.filter(&[IAC, SB, COM_PORT_OPTION, SET_CONTROL, CONTROL_DTR_OFF, IAC, SE]);
        assert!(!pm.settings().dtr);
        assert_eq!(
            pm.take_outgoing().as_deref(),
            Some(&[IAC, SB, COM_PORT_OPTION, SET_CONTROL + SERVER_OFFSET, CONTROL_DTR_OFF, IAC, SE][..])
        );

        pm.filter(&[IAC, SB, COM_PORT_OPTION, SET_CONTROL, CONTROL_REQ_FLOW_SETTING, IAC, SE]);
        assert_eq!(
            pm.take_outgoing().as_deref(),
            Some(&[IAC, SB, COM_PORT_OPTION, SET_CONTROL + SERVER_OFFSET, CONTROL_USE_NO_FLOW_CONTROL, IAC, SE][..])
        );

        pm.filter(&[IAC, SB, COM_PORT_OPTION, PURGE_DATA, PURGE_BOTH_BUFFERS, IAC, SE]);
        assert_eq!(
            pm.take_outgoing().as_deref(),
            Some(&[IAC, SB, COM_PORT_OPTION, PURGE_DATA + SERVER_OFFSET, PURGE_BOTH_BUFFERS, IAC, SE][..])
        );

        pm.filter(&[IAC, SB, COM_PORT_OPTION, FLOWCONTROL_SUSPEND, IAC, SE]);
        assert!(pm.flow_suspended());
        pm.filter(&[IAC, SB, COM_PORT_OPTION, FLOWCONTROL_RESUME, IAC, SE]);
        assert!(!pm.flow_suspended());
        assert_eq!(pm.take_outgoing(), None);
    }
}
