use std::fmt;
use std::str::FromStr;

/// Why a message exists. Requests are sent in the `Port` context; the driver
/// answers with `Result` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Context {
    Ping = 0x01,
    Port = 0x02,
    Result = 0x03,
    Error = 0x04,
}

/// Control selectors understood by the driver's user client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    // ---- Reserved ----
    PingPong = 0,

    // ---- Status ----
    GetStatus = 1,

    // ---- Ports ----
    CreatePort = 2,
    RemovePort = 3,

    // ---- Links ----
    LinkPorts = 4,
    UnlinkPorts = 5,

    // ---- Lists ----
    GetPortList = 6,
    GetLinkList = 7,

    // ---- Diagnostics ----
    EnableChecks = 8,
    EnableTrace = 9,

    // Shares its value with the table sentinel: never dispatched, the
    // terminate path of the connection carries it instead.
    Shutdown = 10,
}

/// Terminal sentinel of the dispatch table.
pub const LAST_COMMAND: u8 = Command::Shutdown as u8;

impl Command {
    pub const ALL: [Command; 11] = [
        Command::PingPong,
        Command::GetStatus,
        Command::CreatePort,
        Command::RemovePort,
        Command::LinkPorts,
        Command::UnlinkPorts,
        Command::GetPortList,
        Command::GetLinkList,
        Command::EnableChecks,
        Command::EnableTrace,
        Command::Shutdown,
    ];

    /// True for selectors in `[1, LAST_COMMAND)`.
    pub fn is_dispatchable(selector: u64) -> bool {
        selector >= 1 && selector < LAST_COMMAND as u64
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::PingPong => "PingPong",
            Command::GetStatus => "GetStatus",
            Command::CreatePort => "CreatePort",
            Command::RemovePort => "RemovePort",
            Command::LinkPorts => "LinkPorts",
            Command::UnlinkPorts => "UnlinkPorts",
            Command::GetPortList => "GetPortList",
            Command::GetLinkList => "GetLinkList",
            Command::EnableChecks => "EnableChecks",
            Command::EnableTrace => "EnableTrace",
            Command::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Command::ALL.get(v as usize).copied().ok_or(v)
    }
}

impl TryFrom<u8> for Context {
    type Error = u8;
    // `Self::Error` would be ambiguous with `Context::Error`
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x01 => Ok(Context::Ping),
            0x02 => Ok(Context::Port),
            0x03 => Ok(Context::Result),
            0x04 => Ok(Context::Error),
            _ => Err(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    RtsCts,
    XonXoff,
}

impl Parity {
    pub fn code(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
        }
    }
    pub fn from_code(v: u8) -> Option<Self> {
        match v {
            0 => Some(Parity::None),
            1 => Some(Parity::Odd),
            2 => Some(Parity::Even),
            _ => None,
        }
    }
}

impl StopBits {
    pub fn count(self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
    pub fn from_count(v: u8) -> Option<Self> {
        match v {
            1 => Some(StopBits::One),
            2 => Some(StopBits::Two),
            _ => None,
        }
    }
}

impl FlowControl {
    pub fn code(self) -> u8 {
        match self {
            FlowControl::None => 0,
            FlowControl::RtsCts => 1,
            FlowControl::XonXoff => 2,
        }
    }
    pub fn from_code(v: u8) -> Option<Self> {
        match v {
            0 => Some(FlowControl::None),
            1 => Some(FlowControl::RtsCts),
            2 => Some(FlowControl::XonXoff),
            _ => None,
        }
    }
}

impl FromStr for Parity {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "odd" | "o" => Ok(Parity::Odd),
            "even" | "e" => Ok(Parity::Even),
            _ => Err(()),
        }
    }
}

impl FromStr for FlowControl {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(FlowControl::None),
            "rtscts" | "hw" => Ok(FlowControl::RtsCts),
            "xonxoff" | "sw" => Ok(FlowControl::XonXoff),
            _ => Err(()),
        }
    }
}

/// Validated line settings of a virtual port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineParams {
    pub baud: u32,
    pub data_bits: u8, // 5..=8
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow: FlowControl,
}

impl LineParams {
    pub const DEFAULT: LineParams = LineParams {
        baud: 115_200,
        data_bits: 8,
        stop_bits: StopBits::One,
        parity: Parity::None,
        flow: FlowControl::None,
    };

    /// Builds line settings from the raw wire codes, rejecting anything a
    /// UART could not be programmed with.
    pub fn from_raw(baud: u32, data_bits: u8, stop_bits: u8, parity: u8, flow: u8) -> Option<Self> {
        if baud == 0 || !(5..=8).contains(&data_bits) {
            return None;
        }
        Some(LineParams {
            baud,
            data_bits,
            stop_bits: StopBits::from_count(stop_bits)?,
            parity: Parity::from_code(parity)?,
            flow: FlowControl::from_code(flow)?,
        })
    }

    /// Bits on the line per character: start + data + parity + stop.
    pub fn bits_per_byte(&self) -> u32 {
        1 + self.data_bits as u32
            + u32::from(self.parity != Parity::None)
            + self.stop_bits.count() as u32
    }
}

impl Default for LineParams {
    fn default() -> Self {
        LineParams::DEFAULT
    }
}

impl fmt::Display for LineParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        let flow = match self.flow {
            FlowControl::None => "",
            FlowControl::RtsCts => " rtscts",
            FlowControl::XonXoff => " xonxoff",
        };
        write!(
            f,
            "{} {}{}{}{}",
            self.baud,
            self.data_bits,
            p,
            self.stop_bits.count(),
            flow
        )
    }
}
