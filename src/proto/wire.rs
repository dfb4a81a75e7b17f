//! Fixed-layout control message shared by the controller and the driver.
//!
//! Every field and every size here is part of the contract between both
//! sides of the user-client boundary. The structs are `#[repr(C, packed)]`
//! and go through zerocopy, so there is no padding and no unsafe code. Fields
//! wider than a byte must be copied out before they are borrowed.

use static_assertions::{assert_eq_size, const_assert};
use thiserror::Error;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use super::command::{Command, Context, FlowControl, LineParams, Parity, StopBits};
use super::status::StatusCode;

pub const MAGIC_CONTROL: u64 = 0xBE66_0525_0000;
pub const MAX_SERIAL_PORTS: usize = 16;
pub const MAX_PORT_LINKS: usize = 16;
pub const MAX_PORT_NAME: usize = 64;

pub const fn bit(n: u32) -> u64 {
    1 << n
}

// ---- Trace bits ----
pub const TRACE_PORT_RX: u64 = bit(16);
pub const TRACE_PORT_TX: u64 = bit(17);
pub const TRACE_PORT_IO: u64 = bit(18);
pub const TRACE_MASK: u64 = TRACE_PORT_RX | TRACE_PORT_TX | TRACE_PORT_IO;

// ---- Check bits ----
pub const CHECK_BAUD: u64 = bit(19);
pub const CHECK_DATA_SIZE: u64 = bit(20);
pub const CHECK_STOP_BITS: u64 = bit(21);
pub const CHECK_PARITY: u64 = bit(22);
pub const CHECK_FLOWCTRL: u64 = bit(23);
pub const CHECK_MASK: u64 =
    CHECK_BAUD | CHECK_DATA_SIZE | CHECK_STOP_BITS | CHECK_PARITY | CHECK_FLOWCTRL;

/// Low byte of a flags word addresses a port.
pub const PORT_ID_MASK: u64 = 0xFF;

/// `parameter.flags` marker of a CreatePort request carrying line settings.
pub const CREATE_PORT_MARKER: u64 = 0xFF01;

// Port list item flags: bits 8..16 packed line settings, bits 32..64 baud.
const LINE_SHIFT: u32 = 8;
const BAUD_SHIFT: u32 = 32;

/// Provenance marker stamped into `status.flags` of every message.
pub fn magic_stamp(command: u8) -> u64 {
    MAGIC_CONTROL | 1u64.checked_shl(command as u32).unwrap_or(0)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("message size {actual} does not match wire size {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("unknown command: {0}")]
    UnknownCommand(u8),
    #[error("unknown context: {0}")]
    UnknownContext(u8),
    #[error("port parameters missing or invalid")]
    BadPortParameters,
    #[error("too many entries: {0}")]
    TooManyEntries(usize),
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
pub struct Status {
    pub code: u32,
    pub flags: u64,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
pub struct PortLink {
    pub source: u8,
    pub target: u8,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
pub struct Parameter {
    pub flags: u64,
    pub link: PortLink,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
pub struct PortListItem {
    pub id: u8,
    pub flags: u64,
    pub name: [u8; MAX_PORT_NAME],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
pub struct PortList {
    pub count: u8,
    pub list: [PortListItem; MAX_SERIAL_PORTS],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
pub struct LinkList {
    pub count: u8,
    pub list: [u64; MAX_PORT_LINKS],
}

/// The request/response structure. Constructed fresh per call and copied
/// across the boundary by value.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
pub struct WireMessage {
    pub context: u8,
    pub command: u8,
    pub status: Status,
    pub parameter: Parameter,
    pub ports: PortList,
    pub links: LinkList,
}

/// Line settings as a CreatePort request packs them into `ports.list`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
pub struct PortParameters {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: u8,
    pub flow_ctrl: u8,
}

pub const WIRE_SIZE: usize = size_of::<WireMessage>();

// If one of these fails the wire format has changed.
assert_eq_size!(PortListItem, [u8; 73]);
assert_eq_size!(PortParameters, [u8; 8]);
assert_eq_size!(WireMessage, [u8; 1322]);
const_assert!(size_of::<PortParameters>() <= size_of::<[PortListItem; MAX_SERIAL_PORTS]>());

impl From<&LineParams> for PortParameters {
    fn from(p: &LineParams) -> Self {
        PortParameters {
            baud_rate: p.baud,
            data_bits: p.data_bits,
            stop_bits: p.stop_bits.count(),
            parity: p.parity.code(),
            flow_ctrl: p.flow.code(),
        }
    }
}

impl TryFrom<PortParameters> for LineParams {
    type Error = ProtoError;
    fn try_from(raw: PortParameters) -> Result<Self, Self::Error> {
        let PortParameters {
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            flow_ctrl,
        } = raw;
        LineParams::from_raw(baud_rate, data_bits, stop_bits, parity, flow_ctrl)
            .ok_or(ProtoError::BadPortParameters)
    }
}

/// A decoded port list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub id: u8,
    /// Trace and check bits.
    pub flags: u64,
    pub name: String,
    pub line: Option<LineParams>,
}

/// A decoded link list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEntry {
    pub slot: u8,
    pub source: u8,
    pub target: u8,
}

impl LinkEntry {
    pub fn pack(self) -> u64 {
        (self.slot as u64) << 16 | (self.source as u64) << 8 | self.target as u64
    }
    pub fn unpack(v: u64) -> Self {
        LinkEntry {
            slot: (v >> 16) as u8,
            source: (v >> 8) as u8,
            target: v as u8,
        }
    }
}

fn encode_line(p: &LineParams) -> u64 {
    let mut b = p.data_bits.saturating_sub(5) as u64 & 0x3;
    if p.stop_bits == StopBits::Two {
        b |= 1 << 2;
    }
    b |= (p.parity.code() as u64 & 0x3) << 3;
    b |= (p.flow.code() as u64 & 0x3) << 5;
    (p.baud as u64) << BAUD_SHIFT | b << LINE_SHIFT
}

fn decode_line(flags: u64) -> Option<LineParams> {
    let b = (flags >> LINE_SHIFT) as u8;
    let baud = (flags >> BAUD_SHIFT) as u32;
    if baud == 0 {
        return None;
    }
    Some(LineParams {
        baud,
        data_bits: (b & 0x3) + 5,
        stop_bits: if b & (1 << 2) != 0 {
            StopBits::Two
        } else {
            StopBits::One
        },
        parity: Parity::from_code((b >> 3) & 0x3)?,
        flow: FlowControl::from_code((b >> 5) & 0x3)?,
    })
}

fn encode_name(name: &str) -> [u8; MAX_PORT_NAME] {
    let mut out = [0u8; MAX_PORT_NAME];
    // keep a terminating NUL, cut on a char boundary
    let mut n = name.len().min(MAX_PORT_NAME - 1);
    while !name.is_char_boundary(n) {
        n -= 1;
    }
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

fn decode_name(raw: &[u8; MAX_PORT_NAME]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl WireMessage {
    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }

    /// Parses an inbound message, enforcing the fixed size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        WireMessage::read_from_bytes(bytes).map_err(|_| ProtoError::SizeMismatch {
            expected: WIRE_SIZE,
            actual: bytes.len(),
        })
    }

    /// An empty request for `command` in the port context.
    pub fn request(command: Command) -> Self {
        let mut msg = Self::new_zeroed();
        msg.context = Context::Port as u8;
        msg.command = command as u8;
        msg
    }

    pub fn get_status() -> Self {
        Self::request(Command::GetStatus)
    }

    pub fn get_port_list() -> Self {
        Self::request(Command::GetPortList)
    }

    pub fn get_link_list() -> Self {
        Self::request(Command::GetLinkList)
    }

    pub fn create_port(params: &LineParams) -> Result<Self, ProtoError> {
        let mut msg = Self::request(Command::CreatePort);
        msg.parameter.link = PortLink {
            source: 1,
            target: 1,
        };
        msg.set_port_parameters(PortParameters::from(params))?;
        Ok(msg)
    }

    pub fn remove_port(id: u8) -> Self {
        let mut msg = Self::request(Command::RemovePort);
        msg.parameter.flags = id as u64;
        msg.parameter.link = PortLink {
            source: id,
            target: id,
        };
        msg
    }

    pub fn link_ports(source: u8, target: u8) -> Self {
        let mut msg = Self::request(Command::LinkPorts);
        msg.parameter.link = PortLink { source, target };
        msg
    }

    pub fn unlink_ports(source: u8, target: u8) -> Self {
        let mut msg = Self::request(Command::UnlinkPorts);
        msg.parameter.link = PortLink { source, target };
        msg
    }

    pub fn enable_checks(port: u8, checks: u64) -> Self {
        Self::port_flags(Command::EnableChecks, port, checks & CHECK_MASK)
    }

    pub fn enable_trace(port: u8, traces: u64) -> Self {
        Self::port_flags(Command::EnableTrace, port, traces & TRACE_MASK)
    }

    fn port_flags(command: Command, port: u8, bits: u64) -> Self {
        let mut msg = Self::request(command);
        msg.parameter.flags = bits | port as u64;
        msg.parameter.link = PortLink {
            source: port,
            target: port,
        };
        msg
    }

    pub fn stamp(&mut self) {
        self.status.flags |= magic_stamp(self.command);
    }

    pub fn has_valid_stamp(&self) -> bool {
        let want = magic_stamp(self.command);
        let flags = self.status.flags;
        flags & want == want
    }

    pub fn decode_command(&self) -> Result<Command, ProtoError> {
        Command::try_from(self.command).map_err(ProtoError::UnknownCommand)
    }

    pub fn decode_context(&self) -> Result<Context, ProtoError> {
        Context::try_from(self.context).map_err(ProtoError::UnknownContext)
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_raw(self.status.code)
    }

    /// Port addressed by the low byte of `parameter.flags`.
    pub fn addressed_port(&self) -> u8 {
        (self.parameter.flags & PORT_ID_MASK) as u8
    }

    pub fn set_port_parameters(&mut self, raw: PortParameters) -> Result<(), ProtoError> {
        let mut list = self.ports.list;
        raw.write_to_prefix(list.as_mut_bytes())
            .map_err(|_| ProtoError::BadPortParameters)?;
        self.ports.list = list;
        self.ports.count = size_of::<PortParameters>() as u8;
        self.parameter.flags = CREATE_PORT_MARKER;
        Ok(())
    }

    /// Line settings of a CreatePort request.
    pub fn port_parameters(&self) -> Result<LineParams, ProtoError> {
        if self.ports.count as usize != size_of::<PortParameters>() {
            return Err(ProtoError::BadPortParameters);
        }
        let list = self.ports.list;
        let (raw, _) = PortParameters::read_from_prefix(list.as_bytes())
            .map_err(|_| ProtoError::BadPortParameters)?;
        LineParams::try_from(raw)
    }

    pub fn set_ports(&mut self, ports: &[PortInfo]) -> Result<(), ProtoError> {
        if ports.len() > MAX_SERIAL_PORTS {
            return Err(ProtoError::TooManyEntries(ports.len()));
        }
        let mut list = [PortListItem::new_zeroed(); MAX_SERIAL_PORTS];
        for (slot, port) in list.iter_mut().zip(ports) {
            let line = port.line.as_ref().map(encode_line).unwrap_or(0);
            *slot = PortListItem {
                id: port.id,
                flags: (port.flags & (TRACE_MASK | CHECK_MASK)) | port.id as u64 | line,
                name: encode_name(&port.name),
            };
        }
        self.ports.list = list;
        self.ports.count = ports.len() as u8;
        Ok(())
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        let list = self.ports.list;
        let count = (self.ports.count as usize).min(MAX_SERIAL_PORTS);
        list[..count]
            .iter()
            .map(|item| {
                let flags = item.flags;
                PortInfo {
                    id: item.id,
                    flags: flags & (TRACE_MASK | CHECK_MASK),
                    name: decode_name(&item.name),
                    line: decode_line(flags),
                }
            })
            .collect()
    }

    pub fn set_links(&mut self, links: &[LinkEntry]) -> Result<(), ProtoError> {
        if links.len() > MAX_PORT_LINKS {
            return Err(ProtoError::TooManyEntries(links.len()));
        }
        let mut list = [0u64; MAX_PORT_LINKS];
        for (slot, link) in list.iter_mut().zip(links) {
            *slot = link.pack();
        }
        self.links.list = list;
        self.links.count = links.len() as u8;
        Ok(())
    }

    pub fn links(&self) -> Vec<LinkEntry> {
        let list = self.links.list;
        let count = (self.links.count as usize).min(MAX_PORT_LINKS);
        list[..count].iter().map(|v| LinkEntry::unpack(*v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size_is_fixed() {
        assert_eq!(WIRE_SIZE, 1322);
        assert_eq!(WireMessage::zeroed().as_bytes().len(), WIRE_SIZE);
    }

    #[test]
    fn from_bytes_rejects_other_sizes() {
        let msg = WireMessage::get_status();
        let bytes = msg.as_bytes();
        assert_eq!(WireMessage::from_bytes(bytes).unwrap(), msg);
        assert_eq!(
            WireMessage::from_bytes(&bytes[..WIRE_SIZE - 1]),
            Err(ProtoError::SizeMismatch {
                expected: WIRE_SIZE,
                actual: WIRE_SIZE - 1
            })
        );
        let mut longer = bytes.to_vec();
        longer.push(0);
        assert!(WireMessage::from_bytes(&longer).is_err());
    }

    #[test]
    fn magic_stamp_layout() {
        assert_eq!(magic_stamp(4), 0xBE66_0525_0010);
        let mut msg = WireMessage::link_ports(0, 1);
        assert!(!msg.has_valid_stamp());
        msg.stamp();
        assert!(msg.has_valid_stamp());
        let flags = msg.status.flags;
        assert_eq!(flags, MAGIC_CONTROL | bit(4));

        // stamp of another command does not validate
        msg.command = Command::UnlinkPorts as u8;
        assert!(!msg.has_valid_stamp());
    }

    #[test]
    fn create_port_payload_layout() {
        let params = LineParams::from_raw(115_200, 8, 1, 0, 0).unwrap();
        let msg = WireMessage::create_port(&params).unwrap();
        assert_eq!(msg.ports.count, 8);
        let flags = msg.parameter.flags;
        assert_eq!(flags, CREATE_PORT_MARKER);
        // baud sits in the first four bytes of the list area
        let bytes = msg.as_bytes();
        let off = 2 + 12 + 10 + 1;
        assert_eq!(&bytes[off..off + 4], &115_200u32.to_ne_bytes());
        assert_eq!(msg.port_parameters(), Ok(params));
    }

    #[test]
    fn create_port_payload_requires_count() {
        let mut msg = WireMessage::create_port(&LineParams::DEFAULT).unwrap();
        msg.ports.count = 0;
        assert_eq!(msg.port_parameters(), Err(ProtoError::BadPortParameters));
    }

    #[test]
    fn port_list_carries_line_settings() {
        let line = LineParams::from_raw(9600, 7, 2, 1, 1).unwrap();
        let ports = vec![
            PortInfo {
                id: 0,
                flags: CHECK_BAUD | TRACE_PORT_RX,
                name: "tty.vsp0".into(),
                line: Some(LineParams::DEFAULT),
            },
            PortInfo {
                id: 1,
                flags: 0,
                name: "tty.vsp1".into(),
                line: Some(line),
            },
        ];
        let mut msg = WireMessage::zeroed();
        msg.set_ports(&ports).unwrap();
        assert_eq!(msg.ports(), ports);
    }

    #[test]
    fn long_port_names_are_truncated() {
        let name = "x".repeat(100);
        let mut msg = WireMessage::zeroed();
        msg.set_ports(&[PortInfo {
            id: 3,
            flags: 0,
            name,
            line: None,
        }])
        .unwrap();
        assert_eq!(msg.ports()[0].name.len(), MAX_PORT_NAME - 1);
    }

    #[test]
    fn truncation_keeps_whole_characters() {
        // 2-byte chars: 63 bytes would split the 32nd one
        let name = "é".repeat(40);
        let mut msg = WireMessage::zeroed();
        msg.set_ports(&[PortInfo {
            id: 0,
            flags: 0,
            name,
            line: None,
        }])
        .unwrap();
        assert_eq!(msg.ports()[0].name, "é".repeat(31));
    }

    #[test]
    fn port_parameters_fill_the_list_area() {
        let mut msg = WireMessage::request(Command::CreatePort);
        let line = LineParams::from_raw(57_600, 6, 2, 2, 2).unwrap();
        assert_eq!(msg.set_port_parameters(PortParameters::from(&line)), Ok(()));
        assert_eq!(msg.ports.count, 8);
        assert_eq!(msg.port_parameters(), Ok(line));
    }

    #[test]
    fn context_decodes() {
        let mut msg = WireMessage::request(Command::GetStatus);
        assert_eq!(msg.decode_context(), Ok(Context::Port));
        msg.context = 9;
        assert_eq!(msg.decode_context(), Err(ProtoError::UnknownContext(9)));
    }

    #[test]
    fn link_entries_pack() {
        let l = LinkEntry {
            slot: 2,
            source: 0,
            target: 1,
        };
        assert_eq!(l.pack(), 0x0002_0001);
        assert_eq!(LinkEntry::unpack(l.pack()), l);

        let mut msg = WireMessage::zeroed();
        assert_eq!(
            msg.set_links(&[l; MAX_PORT_LINKS + 1]),
            Err(ProtoError::TooManyEntries(MAX_PORT_LINKS + 1))
        );
        msg.set_links(&[l]).unwrap();
        assert_eq!(msg.links(), vec![l]);
    }

    #[test]
    fn checks_and_trace_address_port_in_low_byte() {
        let msg = WireMessage::enable_checks(5, CHECK_BAUD | CHECK_PARITY | TRACE_PORT_RX);
        assert_eq!(msg.addressed_port(), 5);
        let flags = msg.parameter.flags;
        // trace bits are stripped from a checks request
        assert_eq!(flags, CHECK_BAUD | CHECK_PARITY | 5);

        let msg = WireMessage::enable_trace(2, TRACE_PORT_IO);
        let flags = msg.parameter.flags;
        assert_eq!(flags, TRACE_PORT_IO | 2);
    }
}
