//! Driver side: the port registry, the simulated UARTs behind it and the
//! data path between linked ports.
//!
//! All registry mutation goes through `Driver::state`, the single lock that
//! serializes command handlers. The data path only holds that lock long
//! enough to resolve channels and peers; FIFOs have their own locks.

pub mod bridge;
pub mod checks;
pub mod registry;
pub mod service;
pub mod uart;
pub mod user_client;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DriverConfig;
use crate::log::{vdebug, vlog};
use crate::proto::command::{LineParams, Parity};
use crate::proto::wire::{
    CHECK_MASK, MAX_SERIAL_PORTS, PortInfo, TRACE_PORT_IO, TRACE_PORT_RX, TRACE_PORT_TX,
};
use crate::sync::lock;

use registry::{PortRegistry, RegistryError};
use uart::{ErrorState, HwState, ModemStatus, SerialChannel, SimError};

pub struct DriverState {
    pub registry: PortRegistry,
    channels: [Option<Arc<SerialChannel>>; MAX_SERIAL_PORTS],
    fifo_size: usize,
}

impl DriverState {
    fn new(cfg: &DriverConfig) -> Self {
        Self {
            registry: PortRegistry::new(cfg.port_name_prefix.clone()),
            channels: std::array::from_fn(|_| None),
            fifo_size: cfg.fifo_size,
        }
    }

    /// Registers a port and starts its channel with `line`.
    pub fn create_port(&mut self, line: &LineParams) -> Result<PortInfo, RegistryError> {
        let id = self.registry.create_port()?;
        let name = self
            .registry
            .get(id)
            .map(|p| p.name.clone())
            .ok_or(RegistryError::PortNotFound(id))?;
        let channel = Arc::new(SerialChannel::new(id, name.clone(), self.fifo_size));
        channel.start(line);
        self.channels[id as usize] = Some(channel);
        vlog!("port", "created {name} (id {id}) {line}");
        self.port_info(id).ok_or(RegistryError::PortNotFound(id))
    }

    pub fn remove_port(&mut self, id: u8) -> Result<(), RegistryError> {
        let entry = self.registry.remove_port(id)?;
        if let Some(channel) = self.channels[id as usize].take() {
            channel.stop();
        }
        vlog!("port", "removed {} (id {})", entry.name, id);
        Ok(())
    }

    /// Links two ports and cross-connects their modem lines.
    pub fn link_ports(&mut self, a: u8, b: u8) -> Result<u8, RegistryError> {
        let slot = self.registry.link_ports(a, b)?;
        if let (Some(ca), Some(cb)) = (self.channel_ref(a), self.channel_ref(b)) {
            null_modem(ca, cb);
            null_modem(cb, ca);
        }
        vlog!("port", "linked {a} <-> {b} (slot {slot})");
        Ok(slot)
    }

    pub fn unlink_ports(&mut self, a: u8, b: u8) -> Result<(), RegistryError> {
        self.registry.unlink_ports(a, b)?;
        for id in [a, b] {
            if self.registry.peers(id).is_empty() {
                if let Some(ch) = self.channel_ref(id) {
                    // nothing drives the inputs anymore
                    let _ = ch.update_modem(|m| *m = ModemStatus::default());
                }
            }
        }
        vlog!("port", "unlinked {a} <-> {b}");
        Ok(())
    }

    /// Replaces the bits of `group` on a port with `bits`.
    pub fn replace_flags(&mut self, id: u8, group: u64, bits: u64) -> Result<u64, RegistryError> {
        self.registry.set_flags(id, group, false)?;
        self.registry.set_flags(id, bits & group, true)
    }

    pub fn flags(&self, id: u8) -> u64 {
        self.registry.get(id).map(|p| p.flags).unwrap_or(0)
    }

    fn channel_ref(&self, id: u8) -> Option<&Arc<SerialChannel>> {
        self.channels.get(id as usize).and_then(Option::as_ref)
    }

    pub fn channel(&self, id: u8) -> Result<Arc<SerialChannel>, SimError> {
        self.channel_ref(id).cloned().ok_or(SimError::NoChannel(id))
    }

    pub fn port_info(&self, id: u8) -> Option<PortInfo> {
        let entry = self.registry.get(id)?;
        Some(PortInfo {
            id,
            flags: entry.flags,
            name: entry.name.clone(),
            line: self.channel_ref(id).and_then(|c| c.line().ok()),
        })
    }

    pub fn port_infos(&self) -> Vec<PortInfo> {
        self.registry
            .list_ports()
            .iter()
            .filter_map(|p| self.port_info(p.id))
            .collect()
    }

    fn peers_of(&self, id: u8) -> Vec<(Arc<SerialChannel>, u64)> {
        self.registry
            .peers(id)
            .into_iter()
            .filter_map(|p| Some((self.channel_ref(p)?.clone(), self.flags(p))))
            .collect()
    }

    /// Stops every channel and empties the registry.
    fn shutdown(&mut self) -> usize {
        let removed = self.registry.clear();
        for slot in self.channels.iter_mut() {
            if let Some(channel) = slot.take() {
                channel.stop();
            }
        }
        removed.len()
    }
}

/// DTR of `from` drives DSR and DCD of `to`, RTS drives CTS.
fn null_modem(from: &SerialChannel, to: &SerialChannel) {
    let Ok(state) = from.snapshot() else {
        return;
    };
    let _ = to.update_modem(|m| {
        m.dsr = state.mcr.dtr;
        m.dcd = state.mcr.dtr;
        m.cts = state.mcr.rts;
    });
}

pub struct Driver {
    state: Mutex<DriverState>,
}

impl Driver {
    pub fn new(cfg: &DriverConfig) -> Self {
        Self {
            state: Mutex::new(DriverState::new(cfg)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, DriverState> {
        lock(&self.state)
    }

    /// Resolves a port's channel and logs the hardware call if IO tracing is
    /// on for it.
    fn hw(&self, port: u8, call: fmt::Arguments<'_>) -> Result<Arc<SerialChannel>, SimError> {
        let st = self.state();
        let channel = st.channel(port)?;
        if st.flags(port) & TRACE_PORT_IO != 0 {
            vlog!("trace", "{}: {}", channel.name(), call);
        }
        Ok(channel)
    }

    /// Writes into a port's TX path. The bytes are delivered to the RX FIFO
    /// of every linked peer, subject to the peer's checks.
    pub fn write(&self, port: u8, data: &[u8]) -> Result<usize, SimError> {
        let (src, flags, peers) = {
            let st = self.state();
            (st.channel(port)?, st.flags(port), st.peers_of(port))
        };

        let line = src.line()?;
        src.transmit(data, |bytes| {
            if flags & TRACE_PORT_TX != 0 {
                vlog!("trace", "{} TX {} bytes: {}", src.name(), bytes.len(), hex::encode(bytes));
            }
            if peers.is_empty() {
                vdebug!("port", "{}: no peer, {} bytes dropped", src.name(), bytes.len());
                return Ok(());
            }
            for (peer, peer_flags) in &peers {
                let outcome = checks::evaluate(peer_flags & CHECK_MASK, &line, &peer.line()?);
                if !outcome.is_clean() {
                    vlog!(
                        "check",
                        "{} -> {}: {} mismatch",
                        src.name(),
                        peer.name(),
                        outcome.failed.join(", ")
                    );
                    peer.report_rx_error(outcome.overrun, false, outcome.framing, outcome.parity)?;
                }
                let got = peer.enqueue_rx(bytes)?;
                if got < bytes.len() {
                    vdebug!("port", "{}: RX overrun, {} bytes lost", peer.name(), bytes.len() - got);
                }
                if peer_flags & TRACE_PORT_RX != 0 {
                    vlog!("trace", "{} RX {} bytes: {}", peer.name(), got, hex::encode(&bytes[..got]));
                }
            }
            Ok(())
        })
    }

    pub fn read(&self, port: u8, buf: &mut [u8]) -> Result<usize, SimError> {
        let channel = self.state().channel(port)?;
        channel.read_rx(buf)
    }

    /// Bytes still queued on the receive side.
    pub fn rx_len(&self, port: u8) -> Result<usize, SimError> {
        self.state().channel(port)?.rx_len()
    }

    pub fn snapshot(&self, port: u8) -> Result<HwState, SimError> {
        self.state().channel(port)?.snapshot()
    }

    pub fn program_uart(
        &self,
        port: u8,
        baud: u32,
        data_bits: u8,
        half_stop_bits: u8,
        parity: Parity,
    ) -> Result<(), SimError> {
        self.hw(
            port,
            format_args!("ProgramUART {baud} {data_bits} {half_stop_bits} {parity:?}"),
        )?
        .program_uart(baud, data_bits, half_stop_bits, parity)
    }

    pub fn program_baud_rate(&self, port: u8, baud: u32) -> Result<(), SimError> {
        self.hw(port, format_args!("ProgramBaudRate {baud}"))?
            .program_baud_rate(baud)
    }

    /// Sets DTR/RTS and drives the modem inputs of linked peers.
    pub fn program_mcr(&self, port: u8, dtr: bool, rts: bool) -> Result<(), SimError> {
        let channel = self.hw(port, format_args!("ProgramMCR dtr={dtr} rts={rts}"))?;
        channel.program_mcr(dtr, rts)?;
        let peers = self.state().peers_of(port);
        for (peer, _) in peers {
            null_modem(&channel, &peer);
        }
        Ok(())
    }

    pub fn get_modem_status(&self, port: u8) -> Result<ModemStatus, SimError> {
        self.hw(port, format_args!("GetModemStatus"))?
            .get_modem_status()
    }

    pub fn program_latency_timer(&self, port: u8, ms: u32) -> Result<(), SimError> {
        self.hw(port, format_args!("ProgramLatencyTimer {ms}"))?
            .program_latency_timer(ms)
    }

    pub fn program_flow_control(&self, port: u8, arg: u32, xon: u8, xoff: u8) -> Result<(), SimError> {
        self.hw(port, format_args!("ProgramFlowControl 0x{arg:x} {xon:#04x} {xoff:#04x}"))?
            .program_flow_control(arg, xon, xoff)
    }

    pub fn reset_fifo(&self, port: u8, tx: bool, rx: bool) -> Result<(), SimError> {
        self.hw(port, format_args!("ResetFIFO tx={tx} rx={rx}"))?
            .reset_fifo(tx, rx)
    }

    /// Raises or lowers break. Linked peers latch `got_break` while it is
    /// raised.
    pub fn send_break(&self, port: u8, on: bool) -> Result<(), SimError> {
        let channel = self.hw(port, format_args!("SendBreak {on}"))?;
        channel.send_break(on)?;
        if on {
            let peers = self.state().peers_of(port);
            for (peer, _) in peers {
                peer.report_rx_error(false, true, false, false)?;
            }
        }
        Ok(())
    }

    pub fn report_rx_error(
        &self,
        port: u8,
        overrun: bool,
        brk: bool,
        framing: bool,
        parity: bool,
    ) -> Result<(), SimError> {
        self.hw(
            port,
            format_args!("RxError overrun={overrun} break={brk} framing={framing} parity={parity}"),
        )?
        .report_rx_error(overrun, brk, framing, parity)
    }

    pub fn take_errors(&self, port: u8) -> Result<ErrorState, SimError> {
        self.state().channel(port)?.take_errors()
    }

    /// Stops all ports and forgets every link. Returns the number of ports
    /// that were removed.
    pub fn shutdown(&self) -> usize {
        let n = self.state().shutdown();
        vlog!("port", "driver shut down, {n} port(s) stopped");
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::status::StatusCode;
    use crate::proto::wire::{CHECK_BAUD, CHECK_PARITY};

    fn linked_pair(b: LineParams) -> Driver {
        let driver = Driver::new(&DriverConfig::default());
        {
            let mut st = driver.state();
            st.create_port(&LineParams::DEFAULT).unwrap();
            st.create_port(&b).unwrap();
            st.link_ports(0, 1).unwrap();
        }
        driver
    }

    #[test]
    fn create_reports_line_and_name() {
        let driver = Driver::new(&DriverConfig::default());
        let line = LineParams::from_raw(9600, 7, 2, 1, 1).unwrap();
        let info = driver.state().create_port(&line).unwrap();
        assert_eq!(info.id, 0);
        assert_eq!(info.name, "tty.vsp0");
        assert_eq!(info.line, Some(line));
    }

    #[test]
    fn bytes_cross_the_link_both_ways() {
        let driver = linked_pair(LineParams::DEFAULT);
        assert_eq!(driver.write(0, b"hello"), Ok(5));
        assert_eq!(driver.write(1, b"back"), Ok(4));

        let mut buf = [0u8; 16];
        let n = driver.read(1, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = driver.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"back");
    }

    #[test]
    fn concurrent_writers_keep_their_order() {
        const PER_WRITER: u16 = 5000;
        let driver = Driver::new(&DriverConfig {
            fifo_size: 1 << 16,
            ..DriverConfig::default()
        });
        {
            let mut st = driver.state();
            st.create_port(&LineParams::DEFAULT).unwrap();
            st.create_port(&LineParams::DEFAULT).unwrap();
            st.link_ports(0, 1).unwrap();
        }

        std::thread::scope(|s| {
            for tag in [b'A', b'B'] {
                let driver = &driver;
                s.spawn(move || {
                    for seq in 0..PER_WRITER {
                        let [hi, lo] = seq.to_be_bytes();
                        assert_eq!(driver.write(0, &[tag, hi, lo, !tag]), Ok(4));
                    }
                });
            }
        });

        let mut buf = vec![0u8; 1 << 16];
        let n = driver.read(1, &mut buf).unwrap();
        assert_eq!(n, 2 * 4 * PER_WRITER as usize);
        let mut next = [0u16; 2];
        for rec in buf[..n].chunks_exact(4) {
            assert_eq!(rec[3], !rec[0], "record split: {rec:?}");
            let w = usize::from(rec[0] - b'A');
            assert_eq!(u16::from_be_bytes([rec[1], rec[2]]), next[w]);
            next[w] += 1;
        }
        assert_eq!(next, [PER_WRITER; 2]);
    }

    #[test]
    fn programmed_uart_shows_in_port_list() {
        let driver = linked_pair(LineParams::DEFAULT);
        assert!(matches!(
            driver.program_uart(0, 9600, 9, 2, Parity::None),
            Err(SimError::Unsupported { what: "data bits", value: 9, .. })
        ));
        assert_eq!(
            driver.program_baud_rate(0, 0).map_err(|e| e.code()),
            Err(StatusCode::BadArgument)
        );
        assert_eq!(driver.state().port_info(0).unwrap().line, Some(LineParams::DEFAULT));

        driver.program_uart(0, 9600, 7, 4, Parity::Even).unwrap();
        let expect = LineParams::from_raw(9600, 7, 2, 2, 0).unwrap();
        assert_eq!(driver.state().port_info(0).unwrap().line, Some(expect));

        // and survives the port list encoding
        let mut msg = crate::proto::wire::WireMessage::zeroed();
        msg.set_ports(&driver.state().port_infos()).unwrap();
        assert_eq!(msg.ports()[0].line, Some(expect));
    }

    #[test]
    fn unlinked_port_drops_writes() {
        let driver = linked_pair(LineParams::DEFAULT);
        driver.state().unlink_ports(0, 1).unwrap();
        driver.write(0, b"lost").unwrap();
        assert_eq!(driver.read(1, &mut [0u8; 8]), Ok(0));
    }

    #[test]
    fn checks_flag_mismatched_peer() {
        let slow = LineParams::from_raw(9600, 8, 1, 2, 0).unwrap();
        let driver = linked_pair(slow);
        driver
            .state()
            .replace_flags(1, CHECK_MASK, CHECK_BAUD | CHECK_PARITY)
            .unwrap();

        driver.write(0, b"x").unwrap();
        let errs = driver.take_errors(1).unwrap();
        assert!(errs.framing_error && errs.parity_error);
        // data still arrives, garbled or not
        assert_eq!(driver.read(1, &mut [0u8; 4]), Ok(1));
        // the sender has no checks enabled
        driver.write(1, b"y").unwrap();
        assert!(!driver.take_errors(0).unwrap().any());
    }

    #[test]
    fn mcr_drives_peer_modem_lines() {
        let driver = linked_pair(LineParams::DEFAULT);
        driver.program_mcr(0, true, false).unwrap();
        let m = driver.get_modem_status(1).unwrap();
        assert!(m.dsr && m.dcd && !m.cts);

        driver.program_mcr(0, true, true).unwrap();
        assert!(driver.get_modem_status(1).unwrap().cts);
        // own inputs untouched
        assert_eq!(driver.get_modem_status(0).unwrap(), ModemStatus::default());

        driver.state().unlink_ports(0, 1).unwrap();
        assert_eq!(driver.get_modem_status(1).unwrap(), ModemStatus::default());
    }

    #[test]
    fn link_picks_up_existing_mcr() {
        let driver = Driver::new(&DriverConfig::default());
        let mut st = driver.state();
        st.create_port(&LineParams::DEFAULT).unwrap();
        st.create_port(&LineParams::DEFAULT).unwrap();
        st.channel(0).unwrap().program_mcr(true, true).unwrap();
        st.link_ports(0, 1).unwrap();
        let m = st.channel(1).unwrap().get_modem_status().unwrap();
        assert!(m.dsr && m.cts);
    }

    #[test]
    fn break_reaches_peer() {
        let driver = linked_pair(LineParams::DEFAULT);
        driver.send_break(0, true).unwrap();
        assert!(driver.take_errors(1).unwrap().got_break);
        assert!(driver.snapshot(0).unwrap().break_on);
    }

    #[test]
    fn missing_port_is_bad_argument() {
        let driver = Driver::new(&DriverConfig::default());
        assert_eq!(driver.program_baud_rate(4, 9600), Err(SimError::NoChannel(4)));
        assert_eq!(driver.write(4, b"x"), Err(SimError::NoChannel(4)));
    }

    #[test]
    fn shutdown_stops_channels() {
        let driver = linked_pair(LineParams::DEFAULT);
        let ch = driver.state().channel(0).unwrap();
        assert_eq!(driver.shutdown(), 2);
        assert!(!ch.is_running());
        assert_eq!(driver.state().registry.port_count(), 0);
        assert_eq!(driver.shutdown(), 0);
    }

    #[test]
    fn remove_stops_channel() {
        let driver = Driver::new(&DriverConfig::default());
        driver.state().create_port(&LineParams::DEFAULT).unwrap();
        let ch = driver.state().channel(0).unwrap();
        driver.state().remove_port(0).unwrap();
        assert!(!ch.is_running());
        assert_eq!(driver.read(0, &mut [0u8; 1]), Err(SimError::NoChannel(0)));
    }
}
