//! Per-port hardware state: the UART registers a serial driver programs,
//! modem lines, error flags and the RX/TX FIFOs.
//!
//! A `SerialChannel` exists for every created port. Its state and buffers are
//! only present between `start` and `stop`; every call on a stopped channel
//! fails with `SimError::Stopped` instead of touching freed state.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use crate::proto::command::{FlowControl, LineParams, Parity, StopBits};
use crate::proto::status::StatusCode;
use crate::sync::lock;

/// `program_flow_control` argument bits.
pub const FLOW_ARG_RTS_CTS: u32 = 1 << 0;
pub const FLOW_ARG_XON_XOFF: u32 = 1 << 1;

const XON: u8 = 0x11;
const XOFF: u8 = 0x13;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("port {0} has no channel")]
    NoChannel(u8),
    #[error("port {0} is stopped")]
    Stopped(u8),
    #[error("port {port}: unsupported {what} {value}")]
    Unsupported {
        port: u8,
        what: &'static str,
        value: u32,
    },
}

impl SimError {
    pub fn code(&self) -> StatusCode {
        StatusCode::BadArgument
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartParams {
    pub baud: u32,
    pub data_bits: u8,
    /// Stop bits in half-bit units: 2 = one, 3 = one and a half, 4 = two.
    pub half_stop_bits: u8,
    pub parity: Parity,
}

impl UartParams {
    /// Rejects settings the port list could not report back unchanged.
    fn validate(&self, port: u8) -> Result<(), SimError> {
        let bad = |what: &'static str, value: u32| -> Result<(), SimError> {
            Err(SimError::Unsupported { port, what, value })
        };
        if self.baud == 0 {
            return bad("baud rate", 0);
        }
        if !(5..=8).contains(&self.data_bits) {
            return bad("data bits", u32::from(self.data_bits));
        }
        if !(2..=4).contains(&self.half_stop_bits) {
            return bad("half stop bits", u32::from(self.half_stop_bits));
        }
        Ok(())
    }
}

impl From<&LineParams> for UartParams {
    fn from(p: &LineParams) -> Self {
        UartParams {
            baud: p.baud,
            data_bits: p.data_bits,
            half_stop_bits: p.stop_bits.count() * 2,
            parity: p.parity,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModemStatus {
    pub cts: bool,
    pub dsr: bool,
    pub ri: bool,
    pub dcd: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mcr {
    pub dtr: bool,
    pub rts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowState {
    pub arg: u32,
    pub xon: u8,
    pub xoff: u8,
}

impl FlowState {
    fn from_flow(flow: FlowControl) -> Self {
        let arg = match flow {
            FlowControl::None => 0,
            FlowControl::RtsCts => FLOW_ARG_RTS_CTS,
            FlowControl::XonXoff => FLOW_ARG_XON_XOFF,
        };
        FlowState {
            arg,
            xon: XON,
            xoff: XOFF,
        }
    }

    pub fn mode(&self) -> FlowControl {
        if self.arg & FLOW_ARG_RTS_CTS != 0 {
            FlowControl::RtsCts
        } else if self.arg & FLOW_ARG_XON_XOFF != 0 {
            FlowControl::XonXoff
        } else {
            FlowControl::None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorState {
    pub overrun: bool,
    pub got_break: bool,
    pub framing_error: bool,
    pub parity_error: bool,
}

impl ErrorState {
    pub fn any(&self) -> bool {
        self.overrun || self.got_break || self.framing_error || self.parity_error
    }
}

/// Bounded byte queue standing in for a hardware FIFO.
#[derive(Debug)]
pub struct Fifo {
    buffer: VecDeque<u8>,
    size: usize,
}

impl Fifo {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(size),
            size,
        }
    }

    /// Appends as much of `data` as fits; returns the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.size - self.buffer.len());
        self.buffer.extend(&data[..n]);
        n
    }

    pub fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buffer.len());
        for (dst, src) in out.iter_mut().zip(self.buffer.drain(..n)) {
            *dst = src;
        }
        n
    }

    pub fn drain_all(&mut self) -> Vec<u8> {
        self.buffer.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwState {
    pub uart: UartParams,
    pub modem: ModemStatus,
    pub mcr: Mcr,
    pub flow: FlowState,
    pub errors: ErrorState,
    pub latency_ms: u32,
    pub break_on: bool,
}

impl HwState {
    fn new(line: &LineParams) -> Self {
        HwState {
            uart: UartParams::from(line),
            modem: ModemStatus::default(),
            mcr: Mcr::default(),
            flow: FlowState::from_flow(line.flow),
            errors: ErrorState::default(),
            latency_ms: 0,
            break_on: false,
        }
    }

    /// Current settings as line parameters. One and a half stop bits reads
    /// as one.
    pub fn line(&self) -> LineParams {
        LineParams {
            baud: self.uart.baud,
            data_bits: self.uart.data_bits,
            stop_bits: if self.uart.half_stop_bits >= 4 {
                StopBits::Two
            } else {
                StopBits::One
            },
            parity: self.uart.parity,
            flow: self.flow.mode(),
        }
    }
}

/// Simulated UART of one virtual port.
#[derive(Debug)]
pub struct SerialChannel {
    id: u8,
    name: String,
    fifo_size: usize,
    state: Mutex<Option<HwState>>,
    rx: Mutex<Option<Fifo>>,
    tx: Mutex<Option<Fifo>>,
}

impl SerialChannel {
    pub fn new(id: u8, name: impl Into<String>, fifo_size: usize) -> Self {
        Self {
            id,
            name: name.into(),
            fifo_size,
            state: Mutex::new(None),
            rx: Mutex::new(None),
            tx: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocates the hardware state and both FIFOs.
    pub fn start(&self, line: &LineParams) {
        *lock(&self.state) = Some(HwState::new(line));
        *lock(&self.rx) = Some(Fifo::new(self.fifo_size));
        *lock(&self.tx) = Some(Fifo::new(self.fifo_size));
    }

    /// Releases state and FIFOs. Returns false if the channel was already
    /// stopped, so buffers are only released once.
    pub fn stop(&self) -> bool {
        let state = lock(&self.state).take();
        let rx = lock(&self.rx).take();
        let tx = lock(&self.tx).take();
        state.is_some() || rx.is_some() || tx.is_some()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).is_some()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HwState) -> R) -> Result<R, SimError> {
        let mut guard = lock(&self.state);
        let state = guard.as_mut().ok_or(SimError::Stopped(self.id))?;
        Ok(f(state))
    }

    fn with_fifo<R>(
        &self,
        fifo: &Mutex<Option<Fifo>>,
        f: impl FnOnce(&mut Fifo) -> R,
    ) -> Result<R, SimError> {
        let mut guard = lock(fifo);
        let fifo = guard.as_mut().ok_or(SimError::Stopped(self.id))?;
        Ok(f(fifo))
    }

    pub fn snapshot(&self) -> Result<HwState, SimError> {
        self.with_state(|s| s.clone())
    }

    pub fn line(&self) -> Result<LineParams, SimError> {
        self.with_state(|s| s.line())
    }

    pub fn program_uart(
        &self,
        baud: u32,
        data_bits: u8,
        half_stop_bits: u8,
        parity: Parity,
    ) -> Result<(), SimError> {
        let uart = UartParams {
            baud,
            data_bits,
            half_stop_bits,
            parity,
        };
        uart.validate(self.id)?;
        self.with_state(|s| s.uart = uart)
    }

    pub fn program_baud_rate(&self, baud: u32) -> Result<(), SimError> {
        self.with_state(|s| {
            let uart = UartParams { baud, ..s.uart };
            uart.validate(self.id)?;
            s.uart = uart;
            Ok(())
        })?
    }

    pub fn program_mcr(&self, dtr: bool, rts: bool) -> Result<(), SimError> {
        self.with_state(|s| s.mcr = Mcr { dtr, rts })
    }

    pub fn get_modem_status(&self) -> Result<ModemStatus, SimError> {
        self.with_state(|s| s.modem)
    }

    /// Used by the link layer to drive this port's modem inputs.
    pub fn update_modem(&self, f: impl FnOnce(&mut ModemStatus)) -> Result<(), SimError> {
        self.with_state(|s| f(&mut s.modem))
    }

    pub fn program_latency_timer(&self, ms: u32) -> Result<(), SimError> {
        self.with_state(|s| s.latency_ms = ms)
    }

    pub fn program_flow_control(&self, arg: u32, xon: u8, xoff: u8) -> Result<(), SimError> {
        self.with_state(|s| s.flow = FlowState { arg, xon, xoff })
    }

    pub fn reset_fifo(&self, tx: bool, rx: bool) -> Result<(), SimError> {
        if tx {
            self.with_fifo(&self.tx, Fifo::clear)?;
        }
        if rx {
            self.with_fifo(&self.rx, Fifo::clear)?;
        }
        Ok(())
    }

    pub fn send_break(&self, on: bool) -> Result<(), SimError> {
        self.with_state(|s| s.break_on = on)
    }

    /// Latches receive errors. Flags already set stay set until
    /// `take_errors`.
    pub fn report_rx_error(
        &self,
        overrun: bool,
        brk: bool,
        framing: bool,
        parity: bool,
    ) -> Result<(), SimError> {
        self.with_state(|s| {
            s.errors.overrun |= overrun;
            s.errors.got_break |= brk;
            s.errors.framing_error |= framing;
            s.errors.parity_error |= parity;
        })
    }

    /// Returns and clears the latched receive errors.
    pub fn take_errors(&self) -> Result<ErrorState, SimError> {
        self.with_state(|s| std::mem::take(&mut s.errors))
    }

    /// Queues `data` on the TX FIFO and hands everything queued to
    /// `deliver`. The FIFO stays locked until `deliver` returns, so chunks
    /// from concurrent writers reach the other side whole and in queue
    /// order. Returns how many bytes of `data` fit.
    pub fn transmit(
        &self,
        data: &[u8],
        deliver: impl FnOnce(&[u8]) -> Result<(), SimError>,
    ) -> Result<usize, SimError> {
        let mut guard = lock(&self.tx);
        let fifo = guard.as_mut().ok_or(SimError::Stopped(self.id))?;
        let n = fifo.push(data);
        if fifo.is_empty() {
            return Ok(n);
        }
        let bytes = fifo.drain_all();
        deliver(&bytes)?;
        Ok(n)
    }

    /// Delivers bytes into the RX FIFO. Whatever does not fit is dropped and
    /// latched as an overrun.
    pub fn enqueue_rx(&self, data: &[u8]) -> Result<usize, SimError> {
        let n = self.with_fifo(&self.rx, |f| f.push(data))?;
        if n < data.len() {
            self.report_rx_error(true, false, false, false)?;
        }
        Ok(n)
    }

    pub fn read_rx(&self, out: &mut [u8]) -> Result<usize, SimError> {
        self.with_fifo(&self.rx, |f| f.pop_into(out))
    }

    pub fn rx_len(&self) -> Result<usize, SimError> {
        self.with_fifo(&self.rx, |f| f.len())
    }
}
