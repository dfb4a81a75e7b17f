use std::time::Duration;

use anyhow::{Result, anyhow};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::log::vlog;
use crate::proto::command::{self, LineParams};

/// serialport settings matching a virtual port's line parameters.
pub fn settings(line: &LineParams) -> (DataBits, Parity, StopBits, FlowControl) {
    let data = match line.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    };
    let parity = match line.parity {
        command::Parity::None => Parity::None,
        command::Parity::Odd => Parity::Odd,
        command::Parity::Even => Parity::Even,
    };
    let stop = match line.stop_bits {
        command::StopBits::One => StopBits::One,
        command::StopBits::Two => StopBits::Two,
    };
    let flow = match line.flow {
        command::FlowControl::None => FlowControl::None,
        command::FlowControl::RtsCts => FlowControl::Hardware,
        command::FlowControl::XonXoff => FlowControl::Software,
    };
    (data, parity, stop, flow)
}

/// Opens a physical serial device with the same settings as `line`. Reads
/// time out after `timeout`.
pub fn open_port(dev: &str, line: &LineParams, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let (data, parity, stop, flow) = settings(line);
    let port = serialport::new(dev, line.baud)
        .timeout(timeout)
        .data_bits(data)
        .parity(parity)
        .stop_bits(stop)
        .flow_control(flow)
        .open()
        .map_err(|e| anyhow!("open {dev}: {e}"))?;
    vlog!("port", "opened {dev} {line}");
    Ok(port)
}
