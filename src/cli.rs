use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};

use crate::proto::command::LineParams;

#[derive(Parser, Debug, Clone)]
#[command(name = "vspctl", about = "Virtual serial port driver and control client")]
pub struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Verbose logging (request/response dumps, data path)
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Run the create/link/unlink/remove walkthrough against a fresh driver
    Demo,
    /// Interactive command shell (reads stdin)
    Shell,
    /// Push framed test lines through a linked port pair
    Probe(ProbeArgs),
    /// Attach a physical serial device to a linked port pair
    Bridge(BridgeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LineArgs {
    /// Baud rate
    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,
    /// Data bits (5-8)
    #[arg(long, default_value_t = 8)]
    pub bits: u8,
    /// Stop bits (1 or 2)
    #[arg(long, default_value_t = 1)]
    pub stop: u8,
    /// none, odd or even
    #[arg(long, default_value = "none")]
    pub parity: String,
    /// none, rtscts or xonxoff
    #[arg(long, default_value = "none")]
    pub flow: String,
}

impl LineArgs {
    pub fn line(&self) -> anyhow::Result<LineParams> {
        let parity = self
            .parity
            .parse::<crate::proto::command::Parity>()
            .map_err(|_| anyhow!("parity must be none, odd or even"))?;
        let flow = self
            .flow
            .parse::<crate::proto::command::FlowControl>()
            .map_err(|_| anyhow!("flow must be none, rtscts or xonxoff"))?;
        LineParams::from_raw(self.baud, self.bits, self.stop, parity.code(), flow.code())
            .ok_or_else(|| anyhow!("invalid line settings"))
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub line: LineArgs,
    /// Receiver baud rate, to provoke check failures
    #[arg(long)]
    pub peer_baud: Option<u32>,
    /// Number of frames
    #[arg(long, default_value_t = 1000)]
    pub count: u64,
    /// Payload size in bytes
    #[arg(long, default_value_t = 64)]
    pub len: usize,
    /// "max" or milliseconds gap (e.g. 0, 5, 10) or "auto"
    #[arg(long, default_value = "max")]
    pub gap: String,
    /// Utilization (0.0..1.0) when gap="auto" (1.0 = line-rate)
    #[arg(long, default_value_t = 1.0)]
    pub util: f64,
    /// Enable all checks on the receiving port
    #[arg(long, default_value_t = false)]
    pub checks: bool,
    /// Stats print interval in seconds
    #[arg(long, default_value_t = 1.0)]
    pub stats: f64,
}

#[derive(Args, Debug, Clone)]
pub struct BridgeArgs {
    /// Serial device path
    #[arg(long, default_value = "/dev/ttyS0")]
    pub dev: String,
    #[command(flatten)]
    pub line: LineArgs,
    /// Device read timeout in milliseconds
    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,
    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::command::{FlowControl, Parity, StopBits};

    #[test]
    fn probe_args_parse() {
        let cli = Cli::try_parse_from([
            "vspctl", "--debug", "probe", "--baud", "9600", "--bits", "7", "--stop", "2",
            "--parity", "odd", "--flow", "rtscts", "--count", "5",
        ])
        .unwrap();
        assert!(cli.debug);
        let Cmd::Probe(args) = cli.cmd else {
            panic!("expected probe");
        };
        let line = args.line.line().unwrap();
        assert_eq!(line.baud, 9600);
        assert_eq!(line.data_bits, 7);
        assert_eq!(line.stop_bits, StopBits::Two);
        assert_eq!(line.parity, Parity::Odd);
        assert_eq!(line.flow, FlowControl::RtsCts);
        assert_eq!(args.count, 5);
    }

    #[test]
    fn bad_line_rejected() {
        let cli = Cli::try_parse_from(["vspctl", "bridge", "--parity", "mark"]).unwrap();
        let Cmd::Bridge(args) = cli.cmd else {
            panic!("expected bridge");
        };
        assert!(args.line.line().is_err());
    }
}
