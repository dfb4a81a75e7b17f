//! Line commands for the interactive shell.
//!
//! A line is a tag followed by `key=value` pairs, e.g.
//! `CREATE baud=9600 bits=7 stop=2 parity=odd`. Protocol commands go through
//! the controller; the hardware commands (`UART`, `MCR`, `MODEM`, `BREAK`,
//! `WRITE`, `READ`) poke the simulated ports directly, the way a TTY client
//! would.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::controller::Controller;
use crate::driver::Driver;
use crate::driver::uart::SimError;
use crate::log::vdebug;
use crate::proto::command::{FlowControl, LineParams, Parity};
use crate::proto::wire::{
    CHECK_BAUD, CHECK_DATA_SIZE, CHECK_FLOWCTRL, CHECK_PARITY, CHECK_STOP_BITS, LinkEntry,
    PortInfo, TRACE_PORT_IO, TRACE_PORT_RX, TRACE_PORT_TX,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShellError {
    #[error("empty line")]
    Empty,
    #[error("malformed key=value pair: {0}")]
    BadPair(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid integer for {0}: {1}")]
    BadInt(&'static str, String),
    #[error("invalid value for {0}: {1}")]
    BadEnum(&'static str, String),
    #[error("unknown command: {0}")]
    UnknownTag(String),
    #[error("invalid line settings")]
    BadLine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    // ---- Protocol
    Create { line: LineParams },
    Remove { id: u8 },
    Link { a: u8, b: u8 },
    Unlink { a: u8, b: u8 },
    Ports,
    Links,
    Status,
    Checks { port: u8, bits: u64 },
    Trace { port: u8, bits: u64 },
    Shutdown,

    // ---- Hardware
    Uart {
        port: u8,
        baud: u32,
        bits: u8,
        half_stop_bits: u8,
        parity: Parity,
    },
    Mcr { port: u8, dtr: bool, rts: bool },
    Modem { port: u8 },
    Break { port: u8, on: bool },
    Write { port: u8, data: Vec<u8> },
    Read { port: u8, max: usize },

    Help,
    Quit,
}

pub const HELP: &str = "\
CREATE [baud=115200] [bits=8] [stop=1|2] [parity=none|odd|even] [flow=none|rtscts|xonxoff]
REMOVE id=N
LINK a=N b=M            UNLINK a=N b=M
PORTS  LINKS  STATUS
CHECKS port=N set=baud,data,stop,parity,flow|none
TRACE  port=N set=rx,tx,io|none
SHUTDOWN
UART   port=N baud=B bits=D stop=1|1.5|2 parity=P
MCR    port=N dtr=0|1 rts=0|1
MODEM  port=N
BREAK  port=N on=0|1
WRITE  port=N text=... | hex=...
READ   port=N [max=256]
HELP  QUIT";

/// Parses one shell line.
pub fn parse_line(line: &str) -> Result<ShellCommand, ShellError> {
    let s = line.trim();
    if s.is_empty() || s.starts_with('#') {
        return Err(ShellError::Empty);
    }

    let tokens: Vec<&str> = s.split_whitespace().collect();
    let kv_start = tokens
        .iter()
        .position(|t| t.contains('='))
        .unwrap_or(tokens.len());
    let tag = tokens[..kv_start].join(" ").to_ascii_uppercase();
    let mut map = BTreeMap::<String, String>::new();
    for &tok in &tokens[kv_start..] {
        let (k, v) = tok
            .split_once('=')
            .ok_or_else(|| ShellError::BadPair(tok.to_string()))?;
        map.insert(k.to_ascii_lowercase(), v.to_string());
    }

    use ShellCommand::*;

    match tag.as_str() {
        "CREATE" => {
            let d = LineParams::DEFAULT;
            let line = LineParams::from_raw(
                opt(&map, "baud")?.unwrap_or(d.baud),
                opt(&map, "bits")?.unwrap_or(d.data_bits),
                opt(&map, "stop")?.unwrap_or(d.stop_bits.count()),
                opt_enum::<Parity>(&map, "parity")?.unwrap_or(d.parity).code(),
                opt_enum::<FlowControl>(&map, "flow")?.unwrap_or(d.flow).code(),
            )
            .ok_or(ShellError::BadLine)?;
            Ok(Create { line })
        }
        "REMOVE" => Ok(Remove {
            id: req(&map, "id")?,
        }),
        "LINK" => Ok(Link {
            a: req(&map, "a")?,
            b: req(&map, "b")?,
        }),
        "UNLINK" => Ok(Unlink {
            a: req(&map, "a")?,
            b: req(&map, "b")?,
        }),
        "PORTS" => Ok(Ports),
        "LINKS" => Ok(Links),
        "STATUS" => Ok(Status),
        "CHECKS" => Ok(Checks {
            port: req(&map, "port")?,
            bits: req_bits(&map, CHECK_NAMES)?,
        }),
        "TRACE" => Ok(Trace {
            port: req(&map, "port")?,
            bits: req_bits(&map, TRACE_NAMES)?,
        }),
        "SHUTDOWN" => Ok(Shutdown),

        "UART" => Ok(Uart {
            port: req(&map, "port")?,
            baud: req(&map, "baud")?,
            bits: req(&map, "bits")?,
            half_stop_bits: req_half_stop(&map)?,
            parity: opt_enum::<Parity>(&map, "parity")?.unwrap_or(Parity::None),
        }),
        "MCR" => Ok(Mcr {
            port: req(&map, "port")?,
            dtr: req_bool(&map, "dtr")?,
            rts: req_bool(&map, "rts")?,
        }),
        "MODEM" => Ok(Modem {
            port: req(&map, "port")?,
        }),
        "BREAK" => Ok(Break {
            port: req(&map, "port")?,
            on: req_bool(&map, "on")?,
        }),
        "WRITE" => {
            let data = match (map.get("text"), map.get("hex")) {
                (Some(t), _) => t.as_bytes().to_vec(),
                (None, Some(h)) => {
                    hex::decode(h).map_err(|_| ShellError::BadEnum("hex", h.clone()))?
                }
                (None, None) => return Err(ShellError::MissingField("text")),
            };
            Ok(Write {
                port: req(&map, "port")?,
                data,
            })
        }
        "READ" => Ok(Read {
            port: req(&map, "port")?,
            max: opt(&map, "max")?.unwrap_or(256),
        }),

        "HELP" | "?" => Ok(Help),
        "QUIT" | "EXIT" => Ok(Quit),
        _ => Err(ShellError::UnknownTag(tag)),
    }
}

/* ---------- helpers ---------- */

const CHECK_NAMES: &[(&str, u64)] = &[
    ("baud", CHECK_BAUD),
    ("data", CHECK_DATA_SIZE),
    ("stop", CHECK_STOP_BITS),
    ("parity", CHECK_PARITY),
    ("flow", CHECK_FLOWCTRL),
];

const TRACE_NAMES: &[(&str, u64)] = &[
    ("rx", TRACE_PORT_RX),
    ("tx", TRACE_PORT_TX),
    ("io", TRACE_PORT_IO),
];

fn req<T: FromStr>(map: &BTreeMap<String, String>, k: &'static str) -> Result<T, ShellError> {
    opt(map, k)?.ok_or(ShellError::MissingField(k))
}

fn opt<T: FromStr>(map: &BTreeMap<String, String>, k: &'static str) -> Result<Option<T>, ShellError> {
    map.get(k)
        .map(|v| v.parse::<T>().map_err(|_| ShellError::BadInt(k, v.clone())))
        .transpose()
}

fn opt_enum<T: FromStr>(
    map: &BTreeMap<String, String>,
    k: &'static str,
) -> Result<Option<T>, ShellError> {
    map.get(k)
        .map(|v| T::from_str(v).map_err(|_| ShellError::BadEnum(k, v.clone())))
        .transpose()
}

fn req_bool(map: &BTreeMap<String, String>, k: &'static str) -> Result<bool, ShellError> {
    let v = map.get(k).ok_or(ShellError::MissingField(k))?;
    match v.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" => Ok(true),
        "0" | "off" | "false" => Ok(false),
        _ => Err(ShellError::BadEnum(k, v.clone())),
    }
}

fn req_half_stop(map: &BTreeMap<String, String>) -> Result<u8, ShellError> {
    let v = map.get("stop").ok_or(ShellError::MissingField("stop"))?;
    match v.as_str() {
        "1" => Ok(2),
        "1.5" => Ok(3),
        "2" => Ok(4),
        _ => Err(ShellError::BadEnum("stop", v.clone())),
    }
}

fn req_bits(map: &BTreeMap<String, String>, names: &[(&str, u64)]) -> Result<u64, ShellError> {
    let v = map.get("set").ok_or(ShellError::MissingField("set"))?;
    if v.eq_ignore_ascii_case("none") {
        return Ok(0);
    }
    v.split(',').try_fold(0u64, |acc, name| {
        names
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, bit)| acc | bit)
            .ok_or_else(|| ShellError::BadEnum("set", name.to_string()))
    })
}

fn bit_names(flags: u64) -> String {
    let names: Vec<&str> = TRACE_NAMES
        .iter()
        .map(|(n, b)| (*n, *b))
        .chain(CHECK_NAMES.iter().map(|(n, b)| (*n, *b)))
        .filter(|(_, b)| flags & b != 0)
        .map(|(n, _)| n)
        .collect();
    if names.is_empty() {
        "-".into()
    } else {
        names.join(",")
    }
}

/* ---------- rendering ---------- */

pub fn render_ports(ports: &[PortInfo]) -> String {
    if ports.is_empty() {
        return "no ports".into();
    }
    let mut out = String::new();
    for p in ports {
        let line = p
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(|| "?".into());
        let _ = writeln!(out, "{:>2}  {:<12} {:<22} {}", p.id, p.name, line, bit_names(p.flags));
    }
    out.truncate(out.trim_end().len());
    out
}

pub fn render_links(links: &[LinkEntry]) -> String {
    if links.is_empty() {
        return "no links".into();
    }
    links
        .iter()
        .map(|l| format!("[{}] {} <-> {}", l.slot, l.source, l.target))
        .collect::<Vec<_>>()
        .join("\n")
}

/* ---------- execution ---------- */

/// Runs one command and returns what to print.
/// Hardware failures carry the status a TTY client would get back.
fn hw<T>(r: Result<T, SimError>) -> Result<T> {
    r.map_err(|e| anyhow::anyhow!("{e} ({})", e.code()))
}

pub async fn execute(ctl: &Controller, driver: &Driver, cmd: ShellCommand) -> Result<String> {
    use ShellCommand::*;

    Ok(match cmd {
        Create { line } => {
            let id = ctl.create_port(&line).await?;
            format!("created port {id} ({line})")
        }
        Remove { id } => {
            ctl.remove_port(id).await?;
            format!("removed port {id}")
        }
        Link { a, b } => {
            ctl.link_ports(a, b).await?;
            format!("linked {a} <-> {b}")
        }
        Unlink { a, b } => {
            ctl.unlink_ports(a, b).await?;
            format!("unlinked {a} <-> {b}")
        }
        Ports => render_ports(&ctl.get_port_list().await?),
        Links => render_links(&ctl.get_link_list().await?),
        Status => {
            let reply = ctl.get_status().await?;
            format!(
                "{}\n{}",
                render_ports(&reply.ports()),
                render_links(&reply.links())
            )
        }
        Checks { port, bits } => {
            let flags = ctl.enable_checks(port, bits).await?;
            format!("port {port}: {}", bit_names(flags))
        }
        Trace { port, bits } => {
            let flags = ctl.enable_trace(port, bits).await?;
            format!("port {port}: {}", bit_names(flags))
        }
        Shutdown => {
            ctl.shutdown_driver()?;
            "driver shutting down".into()
        }

        Uart {
            port,
            baud,
            bits,
            half_stop_bits,
            parity,
        } => {
            hw(driver.program_uart(port, baud, bits, half_stop_bits, parity))?;
            format!("port {port}: {}", hw(driver.snapshot(port))?.line())
        }
        Mcr { port, dtr, rts } => {
            hw(driver.program_mcr(port, dtr, rts))?;
            format!("port {port}: dtr={} rts={}", u8::from(dtr), u8::from(rts))
        }
        Modem { port } => {
            let m = hw(driver.get_modem_status(port))?;
            let e = hw(driver.take_errors(port))?;
            format!(
                "port {port}: cts={} dsr={} ri={} dcd={} overrun={} break={} framing={} parity={}",
                u8::from(m.cts),
                u8::from(m.dsr),
                u8::from(m.ri),
                u8::from(m.dcd),
                u8::from(e.overrun),
                u8::from(e.got_break),
                u8::from(e.framing_error),
                u8::from(e.parity_error),
            )
        }
        Break { port, on } => {
            hw(driver.send_break(port, on))?;
            format!("port {port}: break {}", if on { "on" } else { "off" })
        }
        Write { port, data } => {
            let n = hw(driver.write(port, &data))?;
            format!("port {port}: wrote {n} of {} bytes", data.len())
        }
        Read { port, max } => {
            let mut buf = vec![0u8; max];
            let n = hw(driver.read(port, &mut buf))?;
            buf.truncate(n);
            format!(
                "port {port}: {n} bytes {:?} ({}), {} left",
                String::from_utf8_lossy(&buf),
                hex::encode(&buf),
                hw(driver.rx_len(port))?
            )
        }

        Help => HELP.into(),
        Quit => String::new(),
    })
}

/// Reads commands from `input` until EOF or `QUIT`, writing results and
/// errors to `output`.
pub async fn run<R, W>(ctl: &Controller, driver: &Driver, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    output.write_all(b"vsp> ").await?;
    output.flush().await?;
    while let Some(line) = lines.next_line().await? {
        let reply = match parse_line(&line) {
            Ok(ShellCommand::Quit) => break,
            Ok(cmd) => {
                vdebug!("shell", "{cmd:?}");
                match execute(ctl, driver, cmd).await {
                    Ok(text) => text,
                    Err(e) => format!("error: {e:#}"),
                }
            }
            Err(ShellError::Empty) => String::new(),
            Err(e) => format!("error: {e}"),
        };
        if !reply.is_empty() {
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
        output.write_all(b"vsp> ").await?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::driver::service::launch;

    #[test]
    fn create_defaults_and_overrides() {
        assert_eq!(
            parse_line("CREATE").unwrap(),
            ShellCommand::Create {
                line: LineParams::DEFAULT
            }
        );
        assert_eq!(
            parse_line("create baud=9600 bits=7 stop=2 parity=odd flow=rtscts").unwrap(),
            ShellCommand::Create {
                line: LineParams::from_raw(9600, 7, 2, 1, 1).unwrap()
            }
        );
        assert_eq!(parse_line("CREATE bits=9"), Err(ShellError::BadLine));
        assert_eq!(
            parse_line("CREATE parity=mark"),
            Err(ShellError::BadEnum("parity", "mark".into()))
        );
    }

    #[test]
    fn flag_sets() {
        assert_eq!(
            parse_line("CHECKS port=1 set=baud,parity").unwrap(),
            ShellCommand::Checks {
                port: 1,
                bits: CHECK_BAUD | CHECK_PARITY
            }
        );
        assert_eq!(
            parse_line("TRACE port=0 set=none").unwrap(),
            ShellCommand::Trace { port: 0, bits: 0 }
        );
        assert_eq!(
            parse_line("TRACE port=0 set=rx,bogus"),
            Err(ShellError::BadEnum("set", "bogus".into()))
        );
    }

    #[test]
    fn hardware_commands() {
        assert_eq!(
            parse_line("UART port=0 baud=9600 bits=8 stop=1.5").unwrap(),
            ShellCommand::Uart {
                port: 0,
                baud: 9600,
                bits: 8,
                half_stop_bits: 3,
                parity: Parity::None
            }
        );
        assert_eq!(
            parse_line("WRITE port=0 hex=6869").unwrap(),
            ShellCommand::Write {
                port: 0,
                data: b"hi".to_vec()
            }
        );
        assert_eq!(
            parse_line("MCR port=0 dtr=1 rts=off").unwrap(),
            ShellCommand::Mcr {
                port: 0,
                dtr: true,
                rts: false
            }
        );
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(parse_line("   "), Err(ShellError::Empty));
        assert_eq!(parse_line("# comment"), Err(ShellError::Empty));
        assert_eq!(parse_line("REMOVE"), Err(ShellError::MissingField("id")));
        assert_eq!(
            parse_line("REMOVE id=x"),
            Err(ShellError::BadInt("id", "x".into()))
        );
        assert_eq!(
            parse_line("LINK a=0 b=1 junk"),
            Err(ShellError::BadPair("junk".into()))
        );
        assert_eq!(
            parse_line("FROB"),
            Err(ShellError::UnknownTag("FROB".into()))
        );
    }

    #[test]
    fn render_empty_lists() {
        assert_eq!(render_ports(&[]), "no ports");
        assert_eq!(render_links(&[]), "no links");
        assert_eq!(bit_names(CHECK_BAUD | TRACE_PORT_RX), "rx,baud");
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_session() {
        let cfg = Config::default();
        let (notifier, service) = launch(&cfg);
        let (ctl, _events) = Controller::new(notifier, cfg.client.clone());
        ctl.connect().unwrap();

        let script = b"CREATE\nCREATE\nLINK a=0 b=1\nWRITE port=0 text=ping\nREAD port=1\nLINKS\nREMOVE id=0\nQUIT\nPORTS\n";
        let mut out = Vec::new();
        run(&ctl, service.driver(), &script[..], &mut out).await.unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("created port 1"));
        assert!(out.contains("port 1: 4 bytes \"ping\""));
        assert!(out.contains("[0] 0 <-> 1"));
        assert!(out.contains("error: RemovePort failed: port busy"));
        // nothing after QUIT runs
        assert!(!out.contains("tty.vsp"));
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_errors_carry_status() {
        let cfg = Config::default();
        let (notifier, service) = launch(&cfg);
        let (ctl, _events) = Controller::new(notifier, cfg.client.clone());
        ctl.connect().unwrap();

        let script = b"CREATE\nUART port=0 baud=0 bits=8 stop=1\nWRITE port=5 text=x\nWRITE port=0 text=abc\nREAD port=0 max=1\n";
        let mut out = Vec::new();
        run(&ctl, service.driver(), &script[..], &mut out).await.unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("error: port 0: unsupported baud rate 0 (bad argument)"));
        assert!(out.contains("error: port 5 has no channel (bad argument)"));
        // unlinked writes are dropped, the rx side stays empty
        assert!(out.contains("port 0: 0 bytes \"\" (), 0 left"));
    }
}
