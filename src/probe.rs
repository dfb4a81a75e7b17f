//! Link tester: pushes framed lines from one virtual port into its linked
//! peer and verifies what arrives.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::controller::Controller;
use crate::driver::Driver;
use crate::frame::{LineSplitter, build_frame, parse_frame};
use crate::log::{vdebug, vlog};
use crate::proto::command::LineParams;
use crate::proto::wire::CHECK_MASK;
use crate::stats::Stats;

/// How fast frames are written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    Max,
    Fixed(Duration),
    /// Fraction of the sender's line rate.
    Auto { util: f64 },
}

impl Pacing {
    pub fn from_cli(gap: &str, util: f64) -> Result<Self> {
        if gap.eq_ignore_ascii_case("max") {
            Ok(Pacing::Max)
        } else if gap.eq_ignore_ascii_case("auto") {
            Ok(Pacing::Auto { util })
        } else {
            let ms: u64 = gap
                .parse()
                .map_err(|_| anyhow!("gap must be integer ms, 'auto', or 'max'"))?;
            Ok(Pacing::Fixed(Duration::from_millis(ms)))
        }
    }

    /// Pause after writing `bytes` so the sender stays at its target rate.
    pub fn sleep_for(self, bytes: usize, line: &LineParams) -> Option<Duration> {
        match self {
            Pacing::Max => None,
            Pacing::Fixed(d) => Some(d),
            Pacing::Auto { util } => {
                let util = util.max(1e-3);
                let bit_time_s =
                    bytes as f64 * f64::from(line.bits_per_byte()) / f64::from(line.baud);
                Some(Duration::from_secs_f64(bit_time_s / util))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOpts {
    /// Settings of the sending port.
    pub line: LineParams,
    /// Settings of the receiving port; defaults to `line`.
    pub peer_line: Option<LineParams>,
    pub count: u64,
    pub len: usize,
    pub pacing: Pacing,
    /// Enable every check on the receiving port.
    pub checks: bool,
    /// Seconds between progress lines.
    pub stats_interval: f64,
}

impl Default for ProbeOpts {
    fn default() -> Self {
        Self {
            line: LineParams::DEFAULT,
            peer_line: None,
            count: 100,
            len: 32,
            pacing: Pacing::Max,
            checks: false,
            stats_interval: 1.0,
        }
    }
}

/// Creates and links a fresh port pair, runs the frames through it and
/// removes the pair again.
pub async fn run(ctl: &Controller, driver: &Driver, opts: &ProbeOpts) -> Result<Stats> {
    let peer_line = opts.peer_line.unwrap_or(opts.line);
    let tx = ctl.create_port(&opts.line).await.context("create sender")?;
    let rx = ctl.create_port(&peer_line).await.context("create receiver")?;
    ctl.link_ports(tx, rx).await.context("link probe ports")?;
    if opts.checks {
        ctl.enable_checks(rx, CHECK_MASK).await?;
    }
    vlog!(
        "probe",
        "port {tx} ({}) -> port {rx} ({peer_line}), {} frames of {} bytes",
        opts.line,
        opts.count,
        opts.len
    );

    let result = pump(driver, tx, rx, &peer_line, opts).await;

    ctl.unlink_ports(tx, rx).await.context("unlink probe ports")?;
    ctl.remove_port(tx).await?;
    ctl.remove_port(rx).await?;

    let stats = result?;
    vlog!("probe", "done: {}", stats.summary());
    Ok(stats)
}

async fn pump(
    driver: &Driver,
    tx: u8,
    rx: u8,
    peer_line: &LineParams,
    opts: &ProbeOpts,
) -> Result<Stats> {
    let mut stats = Stats::new(peer_line);
    let mut splitter = LineSplitter::default();
    let mut buf = vec![0u8; 4096];

    for seq in 0..opts.count {
        let frame = build_frame(seq, opts.len);
        let written = driver.write(tx, &frame)?;
        if written < frame.len() {
            vdebug!("probe", "SEQ={seq}: TX FIFO took {written} of {}", frame.len());
        }

        loop {
            let n = driver.read(rx, &mut buf)?;
            if n == 0 {
                break;
            }
            stats.add_bytes(n);
            for line in splitter.push(&buf[..n]) {
                match parse_frame(&line) {
                    Ok(f) => {
                        let lost = stats.frame(&f);
                        if lost > 0 {
                            vlog!("probe", "[LOST] got={} (+{lost})", f.seq);
                        }
                    }
                    Err(err) => {
                        stats.inc_bad();
                        vlog!("probe", "[BAD ] {err} line=\"{line}\"");
                    }
                }
            }
        }

        if driver.take_errors(rx)?.any() {
            stats.inc_line_errors();
        }
        stats.maybe_print(opts.stats_interval);
        if let Some(d) = opts.pacing.sleep_for(frame.len(), &opts.line) {
            tokio::time::sleep(d).await;
        }
    }

    if opts.count > 0 {
        stats.finish(opts.count - 1);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::driver::service::launch;

    async fn connected() -> (Controller, std::sync::Arc<crate::driver::service::DriverService>) {
        let cfg = Config::default();
        let (notifier, service) = launch(&cfg);
        let (ctl, _events) = Controller::new(notifier, cfg.client.clone());
        ctl.connect().unwrap();
        (ctl, service)
    }

    #[test]
    fn pacing_from_cli() {
        assert_eq!(Pacing::from_cli("MAX", 1.0).unwrap(), Pacing::Max);
        assert_eq!(
            Pacing::from_cli("5", 1.0).unwrap(),
            Pacing::Fixed(Duration::from_millis(5))
        );
        assert!(Pacing::from_cli("fast", 1.0).is_err());

        // 96 bytes at 9600 8N1 is 100ms of line time
        let line = LineParams::from_raw(9600, 8, 1, 0, 0).unwrap();
        let d = Pacing::Auto { util: 0.5 }.sleep_for(96, &line).unwrap();
        assert_eq!(d.as_millis(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_link_delivers_every_frame() {
        let (ctl, service) = connected().await;
        let opts = ProbeOpts {
            count: 20,
            len: 16,
            pacing: Pacing::Fixed(Duration::from_millis(1)),
            ..ProbeOpts::default()
        };
        let stats = run(&ctl, service.driver(), &opts).await.unwrap();
        assert_eq!(stats.ok, 20);
        assert!(stats.is_clean(), "{}", stats.summary());
        assert_eq!(service.driver().state().registry.port_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_peer_raises_line_errors() {
        let (ctl, service) = connected().await;
        let opts = ProbeOpts {
            peer_line: LineParams::from_raw(9600, 8, 1, 0, 0),
            checks: true,
            count: 5,
            len: 8,
            ..ProbeOpts::default()
        };
        let stats = run(&ctl, service.driver(), &opts).await.unwrap();
        // the bytes still arrive, the receiver just flags every one
        assert_eq!(stats.ok, 5);
        assert_eq!(stats.line_errors, 5);
        assert_eq!(service.driver().state().registry.link_count(), 0);
    }
}
