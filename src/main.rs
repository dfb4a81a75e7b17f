use anyhow::{Context, Result, ensure};
use clap::Parser;
use tokio::io::BufReader;
use tokio::sync::mpsc;

mod bridge_io;
mod cli;
mod config;
mod controller;
mod driver;
mod frame;
mod log;
mod port;
mod probe;
mod proto;
mod shell;
mod stats;
mod sync;

use crate::cli::{Cli, Cmd};
use crate::config::Config;
use crate::controller::{Controller, ControllerEvent};
use crate::driver::service::launch;
use crate::log::{vdebug, vlog};
use crate::proto::command::LineParams;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    log::set_debug(args.debug);
    let cfg = Config::load(args.config.as_deref())?;

    let (notifier, service) = launch(&cfg);
    let (ctl, events) = Controller::new(notifier, cfg.client.clone());
    tokio::spawn(log_events(events));
    ensure!(
        ctl.connect().context("connecting to the driver")?,
        "driver service {} not available",
        cfg.client.service_name
    );
    vlog!(
        "ctl",
        "connected to {} at {}",
        ctl.device_name().unwrap_or_default(),
        ctl.device_path().unwrap_or_default()
    );

    match args.cmd {
        Cmd::Demo => demo(&ctl).await?,
        Cmd::Shell => {
            let stdin = BufReader::new(tokio::io::stdin());
            shell::run(&ctl, service.driver(), stdin, tokio::io::stdout()).await?;
        }
        Cmd::Probe(a) => {
            let line = a.line.line()?;
            let peer_line = match a.peer_baud {
                Some(baud) => Some(LineParams { baud, ..line }),
                None => None,
            };
            let opts = probe::ProbeOpts {
                line,
                peer_line,
                count: a.count,
                len: a.len,
                pacing: probe::Pacing::from_cli(&a.gap, a.util)?,
                checks: a.checks,
                stats_interval: a.stats,
            };
            let stats = probe::run(&ctl, service.driver(), &opts).await?;
            println!("{}", stats.summary());
            ensure!(stats.is_clean(), "link probe saw errors");
        }
        Cmd::Bridge(a) => {
            let opts = bridge_io::BridgeOpts {
                dev: a.dev.clone(),
                line: a.line.line()?,
                poll: std::time::Duration::from_millis(a.poll_ms),
                duration: a.secs.map(std::time::Duration::from_secs),
            };
            bridge_io::run(&ctl, service.driver().clone(), &opts).await?;
        }
    }

    ctl.disconnect();
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<ControllerEvent>) {
    while let Some(ev) = events.recv().await {
        match ev {
            ControllerEvent::Connected { name, path } => vlog!("ctl", "device added: {name} {path}"),
            ControllerEvent::Disconnected => vlog!("ctl", "device removed"),
            ControllerEvent::Completion { result, args } => {
                vdebug!("ctl", "completion: {result}, args {args:x?}")
            }
            ControllerEvent::DataReady(reply) => vdebug!("ctl", "data ready: {}", reply.result),
            // already logged where they are raised
            ControllerEvent::Error { .. } => {}
        }
    }
}

/// Two ports, link, unlink, remove; fails on the first unexpected answer.
async fn demo(ctl: &Controller) -> Result<()> {
    let a = ctl.create_port(&LineParams::DEFAULT).await?;
    println!("created port {a} ({})", LineParams::DEFAULT);
    let slow = LineParams::from_raw(9600, 7, 2, 1, 1).context("demo line settings")?;
    let b = ctl.create_port(&slow).await?;
    println!("created port {b} ({slow})");
    ensure!((a, b) == (0, 1), "unexpected port ids {a}, {b}");

    ctl.link_ports(a, b).await?;
    let links = ctl.get_link_list().await?;
    println!("{}", shell::render_links(&links));
    ensure!(
        links.len() == 1 && links[0].source == a && links[0].target == b,
        "link list mismatch: {links:?}"
    );

    ctl.unlink_ports(a, b).await?;
    ensure!(ctl.get_link_list().await?.is_empty(), "link survived unlink");
    println!("unlinked {a} <-> {b}");

    ctl.remove_port(a).await?;
    ctl.remove_port(b).await?;
    let ports = ctl.get_port_list().await?;
    println!("{}", shell::render_ports(&ports));
    ensure!(ports.is_empty(), "ports survived removal");
    Ok(())
}
