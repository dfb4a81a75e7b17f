//! Attaches a physical serial device to a linked pair of virtual ports.
//!
//! Bytes read from the device are written into port A, come out of port B,
//! are written straight back into B and return through A to the device. A
//! healthy setup therefore echoes everything the device sends.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::controller::Controller;
use crate::driver::Driver;
use crate::log::{vdebug, vlog};
use crate::port::open_port;
use crate::proto::command::LineParams;

#[derive(Debug, Clone)]
pub struct BridgeOpts {
    /// Serial device path.
    pub dev: String,
    pub line: LineParams,
    /// Device read timeout; bounds how long the loop takes to notice a stop.
    pub poll: Duration,
    /// Stop after this long instead of waiting for Ctrl-C.
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub from_device: u64,
    pub to_device: u64,
}

/// One pass of the bridge loop. Returns whether any bytes moved.
pub fn shuttle<D: Read + Write + ?Sized>(
    dev: &mut D,
    driver: &Driver,
    a: u8,
    b: u8,
    buf: &mut [u8],
    counters: &mut Counters,
) -> Result<bool> {
    let mut moved = false;

    let n = match dev.read(buf) {
        Ok(n) => n,
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => 0,
        Err(e) => return Err(e).context("device read"),
    };
    if n > 0 {
        driver.write(a, &buf[..n])?;
        counters.from_device += n as u64;
        moved = true;
    }

    // loop back on the far side of the link
    loop {
        let m = driver.read(b, buf)?;
        if m == 0 {
            break;
        }
        driver.write(b, &buf[..m])?;
        moved = true;
    }

    loop {
        let k = driver.read(a, buf)?;
        if k == 0 {
            break;
        }
        dev.write_all(&buf[..k]).context("device write")?;
        counters.to_device += k as u64;
        moved = true;
    }
    Ok(moved)
}

pub async fn run(ctl: &Controller, driver: Arc<Driver>, opts: &BridgeOpts) -> Result<Counters> {
    let mut dev = open_port(&opts.dev, &opts.line, opts.poll)?;
    let a = ctl.create_port(&opts.line).await?;
    let b = ctl.create_port(&opts.line).await?;
    ctl.link_ports(a, b).await?;
    vlog!("port", "bridging {} <-> port {a}, port {b} loops back", opts.dev);

    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let stop = stop.clone();
        let driver = driver.clone();
        tokio::task::spawn_blocking(move || -> Result<Counters> {
            let mut buf = vec![0u8; 1024];
            let mut counters = Counters::default();
            while !stop.load(Ordering::Relaxed) {
                if shuttle(&mut *dev, &driver, a, b, &mut buf, &mut counters)? {
                    vdebug!("port", "{counters:?}");
                }
            }
            Ok(counters)
        })
    };

    match opts.duration {
        Some(d) => tokio::time::sleep(d).await,
        None => tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?,
    }
    stop.store(true, Ordering::Relaxed);
    let result = worker.await.context("bridge worker")?;

    ctl.unlink_ports(a, b).await?;
    ctl.remove_port(a).await?;
    ctl.remove_port(b).await?;

    let counters = result?;
    vlog!(
        "port",
        "bridge stopped: {} bytes from device, {} echoed",
        counters.from_device,
        counters.to_device
    );
    Ok(counters)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::config::DriverConfig;

    /// Device that hands out a fixed input once, then times out.
    struct FakeDevice {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for FakeDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.read(buf)? {
                0 => Err(io::ErrorKind::TimedOut.into()),
                n => Ok(n),
            }
        }
    }

    impl Write for FakeDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn device_sees_its_bytes_echoed() {
        let driver = Driver::new(&DriverConfig::default());
        {
            let mut st = driver.state();
            st.create_port(&LineParams::DEFAULT).unwrap();
            st.create_port(&LineParams::DEFAULT).unwrap();
            st.link_ports(0, 1).unwrap();
        }
        let mut dev = FakeDevice {
            input: Cursor::new(b"hello bridge".to_vec()),
            output: Vec::new(),
        };
        let mut buf = [0u8; 5];
        let mut c = Counters::default();

        while shuttle(&mut dev, &driver, 0, 1, &mut buf, &mut c).unwrap() {}

        assert_eq!(dev.output, b"hello bridge");
        assert_eq!(
            c,
            Counters {
                from_device: 12,
                to_device: 12
            }
        );
    }

    #[test]
    fn unlinked_ports_swallow_data() {
        let driver = Driver::new(&DriverConfig::default());
        {
            let mut st = driver.state();
            st.create_port(&LineParams::DEFAULT).unwrap();
            st.create_port(&LineParams::DEFAULT).unwrap();
        }
        let mut dev = FakeDevice {
            input: Cursor::new(b"lost".to_vec()),
            output: Vec::new(),
        };
        let mut buf = [0u8; 16];
        let mut c = Counters::default();
        assert!(shuttle(&mut dev, &driver, 0, 1, &mut buf, &mut c).unwrap());
        assert!(!shuttle(&mut dev, &driver, 0, 1, &mut buf, &mut c).unwrap());
        assert!(dev.output.is_empty());
    }
}
