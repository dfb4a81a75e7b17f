use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    #[serde(rename = "async")]
    pub async_: AsyncConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Name the driver service is published under.
    pub service_name: String,
    pub service_path: String,
    /// Entitlement a client must present to open the service.
    pub entitlement: String,
    pub port_name_prefix: String,
    /// Capacity of each RX and TX FIFO in bytes.
    pub fifo_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AsyncConfig {
    /// Delay between handling a request and firing its completion.
    pub wake_ms: u64,
    /// Lateness tolerated before a completion is logged as late.
    pub leeway_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service name to match during discovery.
    pub service_name: String,
    pub entitlement: String,
    pub request_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            service_name: "VSPDriver".into(),
            service_path: "IOService:/vsp/VSPDriver".into(),
            entitlement: "vsp.userclient-access".into(),
            port_name_prefix: "tty.vsp".into(),
            fifo_size: 4096,
        }
    }
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            wake_ms: 100,
            leeway_ms: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_name: "VSPDriver".into(),
            entitlement: "vsp.userclient-access".into(),
            request_timeout_ms: 2000,
        }
    }
}

impl AsyncConfig {
    pub fn wake(&self) -> Duration {
        Duration::from_millis(self.wake_ms)
    }
    pub fn leeway(&self) -> Duration {
        Duration::from_millis(self.leeway_ms)
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Loads the TOML file at `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(text)?;
        anyhow::ensure!(cfg.driver.fifo_size > 0, "driver.fifo_size must be > 0");
        Ok(cfg)
    }
}
