use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::config::{AsyncConfig, Config};
use crate::controller::discovery::{Connection, LocalNotifier, Service};
use crate::log::vlog;
use crate::proto::completion::Completion;
use crate::proto::status::StatusCode;

use super::Driver;
use super::user_client::UserClient;

/// The driver as seen from discovery: a named service that hands out user
/// clients.
pub struct DriverService {
    name: String,
    path: String,
    entitlement: String,
    driver: Arc<Driver>,
    async_cfg: AsyncConfig,
    next_client: AtomicU32,
    terminated: AtomicBool,
    notifier: Weak<LocalNotifier>,
    me: Weak<DriverService>,
}

impl DriverService {
    pub fn new(config: &Config, notifier: &Arc<LocalNotifier>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: config.driver.service_name.clone(),
            path: config.driver.service_path.clone(),
            entitlement: config.driver.entitlement.clone(),
            driver: Arc::new(Driver::new(&config.driver)),
            async_cfg: config.async_.clone(),
            next_client: AtomicU32::new(1),
            terminated: AtomicBool::new(false),
            notifier: Arc::downgrade(notifier),
            me: me.clone(),
        })
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Stops every port, then withdraws the service. Only the first call
    /// does anything.
    pub fn terminate(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        let stopped = self.driver.shutdown();
        vlog!("uc", "{} terminating, {stopped} port(s) stopped", self.name);
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.terminate(&self.path);
        }
        true
    }
}

/// Starts a driver with `config` and publishes it on a fresh notifier.
pub fn launch(config: &Config) -> (Arc<LocalNotifier>, Arc<DriverService>) {
    let notifier = LocalNotifier::new();
    let service = DriverService::new(config, &notifier);
    notifier.publish(service.clone());
    (notifier, service)
}

impl Service for DriverService {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn open(&self, entitlement: &str) -> Result<Box<dyn Connection>, StatusCode> {
        if self.is_terminated() {
            return Err(StatusCode::NotFound);
        }
        if entitlement != self.entitlement {
            vlog!("uc", "open refused: missing entitlement {}", self.entitlement);
            return Err(StatusCode::NotPermitted);
        }
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let client = UserClient::new(id, self.driver.clone(), self.async_cfg.clone());
        client.start();
        Ok(Box::new(LocalConnection {
            client,
            service: self.me.clone(),
        }))
    }
}

/// Connection to an in-process user client. Dropping it tears the client
/// down.
struct LocalConnection {
    client: UserClient,
    service: Weak<DriverService>,
}

impl Connection for LocalConnection {
    fn call_async(
        &self,
        selector: u64,
        input: &[u8],
        completion: Option<Completion>,
    ) -> Result<(), StatusCode> {
        self.client.external_method(selector, input, completion)
    }

    fn terminate(&self) -> Result<(), StatusCode> {
        let service = self.service.upgrade().ok_or(StatusCode::NotResponding)?;
        if service.terminate() {
            Ok(())
        } else {
            Err(StatusCode::NotResponding)
        }
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.client.stop();
    }
}
