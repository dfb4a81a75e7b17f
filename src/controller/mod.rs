//! Client side of the control protocol.
//!
//! A `Controller` owns at most one connection to the driver. It finds the
//! driver through a `ServiceNotifier`, submits stamped requests on the
//! connection and reports what happens as `ControllerEvent`s on a single
//! channel. Awaitable wrappers (`request` and the named operations) sit on
//! top of the same path and add a timeout.

pub mod discovery;
pub mod session;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use zerocopy::IntoBytes;

use crate::config::ClientConfig;
use crate::log::{vdebug, vlog};
use crate::proto::command::{Command, LineParams};
use crate::proto::completion::{AsyncCallback, Completion, SessionToken};
use crate::proto::dump::describe;
use crate::proto::status::StatusCode;
use crate::proto::wire::{LinkEntry, PortInfo, WireMessage};
use crate::sync::lock;

use discovery::{Connection, DiscoveryError, Notifications, Service, ServiceNotification, ServiceNotifier};
use session::{Reply, SessionRegistry};

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    Connected { name: String, path: String },
    Disconnected,
    /// Raw completion as delivered by the driver.
    Completion { result: StatusCode, args: Vec<u64> },
    DataReady(Reply),
    Error { code: StatusCode, message: String },
}

/// Builds an `Error` event, with the code split the way the host reports
/// it.
pub fn error_event(code: StatusCode, what: &str) -> ControllerEvent {
    let (system, sub, raw) = code.parts();
    let message = format!("{what}: {code} (system 0x{system:02x}, sub 0x{sub:03x}, code 0x{raw:04x})");
    vlog!("ctl", "{message}");
    ControllerEvent::Error { code, message }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("not connected to the driver")]
    NotConnected,
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("request refused: {0}")]
    Rejected(StatusCode),
    #[error("{command} failed: {code}")]
    Failed { command: Command, code: StatusCode },
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("request cancelled by disconnect")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// Waiting for a matching service.
    Connecting,
    Connected,
}

struct Link {
    service: Arc<dyn Service>,
    connection: Box<dyn Connection>,
    session: SessionToken,
}

struct Inner {
    state: LinkState,
    link: Option<Link>,
    pump: Option<JoinHandle<()>>,
}

struct Shared {
    notifier: Arc<dyn ServiceNotifier>,
    config: ClientConfig,
    sessions: Arc<SessionRegistry>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    /// Opens the first of `services` that accepts our entitlement and makes
    /// it the connection. A connection held before is closed first.
    fn device_added(&self, inner: &mut Inner, services: &[Arc<dyn Service>]) -> bool {
        if services.is_empty() {
            return false;
        }
        let (service, connection) = match discovery::open_first(services, &self.config.entitlement) {
            Ok(opened) => opened,
            Err(e) => {
                self.emit(error_event(e.code(), "opening driver service"));
                return false;
            }
        };
        self.release(inner);
        let session = self.sessions.open(self.events.clone());
        let (name, path) = (service.name().to_string(), service.path().to_string());
        inner.link = Some(Link {
            service,
            connection,
            session,
        });
        inner.state = LinkState::Connected;
        vlog!("ctl", "connected to {name} ({path}), session {session}");
        self.emit(ControllerEvent::Connected { name, path });
        true
    }

    /// Drops the current connection, if any. Pending requests are
    /// cancelled. Returns true if there was one.
    fn release(&self, inner: &mut Inner) -> bool {
        let Some(link) = inner.link.take() else {
            return false;
        };
        self.sessions.close(link.session);
        vlog!("ctl", "released {}", link.service.path());
        drop(link.connection);
        true
    }

    fn device_removed(&self, inner: &mut Inner, path: &str) {
        let ours = inner
            .link
            .as_ref()
            .is_some_and(|l| l.service.path() == path);
        if ours && self.release(inner) {
            inner.state = LinkState::Disconnected;
            self.emit(ControllerEvent::Disconnected);
        }
    }
}

async fn pump(shared: Weak<Shared>, mut rx: Notifications) {
    while let Some(note) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        vdebug!("disc", "{note:?}");
        let mut inner = lock(&shared.inner);
        match note {
            ServiceNotification::Matched(service) => {
                if inner.state != LinkState::Connected {
                    shared.device_added(&mut inner, &[service]);
                }
            }
            ServiceNotification::Terminated { path } => shared.device_removed(&mut inner, &path),
        }
    }
}

pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn new(
        notifier: Arc<dyn ServiceNotifier>,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            notifier,
            config,
            sessions: Arc::new(SessionRegistry::default()),
            events,
            inner: Mutex::new(Inner {
                state: LinkState::Disconnected,
                link: None,
                pump: None,
            }),
        });
        (Self { shared }, rx)
    }

    /// Starts watching for the driver and connects to it if it is already
    /// present. Returns whether a connection is up when this returns; if not,
    /// the controller stays `Connecting` and connects once a matching
    /// service appears. Must be called from within a tokio runtime.
    pub fn connect(&self) -> Result<bool, ControlError> {
        let mut inner = lock(&self.shared.inner);
        if inner.state == LinkState::Connected {
            return Ok(true);
        }
        let (present, rx) = match self
            .shared
            .notifier
            .add_matching_notification(&self.shared.config.service_name)
        {
            Ok(watch) => watch,
            Err(e) => {
                self.shared.emit(error_event(e.code(), "registering for driver notifications"));
                inner.state = LinkState::Disconnected;
                return Err(e.into());
            }
        };
        inner.state = LinkState::Connecting;
        if let Some(old) = inner.pump.replace(tokio::spawn(pump(Arc::downgrade(&self.shared), rx))) {
            old.abort();
        }
        Ok(self.shared.device_added(&mut inner, &present))
    }

    /// Stops watching and closes the connection.
    pub fn disconnect(&self) {
        let mut inner = lock(&self.shared.inner);
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        let was_connected = self.shared.release(&mut inner);
        inner.state = LinkState::Disconnected;
        if was_connected {
            self.shared.emit(ControllerEvent::Disconnected);
        }
    }

    pub fn state(&self) -> LinkState {
        lock(&self.shared.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn device_name(&self) -> Option<String> {
        let inner = lock(&self.shared.inner);
        inner.link.as_ref().map(|l| l.service.name().to_string())
    }

    pub fn device_path(&self) -> Option<String> {
        let inner = lock(&self.shared.inner);
        inner.link.as_ref().map(|l| l.service.path().to_string())
    }

    /// Stamps and submits `msg`. `Ok` means the driver accepted it and a
    /// reply will arrive on the returned receiver (and as a `DataReady`
    /// event).
    pub fn submit(&self, mut msg: WireMessage) -> Result<oneshot::Receiver<Reply>, ControlError> {
        let inner = lock(&self.shared.inner);
        let Some(link) = inner.link.as_ref() else {
            self.shared
                .emit(error_event(StatusCode::NotFound, "no connection to the driver"));
            return Err(ControlError::NotConnected);
        };
        msg.stamp();
        vdebug!("ctl", "{}", describe("request", &msg));

        let (tx, rx) = oneshot::channel();
        self.shared.sessions.push_waiter(link.session, tx);
        let callback: Arc<dyn AsyncCallback> = self.shared.sessions.clone();
        let completion = Completion::new(callback, link.session);
        let selector = msg.command as u64;
        if let Err(code) = link
            .connection
            .call_async(selector, msg.as_bytes(), Some(completion))
        {
            self.shared.sessions.pop_last_waiter(link.session);
            let what = msg.decode_command().map(|c| c.name()).unwrap_or("request");
            self.shared.emit(error_event(code, &format!("submitting {what}")));
            return Err(ControlError::Rejected(code));
        }
        Ok(rx)
    }

    /// Fire-and-forget submission; the result arrives as events only.
    pub fn send(&self, msg: WireMessage) -> bool {
        self.submit(msg).is_ok()
    }

    /// Submits `msg` and waits for its reply, up to the configured timeout.
    pub async fn request(&self, msg: WireMessage) -> Result<Reply, ControlError> {
        let rx = self.submit(msg)?;
        let limit = self.shared.config.request_timeout();
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ControlError::Cancelled),
            Err(_) => Err(ControlError::Timeout(limit)),
        }
    }

    /// Like `request`, but a non-success status is an error.
    async fn command(&self, msg: WireMessage) -> Result<Reply, ControlError> {
        let command = msg.decode_command().map_err(|_| ControlError::Rejected(StatusCode::BadArgument))?;
        let reply = self.request(msg).await?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(ControlError::Failed {
                command,
                code: reply.result,
            })
        }
    }

    pub async fn get_status(&self) -> Result<Reply, ControlError> {
        self.command(WireMessage::get_status()).await
    }

    /// Creates a port and returns the id the driver assigned.
    pub async fn create_port(&self, line: &LineParams) -> Result<u8, ControlError> {
        let msg = WireMessage::create_port(line)
            .map_err(|_| ControlError::Rejected(StatusCode::BadArgument))?;
        let reply = self.command(msg).await?;
        Ok(reply.response.parameter.link.source)
    }

    pub async fn remove_port(&self, id: u8) -> Result<(), ControlError> {
        self.command(WireMessage::remove_port(id)).await.map(drop)
    }

    pub async fn link_ports(&self, source: u8, target: u8) -> Result<(), ControlError> {
        self.command(WireMessage::link_ports(source, target))
            .await
            .map(drop)
    }

    pub async fn unlink_ports(&self, source: u8, target: u8) -> Result<(), ControlError> {
        self.command(WireMessage::unlink_ports(source, target))
            .await
            .map(drop)
    }

    pub async fn get_port_list(&self) -> Result<Vec<PortInfo>, ControlError> {
        Ok(self.command(WireMessage::get_port_list()).await?.ports())
    }

    pub async fn get_link_list(&self) -> Result<Vec<LinkEntry>, ControlError> {
        Ok(self.command(WireMessage::get_link_list()).await?.links())
    }

    /// Replaces the check bits of `port`; returns the port's new flags.
    pub async fn enable_checks(&self, port: u8, checks: u64) -> Result<u64, ControlError> {
        let reply = self.command(WireMessage::enable_checks(port, checks)).await?;
        Ok(reply.ports().first().map(|p| p.flags).unwrap_or(0))
    }

    /// Replaces the trace bits of `port`; returns the port's new flags.
    pub async fn enable_trace(&self, port: u8, traces: u64) -> Result<u64, ControlError> {
        let reply = self.command(WireMessage::enable_trace(port, traces)).await?;
        Ok(reply.ports().first().map(|p| p.flags).unwrap_or(0))
    }

    /// Asks the driver to shut down. The connection goes away when the
    /// service's termination notification arrives.
    pub fn shutdown_driver(&self) -> Result<(), ControlError> {
        let inner = lock(&self.shared.inner);
        let link = inner.link.as_ref().ok_or(ControlError::NotConnected)?;
        link.connection.terminate().map_err(|code| {
            self.shared.emit(error_event(code, "driver shutdown"));
            ControlError::Rejected(code)
        })
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let mut inner = lock(&self.shared.inner);
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        self.shared.release(&mut inner);
    }
}
