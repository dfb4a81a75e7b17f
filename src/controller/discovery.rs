//! Service matching: how the controller finds the driver and opens a
//! connection to it.
//!
//! `ServiceNotifier` stands in for the host's matching facility. It reports
//! the services present when a watch is registered and then streams
//! `Matched`/`Terminated` notifications. `LocalNotifier` is the in-process
//! implementation the driver publishes itself on.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::log::{vdebug, vlog};
use crate::proto::completion::Completion;
use crate::proto::status::StatusCode;
use crate::sync::lock;

/// An open channel to a driver user client.
pub trait Connection: Send + Sync {
    /// Submits a request. `Ok` means a completion has been armed.
    fn call_async(
        &self,
        selector: u64,
        input: &[u8],
        completion: Option<Completion>,
    ) -> Result<(), StatusCode>;

    /// Asks the driver behind this connection to shut down.
    fn terminate(&self) -> Result<(), StatusCode>;
}

/// A published driver service.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    fn path(&self) -> &str;
    /// Opens a user client. Fails with `NotPermitted` if `entitlement` is
    /// not accepted.
    fn open(&self, entitlement: &str) -> Result<Box<dyn Connection>, StatusCode>;
}

#[derive(Clone)]
pub enum ServiceNotification {
    Matched(Arc<dyn Service>),
    Terminated { path: String },
}

impl std::fmt::Debug for ServiceNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceNotification::Matched(s) => write!(f, "Matched({})", s.path()),
            ServiceNotification::Terminated { path } => write!(f, "Terminated({path})"),
        }
    }
}

pub type Notifications = mpsc::UnboundedReceiver<ServiceNotification>;

pub trait ServiceNotifier: Send + Sync {
    /// Registers interest in services named `name`. Returns the services
    /// already present and the stream of later changes.
    fn add_matching_notification(
        &self,
        name: &str,
    ) -> Result<(Vec<Arc<dyn Service>>, Notifications), DiscoveryError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("notification port unavailable")]
    NotificationPort,
    #[error("no service named {0}")]
    NotFound(String),
    #[error("opening {name} failed: {code}")]
    Open { name: String, code: StatusCode },
}

impl DiscoveryError {
    pub fn code(&self) -> StatusCode {
        match self {
            DiscoveryError::NotificationPort => StatusCode::NoMemory,
            DiscoveryError::NotFound(_) => StatusCode::NotFound,
            DiscoveryError::Open { code, .. } => *code,
        }
    }
}

/// Opens the first service that accepts `entitlement`. Services after it
/// are not touched.
pub fn open_first(
    services: &[Arc<dyn Service>],
    entitlement: &str,
) -> Result<(Arc<dyn Service>, Box<dyn Connection>), DiscoveryError> {
    let mut last = None;
    for service in services {
        match service.open(entitlement) {
            Ok(conn) => {
                vlog!("disc", "opened {} at {}", service.name(), service.path());
                return Ok((service.clone(), conn));
            }
            Err(code) => {
                vlog!("disc", "open {} failed: {code}", service.path());
                last = Some(DiscoveryError::Open {
                    name: service.name().to_string(),
                    code,
                });
            }
        }
    }
    Err(last.unwrap_or_else(|| DiscoveryError::NotFound(String::new())))
}

struct Watcher {
    name: String,
    tx: mpsc::UnboundedSender<ServiceNotification>,
}

#[derive(Default)]
struct NotifierState {
    services: Vec<Arc<dyn Service>>,
    watchers: Vec<Watcher>,
    closed: bool,
}

/// In-process service registry.
#[derive(Default)]
pub struct LocalNotifier {
    state: Mutex<NotifierState>,
}

impl LocalNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes a service and notifies watchers of its name.
    pub fn publish(&self, service: Arc<dyn Service>) {
        let mut st = lock(&self.state);
        vlog!("disc", "published {} at {}", service.name(), service.path());
        st.watchers.retain(|w| {
            if w.name != service.name() {
                return true;
            }
            w.tx
                .send(ServiceNotification::Matched(service.clone()))
                .is_ok()
        });
        st.services.push(service);
    }

    /// Withdraws the service at `path`. Returns false if none was published
    /// there.
    pub fn terminate(&self, path: &str) -> bool {
        let mut st = lock(&self.state);
        let Some(pos) = st.services.iter().position(|s| s.path() == path) else {
            return false;
        };
        let service = st.services.remove(pos);
        vlog!("disc", "terminated {} at {path}", service.name());
        st.watchers.retain(|w| {
            if w.name != service.name() {
                return true;
            }
            w.tx
                .send(ServiceNotification::Terminated {
                    path: path.to_string(),
                })
                .is_ok()
        });
        true
    }

    /// Makes later registrations fail, as when the host's notification port
    /// cannot be created.
    pub fn close(&self) {
        lock(&self.state).closed = true;
    }
}

impl ServiceNotifier for LocalNotifier {
    fn add_matching_notification(
        &self,
        name: &str,
    ) -> Result<(Vec<Arc<dyn Service>>, Notifications), DiscoveryError> {
        let mut st = lock(&self.state);
        if st.closed {
            return Err(DiscoveryError::NotificationPort);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        st.watchers.push(Watcher {
            name: name.to_string(),
            tx,
        });
        let matched = st
            .services
            .iter()
            .filter(|s| s.name() == name)
            .cloned()
            .collect::<Vec<_>>();
        vdebug!("disc", "watching {name}, {} present", matched.len());
        Ok((matched, rx))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Service whose `open` succeeds or fails on demand.
    pub(crate) struct FakeService {
        pub name: String,
        pub path: String,
        pub fail_with: Option<StatusCode>,
        pub opened: AtomicUsize,
    }

    pub(crate) struct FakeConnection;

    impl Connection for FakeConnection {
        fn call_async(
            &self,
            _selector: u64,
            _input: &[u8],
            _completion: Option<Completion>,
        ) -> Result<(), StatusCode> {
            Err(StatusCode::NotResponding)
        }
        fn terminate(&self) -> Result<(), StatusCode> {
            Ok(())
        }
    }

    impl FakeService {
        pub(crate) fn new(path: &str, fail_with: Option<StatusCode>) -> Arc<Self> {
            Arc::new(Self {
                name: "VSPDriver".into(),
                path: path.into(),
                fail_with,
                opened: AtomicUsize::new(0),
            })
        }
    }

    impl Service for FakeService {
        fn name(&self) -> &str {
            &self.name
        }
        fn path(&self) -> &str {
            &self.path
        }
        fn open(&self, _entitlement: &str) -> Result<Box<dyn Connection>, StatusCode> {
            self.opened.fetch_add(1, Ordering::Relaxed);
            match self.fail_with {
                Some(code) => Err(code),
                None => Ok(Box::new(FakeConnection)),
            }
        }
    }

    #[test]
    fn first_successful_open_wins() {
        let bad = FakeService::new("a", Some(StatusCode::NotPermitted));
        let good = FakeService::new("b", None);
        let spare = FakeService::new("c", None);
        let services: Vec<Arc<dyn Service>> = vec![bad.clone(), good.clone(), spare.clone()];

        let (service, _conn) = open_first(&services, "x").unwrap();
        assert_eq!(service.path(), "b");
        assert_eq!(bad.opened.load(Ordering::Relaxed), 1);
        assert_eq!(spare.opened.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn open_failure_reports_last_code() {
        let services: Vec<Arc<dyn Service>> =
            vec![FakeService::new("a", Some(StatusCode::NotPermitted))];
        let err = open_first(&services, "x").err().unwrap();
        assert_eq!(err.code(), StatusCode::NotPermitted);
        assert_eq!(
            open_first(&[], "x").err().unwrap().code(),
            StatusCode::NotFound
        );
    }

    #[tokio::test]
    async fn watchers_see_publish_and_terminate() {
        let notifier = LocalNotifier::new();
        notifier.publish(FakeService::new("early", None));

        let (present, mut rx) = notifier.add_matching_notification("VSPDriver").unwrap();
        assert_eq!(present.len(), 1);
        let (none, _rx) = notifier.add_matching_notification("Other").unwrap();
        assert!(none.is_empty());

        notifier.publish(FakeService::new("late", None));
        assert!(matches!(
            rx.recv().await,
            Some(ServiceNotification::Matched(s)) if s.path() == "late"
        ));

        assert!(notifier.terminate("early"));
        assert!(!notifier.terminate("early"));
        assert!(matches!(
            rx.recv().await,
            Some(ServiceNotification::Terminated { path }) if path == "early"
        ));
    }

    #[test]
    fn closed_notifier_refuses_watch() {
        let notifier = LocalNotifier::new();
        notifier.close();
        assert_eq!(
            notifier.add_matching_notification("VSPDriver").err(),
            Some(DiscoveryError::NotificationPort)
        );
    }
}
