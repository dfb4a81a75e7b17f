//! Per-connection command dispatcher.
//!
//! Every call is checked (selector range, message size, completion present,
//! command and magic stamp) before the matching handler runs. Handlers run
//! under the driver lock, fill in a response and return; the response
//! reaches the caller later through the async bridge.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::AsyncConfig;
use crate::log::{vdebug, vlog};
use crate::proto::command::{Command, Context, LAST_COMMAND};
use crate::proto::completion::Completion;
use crate::proto::dump::describe;
use crate::proto::status::StatusCode;
use crate::proto::wire::{CHECK_MASK, PortLink, TRACE_MASK, WIRE_SIZE, WireMessage};
use crate::sync::lock;

use super::bridge::AsyncBridge;
use super::{Driver, DriverState};

type Handler = fn(&mut DriverState, &WireMessage, &mut WireMessage) -> Result<(), StatusCode>;

struct Dispatch {
    handler: Handler,
    /// Logged when the handler succeeds.
    message: &'static str,
}

/// Indexed by selector. PingPong (0) is reserved and has no handler;
/// `LAST_COMMAND` is outside the table.
static DISPATCH: [Option<Dispatch>; LAST_COMMAND as usize] = [
    None,
    Some(Dispatch {
        handler: get_status,
        message: "status reported",
    }),
    Some(Dispatch {
        handler: create_port,
        message: "port created",
    }),
    Some(Dispatch {
        handler: remove_port,
        message: "port removed",
    }),
    Some(Dispatch {
        handler: link_ports,
        message: "ports linked",
    }),
    Some(Dispatch {
        handler: unlink_ports,
        message: "ports unlinked",
    }),
    Some(Dispatch {
        handler: get_port_list,
        message: "port list reported",
    }),
    Some(Dispatch {
        handler: get_link_list,
        message: "link list reported",
    }),
    Some(Dispatch {
        handler: enable_checks,
        message: "checks updated",
    }),
    Some(Dispatch {
        handler: enable_trace,
        message: "trace updated",
    }),
];

pub struct UserClient {
    id: u32,
    driver: Arc<Driver>,
    async_cfg: AsyncConfig,
    bridge: Mutex<Option<AsyncBridge>>,
    handled: AtomicU64,
}

impl UserClient {
    pub fn new(id: u32, driver: Arc<Driver>, async_cfg: AsyncConfig) -> Self {
        Self {
            id,
            driver,
            async_cfg,
            bridge: Mutex::new(None),
            handled: AtomicU64::new(0),
        }
    }

    /// Starts the completion timer. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut bridge = lock(&self.bridge);
        if bridge.is_none() {
            *bridge = Some(AsyncBridge::spawn(&self.async_cfg));
            vlog!("uc", "client {} started", self.id);
        }
    }

    /// Cancels the timer; completions still pending are never delivered.
    pub fn stop(&self) {
        if let Some(bridge) = lock(&self.bridge).take() {
            bridge.cancel();
            vlog!("uc", "client {} stopped", self.id);
        }
    }

    /// Number of handler invocations so far.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Entry point for a call from the controller side. An `Err` means the
    /// call was refused up front: no handler ran and no completion will fire.
    pub fn external_method(
        &self,
        selector: u64,
        input: &[u8],
        completion: Option<Completion>,
    ) -> Result<(), StatusCode> {
        let Some(dispatch) = usize::try_from(selector)
            .ok()
            .filter(|_| Command::is_dispatchable(selector))
            .and_then(|i| DISPATCH.get(i))
            .and_then(Option::as_ref)
        else {
            vlog!("uc", "client {}: invalid selector {selector}", self.id);
            return Err(StatusCode::BadArgument);
        };
        if input.len() != WIRE_SIZE {
            vlog!(
                "uc",
                "client {}: input size {} != {WIRE_SIZE}",
                self.id,
                input.len()
            );
            return Err(StatusCode::BadArgument);
        }
        let Some(completion) = completion else {
            vlog!("uc", "client {}: got a null completion", self.id);
            return Err(StatusCode::BadArgument);
        };
        let request = WireMessage::from_bytes(input).map_err(|e| {
            vlog!("uc", "client {}: {e}", self.id);
            StatusCode::BadArgument
        })?;
        if request.command as u64 != selector {
            vlog!(
                "uc",
                "client {}: selector {selector} carries command {}",
                self.id,
                request.command
            );
            return Err(StatusCode::BadArgument);
        }
        if !request.has_valid_stamp() {
            let flags = request.status.flags;
            vlog!("uc", "client {}: bad magic stamp 0x{flags:x}", self.id);
            return Err(StatusCode::BadArgument);
        }
        vdebug!("uc", "{}", describe("request", &request));

        let bridge = lock(&self.bridge);
        let Some(bridge) = bridge.as_ref() else {
            vlog!("uc", "client {}: not started", self.id);
            return Err(StatusCode::NotResponding);
        };

        let mut response = WireMessage::zeroed();
        response.command = request.command;
        response.parameter = request.parameter;
        let result = {
            let mut state = self.driver.state();
            (dispatch.handler)(&mut state, &request, &mut response)
        };
        self.handled.fetch_add(1, Ordering::Relaxed);

        let code = match result {
            Ok(()) => {
                vlog!("uc", "client {}: {}", self.id, dispatch.message);
                response.context = Context::Result as u8;
                StatusCode::Success
            }
            Err(code) => {
                vlog!(
                    "uc",
                    "client {}: {} failed: {code}",
                    self.id,
                    Command::ALL[selector as usize]
                );
                response.context = Context::Error as u8;
                code
            }
        };
        response.status.code = code.raw();
        response.status.flags = 0;
        response.stamp();
        vdebug!("uc", "{}", describe("response", &response));

        bridge.arm(response, completion)
    }
}

impl Drop for UserClient {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---- Handlers ----

fn get_status(
    st: &mut DriverState,
    req: &WireMessage,
    resp: &mut WireMessage,
) -> Result<(), StatusCode> {
    get_port_list(st, req, resp)?;
    get_link_list(st, req, resp)
}

fn create_port(
    st: &mut DriverState,
    req: &WireMessage,
    resp: &mut WireMessage,
) -> Result<(), StatusCode> {
    let line = req.port_parameters().map_err(|_| StatusCode::BadArgument)?;
    let info = st.create_port(&line).map_err(|e| e.code())?;
    resp.parameter.flags = info.id as u64;
    resp.parameter.link = PortLink {
        source: info.id,
        target: info.id,
    };
    resp.set_ports(&[info]).map_err(|_| StatusCode::Invalid)
}

fn remove_port(
    st: &mut DriverState,
    req: &WireMessage,
    _resp: &mut WireMessage,
) -> Result<(), StatusCode> {
    let id = req.parameter.link.source;
    st.remove_port(id).map_err(|e| e.code())
}

fn link_ports(
    st: &mut DriverState,
    req: &WireMessage,
    resp: &mut WireMessage,
) -> Result<(), StatusCode> {
    let PortLink { source, target } = req.parameter.link;
    let slot = st.link_ports(source, target).map_err(|e| e.code())?;
    let entry = st
        .registry
        .list_links()
        .into_iter()
        .filter(|l| l.slot == slot)
        .collect::<Vec<_>>();
    resp.set_links(&entry).map_err(|_| StatusCode::Invalid)
}

fn unlink_ports(
    st: &mut DriverState,
    req: &WireMessage,
    _resp: &mut WireMessage,
) -> Result<(), StatusCode> {
    let PortLink { source, target } = req.parameter.link;
    st.unlink_ports(source, target).map_err(|e| e.code())
}

fn get_port_list(
    st: &mut DriverState,
    _req: &WireMessage,
    resp: &mut WireMessage,
) -> Result<(), StatusCode> {
    resp.set_ports(&st.port_infos())
        .map_err(|_| StatusCode::Invalid)
}

fn get_link_list(
    st: &mut DriverState,
    _req: &WireMessage,
    resp: &mut WireMessage,
) -> Result<(), StatusCode> {
    resp.set_links(&st.registry.list_links())
        .map_err(|_| StatusCode::Invalid)
}

fn enable_checks(
    st: &mut DriverState,
    req: &WireMessage,
    resp: &mut WireMessage,
) -> Result<(), StatusCode> {
    replace_port_flags(st, req, resp, CHECK_MASK)
}

fn enable_trace(
    st: &mut DriverState,
    req: &WireMessage,
    resp: &mut WireMessage,
) -> Result<(), StatusCode> {
    replace_port_flags(st, req, resp, TRACE_MASK)
}

fn replace_port_flags(
    st: &mut DriverState,
    req: &WireMessage,
    resp: &mut WireMessage,
    group: u64,
) -> Result<(), StatusCode> {
    let port = req.addressed_port();
    let bits = req.parameter.flags & group;
    st.replace_flags(port, group, bits).map_err(|e| e.code())?;
    let info = st.port_info(port).ok_or(StatusCode::NotFound)?;
    resp.set_ports(&[info]).map_err(|_| StatusCode::Invalid)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use zerocopy::IntoBytes;

    use super::*;
    use crate::config::DriverConfig;
    use crate::proto::command::LineParams;
    use crate::proto::completion::{AsyncCallback, CompletionPayload, SessionToken};
    use crate::proto::wire::{
        CHECK_BAUD, CHECK_PARITY, LinkEntry, MAX_SERIAL_PORTS, TRACE_PORT_RX,
    };

    #[derive(Default)]
    struct Recorder {
        seen: std::sync::Mutex<Vec<(Vec<u64>, WireMessage)>>,
    }

    impl Recorder {
        fn responses(&self) -> Vec<WireMessage> {
            self.seen.lock().unwrap().iter().map(|(_, r)| *r).collect()
        }
    }

    impl AsyncCallback for Recorder {
        fn on_complete(&self, _refcon: SessionToken, payload: CompletionPayload<'_>) {
            self.seen
                .lock()
                .unwrap()
                .push((payload.args.to_vec(), *payload.response));
        }
    }

    struct Rig {
        driver: Arc<Driver>,
        client: UserClient,
        rec: Arc<Recorder>,
    }

    impl Rig {
        fn new() -> Self {
            let driver = Arc::new(Driver::new(&DriverConfig::default()));
            let client = UserClient::new(1, driver.clone(), AsyncConfig::default());
            client.start();
            Rig {
                driver,
                client,
                rec: Arc::new(Recorder::default()),
            }
        }

        fn completion(&self) -> Option<Completion> {
            Some(Completion::new(
                self.rec.clone(),
                SessionToken {
                    index: 0,
                    generation: 0,
                },
            ))
        }

        fn call(&self, mut msg: WireMessage) -> Result<(), StatusCode> {
            msg.stamp();
            self.client
                .external_method(msg.command as u64, msg.as_bytes(), self.completion())
        }

        /// Calls and waits for the completion. Earlier calls complete
        /// first, so the last response is this one.
        async fn roundtrip(&self, msg: WireMessage) -> WireMessage {
            let before = self.rec.seen.lock().unwrap().len();
            self.call(msg).unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            let seen = self.rec.responses();
            assert!(seen.len() > before);
            seen[seen.len() - 1]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_selectors_never_reach_a_handler() {
        let rig = Rig::new();
        let mut msg = WireMessage::get_status();
        msg.stamp();
        for selector in [0, LAST_COMMAND as u64, 11, 255, u64::MAX] {
            assert_eq!(
                rig.client
                    .external_method(selector, msg.as_bytes(), rig.completion()),
                Err(StatusCode::BadArgument)
            );
        }
        assert_eq!(rig.client.handled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn each_valid_selector_reaches_one_handler() {
        let rig = Rig::new();
        for (n, cmd) in Command::ALL
            .iter()
            .filter(|c| Command::is_dispatchable(**c as u64))
            .enumerate()
        {
            let msg = match cmd {
                Command::CreatePort => WireMessage::create_port(&LineParams::DEFAULT).unwrap(),
                other => WireMessage::request(*other),
            };
            rig.call(msg).unwrap();
            assert_eq!(rig.client.handled(), n as u64 + 1);
        }
        assert_eq!(rig.client.handled(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_input_has_no_side_effects() {
        let rig = Rig::new();
        let mut msg = WireMessage::create_port(&LineParams::DEFAULT).unwrap();
        msg.stamp();
        let bytes = msg.as_bytes();
        let sel = Command::CreatePort as u64;

        // short and long buffers
        assert_eq!(
            rig.client
                .external_method(sel, &bytes[..WIRE_SIZE - 1], rig.completion()),
            Err(StatusCode::BadArgument)
        );
        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(
            rig.client.external_method(sel, &long, rig.completion()),
            Err(StatusCode::BadArgument)
        );
        // no completion
        assert_eq!(
            rig.client.external_method(sel, bytes, None),
            Err(StatusCode::BadArgument)
        );
        // selector and command disagree
        assert_eq!(
            rig.client
                .external_method(Command::GetStatus as u64, bytes, rig.completion()),
            Err(StatusCode::BadArgument)
        );
        // unstamped
        let plain = WireMessage::create_port(&LineParams::DEFAULT).unwrap();
        assert_eq!(
            rig.client
                .external_method(sel, plain.as_bytes(), rig.completion()),
            Err(StatusCode::BadArgument)
        );

        assert_eq!(rig.client.handled(), 0);
        assert_eq!(rig.driver.state().registry.port_count(), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rig.rec.responses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn create_then_list_round_trips_line_settings() {
        let rig = Rig::new();
        let line = LineParams::from_raw(9600, 7, 2, 1, 1).unwrap();

        let resp = rig.roundtrip(WireMessage::create_port(&line).unwrap()).await;
        assert_eq!(resp.status_code(), StatusCode::Success);
        assert_eq!(resp.context, Context::Result as u8);
        assert!(resp.has_valid_stamp());
        assert_eq!(resp.parameter.link.source, 0);

        let resp = rig.roundtrip(WireMessage::get_port_list()).await;
        let ports = resp.ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].line, Some(line));

        rig.roundtrip(WireMessage::remove_port(0)).await;
        let resp = rig.roundtrip(WireMessage::get_port_list()).await;
        assert!(resp.ports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_args_carry_tag_and_status() {
        let rig = Rig::new();
        let resp = rig.roundtrip(WireMessage::remove_port(3)).await;
        assert_eq!(resp.context, Context::Error as u8);
        assert_eq!(resp.status_code(), StatusCode::NotFound);

        let (args, _) = rig.rec.seen.lock().unwrap()[0].clone();
        let flags = resp.status.flags;
        assert_eq!(
            args,
            vec![2, flags, StatusCode::NotFound.raw() as u64]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn completions_arrive_in_submission_order() {
        let rig = Rig::new();
        rig.call(WireMessage::create_port(&LineParams::DEFAULT).unwrap()).unwrap();
        rig.call(WireMessage::get_link_list()).unwrap();
        rig.call(WireMessage::get_port_list()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let order: Vec<u8> = rig.rec.responses().iter().map(|r| r.command).collect();
        assert_eq!(
            order,
            vec![
                Command::CreatePort as u8,
                Command::GetLinkList as u8,
                Command::GetPortList as u8
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn seventeenth_port_is_refused() {
        let rig = Rig::new();
        for _ in 0..MAX_SERIAL_PORTS {
            rig.call(WireMessage::create_port(&LineParams::DEFAULT).unwrap()).unwrap();
        }
        let resp = rig
            .roundtrip(WireMessage::create_port(&LineParams::DEFAULT).unwrap())
            .await;
        assert_eq!(resp.status_code(), StatusCode::CapacityExceeded);
        assert_eq!(rig.driver.state().registry.port_count(), MAX_SERIAL_PORTS);
    }

    #[tokio::test(start_paused = true)]
    async fn link_and_unlink() {
        let rig = Rig::new();
        rig.call(WireMessage::create_port(&LineParams::DEFAULT).unwrap()).unwrap();
        rig.call(WireMessage::create_port(&LineParams::DEFAULT).unwrap()).unwrap();

        let resp = rig.roundtrip(WireMessage::link_ports(0, 1)).await;
        assert_eq!(
            resp.links(),
            vec![LinkEntry {
                slot: 0,
                source: 0,
                target: 1
            }]
        );
        let resp = rig.roundtrip(WireMessage::link_ports(1, 0)).await;
        assert_eq!(resp.status_code(), StatusCode::AlreadyLinked);
        let resp = rig.roundtrip(WireMessage::link_ports(1, 1)).await;
        assert_eq!(resp.status_code(), StatusCode::BadArgument);
        let resp = rig.roundtrip(WireMessage::remove_port(1)).await;
        assert_eq!(resp.status_code(), StatusCode::PortBusy);

        rig.roundtrip(WireMessage::unlink_ports(0, 1)).await;
        let resp = rig.roundtrip(WireMessage::get_link_list()).await;
        assert!(resp.links().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn checks_replace_only_their_group() {
        let rig = Rig::new();
        rig.call(WireMessage::create_port(&LineParams::DEFAULT).unwrap()).unwrap();
        rig.call(WireMessage::create_port(&LineParams::DEFAULT).unwrap()).unwrap();
        rig.call(WireMessage::enable_trace(0, TRACE_PORT_RX)).unwrap();
        rig.call(WireMessage::enable_checks(0, CHECK_MASK)).unwrap();
        rig.call(WireMessage::enable_checks(0, CHECK_BAUD | CHECK_PARITY))
            .unwrap();

        let resp = rig.roundtrip(WireMessage::get_status()).await;
        let ports = resp.ports();
        assert_eq!(ports[0].flags, CHECK_BAUD | CHECK_PARITY | TRACE_PORT_RX);
        assert_eq!(ports[1].flags, 0);

        let resp = rig.roundtrip(WireMessage::enable_checks(7, CHECK_BAUD)).await;
        assert_eq!(resp.status_code(), StatusCode::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_completions() {
        let rig = Rig::new();
        rig.call(WireMessage::create_port(&LineParams::DEFAULT).unwrap()).unwrap();
        rig.client.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rig.rec.responses().is_empty());
        // the handler still ran
        assert_eq!(rig.driver.state().registry.port_count(), 1);
        assert_eq!(
            rig.call(WireMessage::get_status()),
            Err(StatusCode::NotResponding)
        );
    }
}
