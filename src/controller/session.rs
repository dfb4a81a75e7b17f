//! Routing of async completions back to the session that issued them.
//!
//! Completions carry a `SessionToken` instead of a pointer. The registry is
//! an arena of slots; closing a session bumps the slot generation, so a
//! completion that arrives for a closed session resolves to nothing and is
//! dropped.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};

use crate::log::vdebug;
use crate::proto::completion::{
    ASYNC_ARG_COUNT, ASYNC_TAG_RESPONSE, AsyncCallback, CompletionPayload, SessionToken,
};
use crate::proto::dump::describe;
use crate::proto::status::StatusCode;
use crate::proto::wire::{LinkEntry, PortInfo, WireMessage};
use crate::sync::lock;

use super::{ControllerEvent, error_event};

/// A delivered response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Outcome of the command, from the response status.
    pub result: StatusCode,
    pub response: WireMessage,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        self.response.ports()
    }

    pub fn links(&self) -> Vec<LinkEntry> {
        self.response.links()
    }
}

struct Session {
    /// Callers waiting for a reply, in submission order.
    waiters: VecDeque<oneshot::Sender<Reply>>,
    events: mpsc::UnboundedSender<ControllerEvent>,
}

struct Slot {
    generation: u32,
    session: Option<Session>,
}

#[derive(Default)]
pub struct SessionRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl SessionRegistry {
    /// Opens a session whose events go to `events`.
    pub fn open(&self, events: mpsc::UnboundedSender<ControllerEvent>) -> SessionToken {
        let mut slots = lock(&self.slots);
        let session = Session {
            waiters: VecDeque::new(),
            events,
        };
        if let Some((index, slot)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.session.is_none())
        {
            slot.session = Some(session);
            return SessionToken {
                index: index as u32,
                generation: slot.generation,
            };
        }
        slots.push(Slot {
            generation: 0,
            session: Some(session),
        });
        SessionToken {
            index: (slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Closes a session. Its waiters are dropped, which their receivers see
    /// as cancellation.
    pub fn close(&self, token: SessionToken) -> bool {
        let mut slots = lock(&self.slots);
        let Some(slot) = Self::slot_mut(&mut slots, token) else {
            return false;
        };
        slot.session = None;
        slot.generation = slot.generation.wrapping_add(1);
        true
    }

    pub fn is_open(&self, token: SessionToken) -> bool {
        let mut slots = lock(&self.slots);
        Self::slot_mut(&mut slots, token).is_some()
    }

    /// Queues a waiter for the next completion of the session.
    pub fn push_waiter(&self, token: SessionToken, waiter: oneshot::Sender<Reply>) -> bool {
        let mut slots = lock(&self.slots);
        match Self::session_mut(&mut slots, token) {
            Some(session) => {
                session.waiters.push_back(waiter);
                true
            }
            None => false,
        }
    }

    /// Takes back the most recent waiter after the transport refused the
    /// request it was queued for.
    pub fn pop_last_waiter(&self, token: SessionToken) {
        let mut slots = lock(&self.slots);
        if let Some(session) = Self::session_mut(&mut slots, token) {
            session.waiters.pop_back();
        }
    }

    pub fn pending(&self, token: SessionToken) -> usize {
        let mut slots = lock(&self.slots);
        Self::session_mut(&mut slots, token)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }

    fn slot_mut(slots: &mut [Slot], token: SessionToken) -> Option<&mut Slot> {
        slots
            .get_mut(token.index as usize)
            .filter(|s| s.generation == token.generation && s.session.is_some())
    }

    fn session_mut(slots: &mut [Slot], token: SessionToken) -> Option<&mut Session> {
        Self::slot_mut(slots, token).and_then(|s| s.session.as_mut())
    }
}

impl AsyncCallback for SessionRegistry {
    fn on_complete(&self, refcon: SessionToken, payload: CompletionPayload<'_>) {
        let mut slots = lock(&self.slots);
        let Some(session) = Self::session_mut(&mut slots, refcon) else {
            vdebug!("ctl", "completion for closed session {refcon} dropped");
            return;
        };
        // the oldest waiter belongs to this completion whatever its outcome
        let waiter = session.waiters.pop_front();
        let emit = |event| {
            let _ = session.events.send(event);
        };

        if !payload.result.is_success() {
            emit(error_event(payload.result, "async completion failed"));
            return;
        }
        if payload.args.len() < ASYNC_ARG_COUNT || payload.args[0] != ASYNC_TAG_RESPONSE {
            emit(error_event(
                StatusCode::Invalid,
                &format!("unexpected completion payload {:?}", payload.args),
            ));
            return;
        }
        let response = *payload.response;
        if !response.has_valid_stamp() {
            let flags = response.status.flags;
            emit(error_event(
                StatusCode::Invalid,
                &format!("response without magic stamp (flags 0x{flags:x})"),
            ));
            return;
        }
        vdebug!("ctl", "{}", describe("response", &response));

        let reply = Reply {
            result: response.status_code(),
            response,
        };
        emit(ControllerEvent::Completion {
            result: reply.result,
            args: payload.args.to_vec(),
        });
        if !reply.is_success() {
            let what = response
                .decode_command()
                .map(|c| c.name())
                .unwrap_or("request");
            emit(error_event(reply.result, &format!("{what} failed")));
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(reply);
        }
        emit(ControllerEvent::DataReady(reply));
    }
}
