use std::fmt;
use std::sync::Arc;

use super::status::StatusCode;
use super::wire::WireMessage;

/// Leading tag of every async completion payload.
pub const ASYNC_TAG_RESPONSE: u64 = 2;

/// Number of scalar elements delivered with a completion: the tag followed
/// by the response's `status.flags` and `status.code`.
pub const ASYNC_ARG_COUNT: usize = 3;

/// Opaque handle naming the client session a completion belongs to. Stale
/// tokens (closed sessions) resolve to nothing instead of dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// What the driver hands back when a scheduled completion fires.
#[derive(Debug, Clone, Copy)]
pub struct CompletionPayload<'a> {
    pub result: StatusCode,
    pub args: &'a [u64],
    pub response: &'a WireMessage,
}

/// Receiver side of async completions.
pub trait AsyncCallback: Send + Sync {
    fn on_complete(&self, refcon: SessionToken, payload: CompletionPayload<'_>);
}

/// A retained completion. Owning it keeps the callback alive for the whole
/// async window; `complete` consumes it, so it fires at most once. Dropping
/// it without completing is how teardown cancels a request.
pub struct Completion {
    callback: Arc<dyn AsyncCallback>,
    refcon: SessionToken,
}

impl Completion {
    pub fn new(callback: Arc<dyn AsyncCallback>, refcon: SessionToken) -> Self {
        Self { callback, refcon }
    }

    pub fn refcon(&self) -> SessionToken {
        self.refcon
    }

    pub fn complete(self, payload: CompletionPayload<'_>) {
        self.callback.on_complete(self.refcon, payload);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("refcon", &self.refcon)
            .finish_non_exhaustive()
    }
}
