//! Deferred delivery of command responses.
//!
//! Handlers never complete a call synchronously. They hand the finished
//! response and the retained completion to the bridge, which fires it after
//! the configured wake time from a single task per user client. One task
//! and one queue keep completions in arm order.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::config::AsyncConfig;
use crate::log::{vdebug, vlog};
use crate::proto::completion::{ASYNC_TAG_RESPONSE, Completion, CompletionPayload};
use crate::proto::status::StatusCode;
use crate::proto::wire::WireMessage;

/// A response waiting for its wake time.
#[derive(Debug)]
pub struct PendingAction {
    response: Box<WireMessage>,
    completion: Completion,
    deadline: Instant,
}

impl PendingAction {
    fn fire(self) {
        let status = self.response.status;
        let (code, flags) = (status.code, status.flags);
        let args = [ASYNC_TAG_RESPONSE, flags, code as u64];
        vdebug!(
            "bridge",
            "completing {} for session {}",
            self.response.command,
            self.completion.refcon()
        );
        self.completion.complete(CompletionPayload {
            result: StatusCode::Success,
            args: &args,
            response: &self.response,
        });
    }
}

pub struct AsyncBridge {
    tx: mpsc::UnboundedSender<PendingAction>,
    task: JoinHandle<()>,
    wake: Duration,
}

impl AsyncBridge {
    /// Starts the timer task. Must be called from within a tokio runtime.
    pub fn spawn(cfg: &AsyncConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, cfg.leeway()));
        Self {
            tx,
            task,
            wake: cfg.wake(),
        }
    }

    /// Schedules `completion` to receive `response` one wake interval from
    /// now.
    pub fn arm(&self, response: WireMessage, completion: Completion) -> Result<(), StatusCode> {
        let action = PendingAction {
            response: Box::new(response),
            completion,
            deadline: Instant::now() + self.wake,
        };
        self.tx.send(action).map_err(|_| {
            vlog!("bridge", "timer task gone, completion dropped");
            StatusCode::NotResponding
        })
    }

    /// Stops the timer task. Pending completions are dropped without being
    /// invoked.
    pub fn cancel(self) {
        self.task.abort();
        vdebug!("bridge", "timer task cancelled");
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<PendingAction>, leeway: Duration) {
    while let Some(action) = rx.recv().await {
        sleep_until(action.deadline).await;
        let late = Instant::now().saturating_duration_since(action.deadline);
        if late > leeway {
            vlog!("bridge", "completion fired {} ms late", late.as_millis());
        }
        action.fire();
    }
}
