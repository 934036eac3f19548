//! Pending results of asynchronous proxy calls
//!
//! An [`AsyncResult`] is handed out by `begin_invoke`. The reply arrives on
//! some worker thread through an [`AsyncReplySink`]; the caller can block
//! on it, poll it, await it, or register a callback.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{RemotingError, Result};
use crate::message::{Message, MethodDescriptor, ReturnMessage};
use crate::sink::{MessageControl, MessageSink};

/// Runs once when the call completes
pub type AsyncCallback = Box<dyn FnOnce(&Arc<AsyncResult>) + Send>;

#[derive(Default)]
struct AsyncState {
    reply: Option<ReturnMessage>,
    completed: bool,
    ended: bool,
    callback: Option<AsyncCallback>,
    control: Option<Arc<dyn MessageControl>>,
}

/// Completion signal and reply slot of one asynchronous call
pub struct AsyncResult {
    method: MethodDescriptor,
    state: Mutex<AsyncState>,
    done: Condvar,
    notify: Notify,
    self_ref: Weak<AsyncResult>,
}

impl AsyncResult {
    pub(crate) fn new(method: MethodDescriptor, callback: Option<AsyncCallback>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            method,
            state: Mutex::new(AsyncState {
                callback,
                ..Default::default()
            }),
            done: Condvar::new(),
            notify: Notify::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Method the call was made to
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Block until the call completes
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !state.completed {
            self.done.wait(&mut state);
        }
    }

    /// Block until the call completes or `timeout` passes. Returns whether
    /// it completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.completed {
            self.done.wait_while_for(&mut state, |s| !s.completed, timeout);
        }
        state.completed
    }

    /// Resolves once the call completes
    pub async fn completed(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.is_completed() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel the call
    ///
    /// A call that has not started yet never runs. One already running
    /// finishes, but its reply is discarded. Either way the result completes
    /// with a cancellation fault.
    pub fn cancel(&self) -> bool {
        let control = self.state.lock().control.clone();
        if let Some(control) = control {
            control.cancel();
        }
        let cancelled = self.complete(ReturnMessage::fault(RemotingError::Cancelled, Default::default()));
        if cancelled {
            debug!(method = %self.method.name(), "async call cancelled");
        }
        cancelled
    }

    pub(crate) fn set_control(&self, control: Option<Arc<dyn MessageControl>>) {
        let mut state = self.state.lock();
        if !state.completed {
            state.control = control;
        }
    }

    /// Record the reply. Only the first reply counts.
    pub(crate) fn complete(&self, reply: ReturnMessage) -> bool {
        let callback = {
            let mut state = self.state.lock();
            if state.completed {
                trace!(method = %self.method.name(), "late reply discarded");
                return false;
            }
            state.completed = true;
            state.reply = Some(reply);
            state.control = None;
            state.callback.take()
        };
        self.done.notify_all();
        self.notify.notify_waiters();

        if let (Some(callback), Some(this)) = (callback, self.self_ref.upgrade()) {
            callback(&this);
        }
        true
    }

    /// Wait for the reply and take it. A result can be ended once.
    pub(crate) fn take_reply(&self) -> Result<ReturnMessage> {
        let mut state = self.state.lock();
        while !state.completed {
            self.done.wait(&mut state);
        }
        if state.ended {
            return Err(RemotingError::AlreadyEnded);
        }
        state.ended = true;
        state.reply.take().ok_or(RemotingError::AlreadyEnded)
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncResult")
            .field("method", &self.method.name())
            .field("completed", &state.completed)
            .field("ended", &state.ended)
            .finish()
    }
}

/// Reply sink completing an [`AsyncResult`]
pub struct AsyncReplySink {
    result: Arc<AsyncResult>,
}

impl AsyncReplySink {
    pub fn new(result: Arc<AsyncResult>) -> Self {
        Self { result }
    }
}

impl MessageSink for AsyncReplySink {
    fn sync_process_message(&self, msg: Message) -> Message {
        self.result.complete(msg.clone().into_return());
        msg
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        let msg = self.sync_process_message(msg);
        crate::sink::deliver(reply_sink.as_ref(), msg);
        None
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        None
    }

    fn name(&self) -> &'static str {
        "AsyncReplySink"
    }
}
