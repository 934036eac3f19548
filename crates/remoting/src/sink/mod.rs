//! Message sink chains
//!
//! Every interception point on the call path is a [`MessageSink`]. Sinks
//! form singly linked chains built bottom-up by [`SinkChainBuilder`]: the
//! terminal sink first, then each interceptor wrapping the chain so far.
//!
//! ```text
//!   proxy ──► [context sinks] ──► DynamicNotifySink ──► terminator ──► channel
//!                                                              │
//!   server ◄── StackBuilderSink ◄── ObjectTerminator ◄── LeaseSink ◄──┘
//! ```
//!
//! Contract:
//! - `sync_process_message` always returns a reply (a value or a fault)
//! - `async_process_message` arranges for the reply sink to receive the
//!   reply exactly once, later and possibly on another thread; one-way
//!   calls pass no reply sink and get no reply
//! - terminal sinks have no `next_sink` and turn invocation failures into
//!   fault replies

mod chain;
mod dynamic;
mod stack_builder;
mod terminator;

pub use chain::*;
pub use dynamic::*;
pub use stack_builder::*;
pub use terminator::*;

#[cfg(test)]
pub(crate) use chain::tests as testing;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::message::Message;

/// Call interception capability
pub trait MessageSink: Send + Sync {
    /// Process a call and block for its reply
    fn sync_process_message(&self, msg: Message) -> Message;

    /// Start a call; the reply (if any) goes to `reply_sink`
    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>>;

    /// Next link in the chain, `None` for terminal sinks
    fn next_sink(&self) -> Option<Arc<dyn MessageSink>>;

    /// Short name, for chain traversal and logging
    fn name(&self) -> &'static str;
}

/// Handle on an in-flight asynchronous call
pub trait MessageControl: Send + Sync {
    /// Best-effort cancel; does nothing once the call has started or finished
    fn cancel(&self);
}

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Default [`MessageControl`] used by sinks that queue work
#[derive(Debug, Default)]
pub struct CallControl {
    state: AtomicU8,
}

impl CallControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark the call as started. Returns false if it was cancelled first.
    pub fn begin(&self) -> bool {
        self.state
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == STARTED
    }
}

impl MessageControl for CallControl {
    fn cancel(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Deliver `reply` to `reply_sink`, if there is one
pub(crate) fn deliver(reply_sink: Option<&Arc<dyn MessageSink>>, reply: Message) {
    if let Some(sink) = reply_sink {
        sink.sync_process_message(reply);
    }
}
