//! Renew-on-call sink

use std::sync::{Arc, Weak};

use tracing::trace;

use crate::identity::ServerIdentity;
use crate::message::Message;
use crate::sink::{MessageControl, MessageSink};

/// Server-side sink extending the target's lease on every incoming call
pub struct LeaseSink {
    identity: Weak<ServerIdentity>,
    next: Arc<dyn MessageSink>,
}

impl LeaseSink {
    pub fn new(identity: Weak<ServerIdentity>, next: Arc<dyn MessageSink>) -> Self {
        Self { identity, next }
    }

    fn renew(&self) {
        // The lease can be replaced after expiry, so look it up per call.
        if let Some(lease) = self.identity.upgrade().and_then(|id| id.lease()) {
            trace!(lease = lease.id(), "renew on call");
            lease.renew_on_call();
        }
    }
}

impl MessageSink for LeaseSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        self.renew();
        self.next.sync_process_message(msg)
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        self.renew();
        self.next.async_process_message(msg, reply_sink)
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        Some(self.next.clone())
    }

    fn name(&self) -> &'static str {
        "LeaseSink"
    }
}
