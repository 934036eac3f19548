//! Boundary sinks
//!
//! Terminators mark where one part of the call path hands over to the
//! next: client context to envoy, envoy to channel, server context to
//! object. They add no behavior to an ordinary call beyond the checks
//! that belong to that boundary.

use std::sync::{Arc, Weak};

use tracing::warn;

use super::{deliver, MessageControl, MessageSink};
use crate::error::RemotingError;
use crate::identity::ServerIdentity;
use crate::message::Message;

macro_rules! forward_next {
    ($name:literal) => {
        fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
            Some(self.next.clone())
        }

        fn name(&self) -> &'static str {
            $name
        }
    };
}

/// End of the client context chain; hands calls to the envoy chain
pub struct ClientContextTerminatorSink {
    next: Arc<dyn MessageSink>,
}

impl ClientContextTerminatorSink {
    pub fn new(envoy_chain: Arc<dyn MessageSink>) -> Self {
        Self { next: envoy_chain }
    }
}

impl MessageSink for ClientContextTerminatorSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        self.next.sync_process_message(msg)
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        self.next.async_process_message(msg, reply_sink)
    }

    forward_next!("ClientContextTerminatorSink");
}

/// End of the envoy chain; hands calls to the channel sink
pub struct EnvoyTerminatorSink {
    next: Arc<dyn MessageSink>,
}

impl EnvoyTerminatorSink {
    pub fn new(channel_sink: Arc<dyn MessageSink>) -> Self {
        Self { next: channel_sink }
    }
}

impl MessageSink for EnvoyTerminatorSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        self.next.sync_process_message(msg)
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        self.next.async_process_message(msg, reply_sink)
    }

    forward_next!("EnvoyTerminatorSink");
}

/// End of the server context chain
///
/// Only calls may enter a context; a reply arriving here is a fault.
pub struct ServerContextTerminatorSink {
    next: Arc<dyn MessageSink>,
}

impl ServerContextTerminatorSink {
    pub fn new(next: Arc<dyn MessageSink>) -> Self {
        Self { next }
    }
}

fn reject_reply() -> Message {
    Message::fault(RemotingError::InvalidMessage(
        "a reply cannot be dispatched into a server context".into(),
    ))
}

impl MessageSink for ServerContextTerminatorSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        if msg.is_return() {
            return reject_reply();
        }
        self.next.sync_process_message(msg)
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        if msg.is_return() {
            deliver(reply_sink.as_ref(), reject_reply());
            return None;
        }
        self.next.async_process_message(msg, reply_sink)
    }

    forward_next!("ServerContextTerminatorSink");
}

/// Guards the object end of a server chain
///
/// Calls to an identity that has been dropped or fully disconnected are
/// answered with a disconnected fault instead of reaching the object.
pub struct ServerObjectTerminatorSink {
    identity: Weak<ServerIdentity>,
    next: Arc<dyn MessageSink>,
}

impl ServerObjectTerminatorSink {
    pub fn new(identity: Weak<ServerIdentity>, next: Arc<dyn MessageSink>) -> Self {
        Self { identity, next }
    }

    fn disconnected(&self, msg: &Message) -> Option<Message> {
        let uri = msg.uri().unwrap_or_default().to_string();
        match self.identity.upgrade() {
            Some(identity) if !identity.is_fully_disconnected() => None,
            _ => {
                warn!(uri = %uri, "call to disconnected object");
                Some(Message::fault_for(msg, RemotingError::Disconnected(uri)))
            }
        }
    }
}

impl MessageSink for ServerObjectTerminatorSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        match self.disconnected(&msg) {
            Some(fault) => fault,
            None => self.next.sync_process_message(msg),
        }
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        if let Some(fault) = self.disconnected(&msg) {
            deliver(reply_sink.as_ref(), fault);
            return None;
        }
        self.next.async_process_message(msg, reply_sink)
    }

    forward_next!("ServerObjectTerminatorSink");
}
