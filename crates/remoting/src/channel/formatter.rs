//! Formatter sinks
//!
//! The formatter is where the message level meets the channel level. The
//! client formatter is both the last message sink of a proxy and the first
//! channel sink of the transport; the server formatter is the last channel
//! sink before dispatch.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{debug, trace};

use super::{
    ChannelMessage, ClientChannelSink, ClientSinkStack, ServerChannelSink, ServerProcessing, ServerSinkStack,
    SinkState, TransportHeaders,
};
use crate::error::{RemotingError, Result};
use crate::message::Message;
use crate::sink::{deliver, MessageControl, MessageSink};

/// Serialization of messages to and from a byte stream
///
/// A round trip must keep the target, the method, the arguments and the
/// logical call context.
pub trait Formatter: Send + Sync {
    fn serialize_message(&self, msg: &Message, headers: &mut TransportHeaders) -> Result<Bytes>;

    fn deserialize_message(&self, stream: &Bytes, headers: &TransportHeaders) -> Result<Message>;
}

fn stream_of(response: &ChannelMessage) -> Result<&Bytes> {
    response
        .stream
        .as_ref()
        .ok_or_else(|| RemotingError::Formatter("response carries no stream".into()))
}

/// Client-side formatter: message sink on top, channel sink below
pub struct ClientFormatterSink {
    formatter: Arc<dyn Formatter>,
    next: Arc<dyn ClientChannelSink>,
    self_ref: Weak<ClientFormatterSink>,
}

impl ClientFormatterSink {
    pub fn new(formatter: Arc<dyn Formatter>, next: Arc<dyn ClientChannelSink>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            formatter,
            next,
            self_ref: self_ref.clone(),
        })
    }

    fn request(&self, msg: &Message) -> Result<ChannelMessage> {
        let mut headers = TransportHeaders::new();
        let stream = self.formatter.serialize_message(msg, &mut headers)?;
        trace!(bytes = stream.len(), "request serialized");
        Ok(ChannelMessage::from_stream(stream, headers))
    }

    fn round_trip(&self, msg: &Message) -> Result<Message> {
        let response = self.next.process_message(self.request(msg)?)?;
        self.formatter.deserialize_message(stream_of(&response)?, &response.headers)
    }

    fn send_async(&self, msg: &Message, reply_sink: Option<Arc<dyn MessageSink>>) -> Result<()> {
        let one_way = reply_sink.is_none();
        let stack = ClientSinkStack::new(reply_sink);
        if !one_way {
            if let Some(this) = self.self_ref.upgrade() {
                stack.push(this, None);
            }
        }
        let request = self.request(msg);
        match request {
            Ok(request) => self.next.async_process_request(&stack, request),
            Err(e) => {
                stack.dispatch_exception(e);
                Ok(())
            }
        }
    }
}

impl MessageSink for ClientFormatterSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        match self.round_trip(&msg) {
            Ok(reply) => reply,
            Err(e) => Message::fault_for(&msg, e),
        }
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        if let Err(e) = self.send_async(&msg, reply_sink.clone()) {
            debug!(error = %e, "async request failed");
            deliver(reply_sink.as_ref(), Message::fault_for(&msg, e));
        }
        None
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        None
    }

    fn name(&self) -> &'static str {
        "ClientFormatterSink"
    }
}

impl ClientChannelSink for ClientFormatterSink {
    fn process_message(&self, request: ChannelMessage) -> Result<ChannelMessage> {
        let msg = request
            .message
            .ok_or_else(|| RemotingError::InvalidMessage("formatter needs a message".into()))?;
        Ok(ChannelMessage::from_message(self.round_trip(&msg)?))
    }

    fn async_process_request(&self, _stack: &Arc<ClientSinkStack>, _request: ChannelMessage) -> Result<()> {
        Err(RemotingError::InvalidMessage(
            "the client formatter is the first channel sink".into(),
        ))
    }

    fn async_process_response(
        &self,
        stack: &Arc<ClientSinkStack>,
        _state: Option<SinkState>,
        response: ChannelMessage,
    ) -> Result<()> {
        let reply = stream_of(&response)
            .and_then(|stream| self.formatter.deserialize_message(stream, &response.headers));
        match reply {
            Ok(reply) => stack.dispatch_reply_message(reply),
            Err(e) => stack.dispatch_exception(e),
        }
        Ok(())
    }

    fn next_channel_sink(&self) -> Option<Arc<dyn ClientChannelSink>> {
        Some(self.next.clone())
    }

    fn name(&self) -> &'static str {
        "ClientFormatterSink"
    }
}

/// Server-side formatter: deserializes requests and dispatches them
///
/// With `asynchronous` set, two-way calls are dispatched through the sink
/// stack and answered later; otherwise the dispatch blocks for the reply.
pub struct ServerFormatterSink {
    formatter: Arc<dyn Formatter>,
    dispatcher: Arc<dyn MessageSink>,
    asynchronous: bool,
    self_ref: Weak<ServerFormatterSink>,
}

impl ServerFormatterSink {
    pub fn new(formatter: Arc<dyn Formatter>, dispatcher: Arc<dyn MessageSink>) -> Arc<Self> {
        Self::build(formatter, dispatcher, false)
    }

    pub fn asynchronous(formatter: Arc<dyn Formatter>, dispatcher: Arc<dyn MessageSink>) -> Arc<Self> {
        Self::build(formatter, dispatcher, true)
    }

    fn build(formatter: Arc<dyn Formatter>, dispatcher: Arc<dyn MessageSink>, asynchronous: bool) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            formatter,
            dispatcher,
            asynchronous,
            self_ref: self_ref.clone(),
        })
    }

    fn response(&self, reply: Message) -> Result<ChannelMessage> {
        let mut headers = TransportHeaders::new();
        let stream = self.formatter.serialize_message(&reply, &mut headers)?;
        Ok(ChannelMessage {
            message: Some(reply),
            headers,
            stream: Some(stream),
        })
    }
}

impl ServerChannelSink for ServerFormatterSink {
    fn process_message(&self, stack: &Arc<ServerSinkStack>, request: ChannelMessage) -> Result<ServerProcessing> {
        let msg = match request.message {
            Some(msg) => msg,
            None => {
                let stream = request
                    .stream
                    .as_ref()
                    .ok_or_else(|| RemotingError::Formatter("request carries no stream".into()))?;
                self.formatter.deserialize_message(stream, &request.headers)?
            }
        };

        if msg.is_one_way() {
            self.dispatcher.async_process_message(msg, None);
            return Ok(ServerProcessing::OneWay);
        }

        match self.self_ref.upgrade() {
            Some(this) if self.asynchronous => {
                let this: Arc<dyn ServerChannelSink> = this;
                stack.push(this.clone(), None);
                stack.set_pending_dispatch(msg, self.dispatcher.clone());
                stack.store_and_dispatch(&this, None)?;
                Ok(ServerProcessing::Async)
            }
            _ => {
                let reply = self.dispatcher.sync_process_message(msg);
                Ok(ServerProcessing::Complete(self.response(reply)?))
            }
        }
    }

    fn async_process_response(
        &self,
        stack: &Arc<ServerSinkStack>,
        _state: Option<SinkState>,
        response: ChannelMessage,
    ) -> Result<()> {
        let reply = response
            .message
            .ok_or_else(|| RemotingError::InvalidMessage("async response carries no message".into()))?;
        stack.async_process_response(self.response(reply)?)
    }

    fn next_channel_sink(&self) -> Option<Arc<dyn ServerChannelSink>> {
        None
    }

    fn name(&self) -> &'static str {
        "ServerFormatterSink"
    }
}
