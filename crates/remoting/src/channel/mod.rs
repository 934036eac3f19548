//! Channels
//!
//! A channel turns an object URL into the message sink that carries calls
//! to it. Below the message level, transports are chains of channel sinks
//! that work on serialized requests:
//!
//! ```text
//!   client:  message sink ─► ClientFormatterSink ─► [channel sinks] ─► transport
//!                                                                         │
//!   server:  dispatcher ◄── ServerFormatterSink ◄── [channel sinks] ◄─────┘
//! ```
//!
//! Channel sinks that finish asynchronously keep their per-call state on a
//! [`ClientSinkStack`] or [`ServerSinkStack`] instead of the native stack.

mod cross_context;
mod formatter;
mod sink_stack;

pub use cross_context::{CrossContextChannel, CrossContextChannelSink, CROSS_CONTEXT_SCHEME};
pub use formatter::{ClientFormatterSink, Formatter, ServerFormatterSink};
pub use sink_stack::{ClientSinkStack, ServerResponder, ServerSinkStack, ServerStackReplySink};

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{RemotingError, Result};
use crate::message::Message;
use crate::sink::MessageSink;

/// Per-sink state kept on a sink stack
pub type SinkState = Box<dyn Any + Send>;

/// Transport-level headers travelling with a serialized message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportHeaders {
    headers: HashMap<String, String>,
}

impl TransportHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// A request or response as seen by channel sinks
///
/// Sinks above the formatter see the message; sinks below it see the
/// serialized stream. Either may be absent at a given point.
#[derive(Debug, Default)]
pub struct ChannelMessage {
    pub message: Option<Message>,
    pub headers: TransportHeaders,
    pub stream: Option<Bytes>,
}

impl ChannelMessage {
    pub fn from_message(message: Message) -> Self {
        Self {
            message: Some(message),
            ..Default::default()
        }
    }

    pub fn from_stream(stream: Bytes, headers: TransportHeaders) -> Self {
        Self {
            message: None,
            headers,
            stream: Some(stream),
        }
    }
}

/// How the server side handled a request
#[derive(Debug)]
pub enum ServerProcessing {
    /// The response is ready
    Complete(ChannelMessage),
    /// No response will be produced
    OneWay,
    /// The response will arrive later through the sink stack
    Async,
}

/// Server-side channel sink
pub trait ServerChannelSink: Send + Sync {
    /// Process a request coming up from the transport
    fn process_message(&self, stack: &Arc<ServerSinkStack>, request: ChannelMessage) -> Result<ServerProcessing>;

    /// Handle a response that completed asynchronously
    fn async_process_response(
        &self,
        stack: &Arc<ServerSinkStack>,
        state: Option<SinkState>,
        response: ChannelMessage,
    ) -> Result<()>;

    /// Stream the response should be written to, if this sink provides one
    fn get_response_stream(
        &self,
        _stack: &Arc<ServerSinkStack>,
        _state: Option<&SinkState>,
        _response: &ChannelMessage,
    ) -> Option<Bytes> {
        None
    }

    fn next_channel_sink(&self) -> Option<Arc<dyn ServerChannelSink>>;

    fn name(&self) -> &'static str;
}

/// Client-side channel sink
pub trait ClientChannelSink: Send + Sync {
    /// Send a request and wait for the response
    fn process_message(&self, request: ChannelMessage) -> Result<ChannelMessage>;

    /// Send a request; the response comes back through `stack`
    fn async_process_request(&self, stack: &Arc<ClientSinkStack>, request: ChannelMessage) -> Result<()>;

    /// Handle a response travelling back up
    fn async_process_response(
        &self,
        stack: &Arc<ClientSinkStack>,
        state: Option<SinkState>,
        response: ChannelMessage,
    ) -> Result<()>;

    fn next_channel_sink(&self) -> Option<Arc<dyn ClientChannelSink>>;

    fn name(&self) -> &'static str;
}

/// A channel able to reach objects by URL
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Channels with a higher priority are asked first
    fn priority(&self) -> i32 {
        0
    }

    /// Message sink reaching `url`, or `None` if the URL is not ours
    fn create_message_sink(&self, url: &str) -> Option<Arc<dyn MessageSink>>;
}

/// Registered channels of a domain
#[derive(Default)]
pub struct ChannelServices {
    channels: RwLock<Vec<Arc<dyn Channel>>>,
}

impl ChannelServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let mut channels = self.channels.write();
        if channels.iter().any(|c| c.name() == channel.name()) {
            return Err(RemotingError::ChannelAlreadyRegistered(channel.name().to_string()));
        }
        info!(channel = channel.name(), priority = channel.priority(), "channel registered");
        channels.push(channel);
        channels.sort_by_key(|c| std::cmp::Reverse(c.priority()));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|c| c.name() != name);
        before != channels.len()
    }

    /// Names in the order channels are asked
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().iter().map(|c| c.name().to_string()).collect()
    }

    /// Message sink from the first channel that accepts `url`
    pub fn create_message_sink(&self, url: &str) -> Result<Arc<dyn MessageSink>> {
        let channels = self.channels.read().clone();
        for channel in channels {
            if let Some(sink) = channel.create_message_sink(url) {
                debug!(channel = channel.name(), url = %url, "channel sink created");
                return Ok(sink);
            }
        }
        Err(RemotingError::NoChannelSink(url.to_string()))
    }
}
