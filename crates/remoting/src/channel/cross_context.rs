//! In-process channel
//!
//! Calls between contexts of the same domain never get serialized. The
//! channel only hands the call context over, so local data stays behind,
//! and enters the domain's dispatcher.

use std::sync::Arc;

use tracing::trace;

use super::Channel;
use crate::identity::split_url;
use crate::message::Message;
use crate::sink::{MessageControl, MessageSink};

/// URL scheme of the in-process channel
pub const CROSS_CONTEXT_SCHEME: &str = "xctx";

/// Channel reaching objects of one domain from any of its contexts
pub struct CrossContextChannel {
    domain: String,
    dispatcher: Arc<dyn MessageSink>,
}

impl CrossContextChannel {
    pub fn new(domain: impl Into<String>, dispatcher: Arc<dyn MessageSink>) -> Self {
        Self {
            domain: domain.into(),
            dispatcher,
        }
    }

    /// URL of `uri` on this channel
    pub fn url_for(&self, uri: &str) -> String {
        format!("{}://{}{}", CROSS_CONTEXT_SCHEME, self.domain, uri)
    }

    fn accepts(&self, url: &str) -> bool {
        match split_url(url) {
            (None, uri) => uri.starts_with('/'),
            (Some(channel), _) => {
                let expected = format!("{}://{}", CROSS_CONTEXT_SCHEME, self.domain);
                channel.eq_ignore_ascii_case(&expected)
            }
        }
    }
}

impl Channel for CrossContextChannel {
    fn name(&self) -> &str {
        CROSS_CONTEXT_SCHEME
    }

    fn priority(&self) -> i32 {
        // Local delivery wins over any transport.
        100
    }

    fn create_message_sink(&self, url: &str) -> Option<Arc<dyn MessageSink>> {
        self.accepts(url).then(|| {
            Arc::new(CrossContextChannelSink {
                dispatcher: self.dispatcher.clone(),
            }) as Arc<dyn MessageSink>
        })
    }
}

/// Channel sink handing calls to the domain dispatcher
pub struct CrossContextChannelSink {
    dispatcher: Arc<dyn MessageSink>,
}

fn hand_over(mut msg: Message) -> Message {
    let ctx = msg.call_context().clone_for_handoff();
    *msg.call_context_mut() = ctx;
    msg
}

impl MessageSink for CrossContextChannelSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        trace!(uri = ?msg.uri(), "cross-context call");
        hand_over(self.dispatcher.sync_process_message(hand_over(msg)))
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        trace!(uri = ?msg.uri(), one_way = reply_sink.is_none(), "cross-context async call");
        self.dispatcher.async_process_message(hand_over(msg), reply_sink)
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        Some(self.dispatcher.clone())
    }

    fn name(&self) -> &'static str {
        "CrossContextChannelSink"
    }
}
