//! Dynamic (cross-cutting) sinks
//!
//! Dynamic sinks are observers registered at runtime on a context or on an
//! identity. They never change the call; they are told when it starts and
//! when its reply comes back, once each, with the same side flag both times.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::{MessageControl, MessageSink};
use crate::message::Message;

/// Observer notified at the start and finish of every call
pub trait DynamicMessageSink: Send + Sync {
    fn process_message_start(&self, msg: &Message, client_side: bool, is_async: bool);
    fn process_message_finish(&self, reply: &Message, client_side: bool, is_async: bool);
}

type Entries = Vec<(String, Arc<dyn DynamicMessageSink>)>;

/// Named set of dynamic sinks
///
/// Mutators build a new array and swap it in, so a snapshot taken by a
/// call in flight is never seen half-grown.
#[derive(Default)]
pub struct DynamicSinkSet {
    entries: RwLock<Arc<Entries>>,
}

impl DynamicSinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink. Returns false if the name is taken.
    pub fn register(&self, name: impl Into<String>, sink: Arc<dyn DynamicMessageSink>) -> bool {
        let name = name.into();
        let mut entries = self.entries.write();
        if entries.iter().any(|(n, _)| *n == name) {
            return false;
        }
        let mut grown = Entries::with_capacity(entries.len() + 1);
        grown.extend(entries.iter().cloned());
        grown.push((name, sink));
        *entries = Arc::new(grown);
        true
    }

    /// Remove a sink by name. Returns false if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        if !entries.iter().any(|(n, _)| n == name) {
            return false;
        }
        let shrunk: Entries = entries.iter().filter(|(n, _)| n != name).cloned().collect();
        *entries = Arc::new(shrunk);
        true
    }

    /// Current sinks
    pub fn snapshot(&self) -> Arc<Entries> {
        self.entries.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

fn notify_start(sinks: &[Arc<dyn DynamicMessageSink>], msg: &Message, client_side: bool, is_async: bool) {
    for sink in sinks {
        sink.process_message_start(msg, client_side, is_async);
    }
}

fn notify_finish(sinks: &[Arc<dyn DynamicMessageSink>], reply: &Message, client_side: bool, is_async: bool) {
    for sink in sinks {
        sink.process_message_finish(reply, client_side, is_async);
    }
}

/// Sink that notifies the dynamic sinks of one or more sets
pub struct DynamicNotifySink {
    sources: Vec<Arc<DynamicSinkSet>>,
    client_side: bool,
    next: Arc<dyn MessageSink>,
}

impl DynamicNotifySink {
    pub fn new(sources: Vec<Arc<DynamicSinkSet>>, client_side: bool, next: Arc<dyn MessageSink>) -> Self {
        Self {
            sources,
            client_side,
            next,
        }
    }

    /// Whether any source currently has sinks
    pub fn has_sinks(&self) -> bool {
        self.sources.iter().any(|s| !s.is_empty())
    }

    fn collect(&self) -> Vec<Arc<dyn DynamicMessageSink>> {
        self.sources
            .iter()
            .flat_map(|set| set.snapshot().iter().map(|(_, s)| s.clone()).collect::<Vec<_>>())
            .collect()
    }
}

impl MessageSink for DynamicNotifySink {
    fn sync_process_message(&self, msg: Message) -> Message {
        let sinks = self.collect();
        if sinks.is_empty() {
            return self.next.sync_process_message(msg);
        }
        trace!(count = sinks.len(), client_side = self.client_side, "dynamic sinks: start");
        notify_start(&sinks, &msg, self.client_side, false);
        let reply = self.next.sync_process_message(msg);
        notify_finish(&sinks, &reply, self.client_side, false);
        reply
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        let sinks = self.collect();
        if sinks.is_empty() {
            return self.next.async_process_message(msg, reply_sink);
        }
        notify_start(&sinks, &msg, self.client_side, true);
        // One-way calls have no reply sink and so never reach finish.
        let reply_sink = reply_sink.map(|next| -> Arc<dyn MessageSink> {
            Arc::new(DynamicReplySink {
                sinks,
                client_side: self.client_side,
                next,
            })
        });
        self.next.async_process_message(msg, reply_sink)
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        Some(self.next.clone())
    }

    fn name(&self) -> &'static str {
        "DynamicNotifySink"
    }
}

/// Reply-path half of [`DynamicNotifySink`] for async calls
struct DynamicReplySink {
    sinks: Vec<Arc<dyn DynamicMessageSink>>,
    client_side: bool,
    next: Arc<dyn MessageSink>,
}

impl MessageSink for DynamicReplySink {
    fn sync_process_message(&self, msg: Message) -> Message {
        notify_finish(&self.sinks, &msg, self.client_side, true);
        self.next.sync_process_message(msg)
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        let reply = self.sync_process_message(msg);
        super::deliver(reply_sink.as_ref(), reply);
        None
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        Some(self.next.clone())
    }

    fn name(&self) -> &'static str {
        "DynamicReplySink"
    }
}
