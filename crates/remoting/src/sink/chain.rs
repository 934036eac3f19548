//! Chain construction and traversal

use std::sync::Arc;

use super::MessageSink;

/// Builds a sink chain bottom-up
///
/// The terminal sink is supplied first; every `wrap` puts a new sink in
/// front of the chain built so far.
pub struct SinkChainBuilder {
    head: Arc<dyn MessageSink>,
}

impl SinkChainBuilder {
    /// Start a chain from its terminal sink
    pub fn new(terminal: Arc<dyn MessageSink>) -> Self {
        Self { head: terminal }
    }

    /// Put a sink in front of the chain
    pub fn wrap<F>(self, make: F) -> Self
    where
        F: FnOnce(Arc<dyn MessageSink>) -> Arc<dyn MessageSink>,
    {
        Self {
            head: make(self.head),
        }
    }

    /// Put a sink in front of the chain when `condition` holds
    pub fn wrap_if<F>(self, condition: bool, make: F) -> Self
    where
        F: FnOnce(Arc<dyn MessageSink>) -> Arc<dyn MessageSink>,
    {
        if condition {
            self.wrap(make)
        } else {
            self
        }
    }

    /// Current head, without finishing the build
    pub fn head(&self) -> &Arc<dyn MessageSink> {
        &self.head
    }

    pub fn build(self) -> Arc<dyn MessageSink> {
        self.head
    }
}

/// Names of the sinks from `head` to the terminal sink
pub fn chain_names(head: &Arc<dyn MessageSink>) -> Vec<&'static str> {
    let mut names = vec![head.name()];
    let mut current = head.next_sink();
    while let Some(sink) = current {
        names.push(sink.name());
        current = sink.next_sink();
    }
    names
}
