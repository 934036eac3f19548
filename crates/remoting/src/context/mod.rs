//! Contexts
//!
//! A [`Context`] groups objects that share call-interception policy. Each
//! context property may contribute sinks to three chains:
//!
//! - client side: calls leaving the context
//! - server side: calls entering the context
//! - envoy: calls from elsewhere to objects published from the context,
//!   applied on the caller's side before the channel
//!
//! Objects published without a context live in the domain's default
//! context, which has no properties.

mod synchronization;

pub use synchronization::{SynchronizationProperty, SynchronizedSink};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::sink::{DynamicMessageSink, DynamicSinkSet, MessageSink};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Context identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Which chain a property is asked to contribute to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Client,
    Server,
    Envoy,
}

/// Policy attached to a context
pub trait ContextProperty: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this property adds a sink to the `kind` chain
    fn contributes(&self, _kind: SinkKind) -> bool {
        false
    }

    /// Wrap `next` with this property's sink for the `kind` chain
    fn create_sink(&self, _kind: SinkKind, next: Arc<dyn MessageSink>) -> Arc<dyn MessageSink> {
        next
    }
}

/// A set of objects sharing context properties
pub struct Context {
    id: ContextId,
    properties: Vec<Arc<dyn ContextProperty>>,
    dynamic_sinks: Arc<DynamicSinkSet>,
}

impl Context {
    /// Create a context with the given properties
    pub fn new(properties: Vec<Arc<dyn ContextProperty>>) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            properties,
            dynamic_sinks: Arc::new(DynamicSinkSet::new()),
        })
    }

    /// Create a context with no properties
    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn properties(&self) -> &[Arc<dyn ContextProperty>] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<Arc<dyn ContextProperty>> {
        self.properties.iter().find(|p| p.name() == name).cloned()
    }

    /// Whether any property contributes to the `kind` chain
    pub fn contributes(&self, kind: SinkKind) -> bool {
        self.properties.iter().any(|p| p.contributes(kind))
    }

    /// Put the contributed sinks of `kind` in front of `terminal`
    ///
    /// The first property ends up outermost.
    pub fn wrap(&self, kind: SinkKind, terminal: Arc<dyn MessageSink>) -> Arc<dyn MessageSink> {
        self.properties
            .iter()
            .rev()
            .filter(|p| p.contributes(kind))
            .fold(terminal, |next, p| p.create_sink(kind, next))
    }

    /// Dynamic sinks observing every call into or out of this context
    pub fn dynamic_sinks(&self) -> &Arc<DynamicSinkSet> {
        &self.dynamic_sinks
    }

    pub fn register_dynamic_sink(&self, name: impl Into<String>, sink: Arc<dyn DynamicMessageSink>) -> bool {
        self.dynamic_sinks.register(name, sink)
    }

    pub fn unregister_dynamic_sink(&self, name: &str) -> bool {
        self.dynamic_sinks.unregister(name)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.properties.iter().map(|p| p.name()).collect();
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("properties", &names)
            .field("dynamic_sinks", &self.dynamic_sinks.len())
            .finish()
    }
}
