//! Identities
//!
//! Every remotely reachable object, and every proxy, has exactly one
//! [`Identity`]. Server-side objects additionally get a [`ServerIdentity`]
//! that owns the dispatch chain to the object.
//!
//! # Server identity states
//!
//! ```text
//!   Unregistered ──publish──► Connected ──lease expiry──► FullyDisconnected
//!                                 │      (URI kept, object held weakly)
//!                                 │                              │
//!                                 │            re-publish of the same object
//!                                 │                              ▼
//!                                 │                          Connected
//!                                 │
//!                                 └──disconnect──► FullyDisconnected
//!                                                  (URI cleared, removed)
//! ```

mod table;
mod uri;

pub use table::IdentityTable;
pub use uri::{generate_uri, split_url, table_key};

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::activation::ObjectFactory;
use crate::context::Context;
use crate::error::{RemotingError, Result};
use crate::lease::Lease;
use crate::object::RemoteObject;
use crate::sink::{DynamicMessageSink, DynamicSinkSet, MessageSink};

/// Identity flags
pub mod flags {
    /// Published under a caller-chosen URI
    pub const WELL_KNOWN: u32 = 0x01;
    /// Bound to a non-default context
    pub const CONTEXT_BOUND: u32 = 0x02;
    /// Proxy-side identity
    pub const CLIENT: u32 = 0x04;
    /// No longer reachable through the URI table
    pub const DISCONNECTED_REMOTE: u32 = 0x08;
    /// Detached from its object
    pub const DISCONNECTED_FULL: u32 = 0x10;
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum UriSlot {
    Unassigned,
    Assigned(String),
    Cleared,
}

/// Canonical record for a remotely reachable object or a proxy
pub struct Identity {
    uri: Mutex<UriSlot>,
    url: Option<String>,
    flags: AtomicU32,
    channel_sink: OnceLock<Arc<dyn MessageSink>>,
    envoy_chain: OnceLock<Arc<dyn MessageSink>>,
    dynamic_sinks: Arc<DynamicSinkSet>,
}

impl Identity {
    /// Identity with no URI yet
    pub fn new() -> Self {
        Self {
            uri: Mutex::new(UriSlot::Unassigned),
            url: None,
            flags: AtomicU32::new(0),
            channel_sink: OnceLock::new(),
            envoy_chain: OnceLock::new(),
            dynamic_sinks: Arc::new(DynamicSinkSet::new()),
        }
    }

    /// Proxy-side identity for the object at `uri`, reached through `url`
    pub fn client(url: impl Into<String>, uri: impl Into<String>) -> Self {
        let mut identity = Self::new();
        identity.url = Some(url.into());
        *identity.uri.get_mut() = UriSlot::Assigned(uri.into());
        identity.flags = AtomicU32::new(flags::CLIENT);
        identity
    }

    pub fn uri(&self) -> Option<String> {
        match &*self.uri.lock() {
            UriSlot::Assigned(uri) => Some(uri.clone()),
            _ => None,
        }
    }

    /// Assign the URI. An identity gets a URI at most once.
    pub fn set_uri(&self, uri: impl Into<String>) -> Result<()> {
        let uri = uri.into();
        let mut slot = self.uri.lock();
        match &*slot {
            UriSlot::Unassigned => {
                debug!(uri = %uri, "identity URI assigned");
                *slot = UriSlot::Assigned(uri);
                Ok(())
            }
            UriSlot::Assigned(current) => Err(RemotingError::UriAlreadyAssigned {
                current: current.clone(),
                requested: uri,
            }),
            UriSlot::Cleared => Err(RemotingError::Disconnected(uri)),
        }
    }

    /// The URI, generated with `make` if none was assigned yet
    pub(crate) fn ensure_uri(&self, make: impl FnOnce() -> String) -> Result<String> {
        let mut slot = self.uri.lock();
        match &*slot {
            UriSlot::Assigned(uri) => Ok(uri.clone()),
            UriSlot::Unassigned => {
                let uri = make();
                *slot = UriSlot::Assigned(uri.clone());
                Ok(uri)
            }
            UriSlot::Cleared => Err(RemotingError::Disconnected("<cleared>".into())),
        }
    }

    pub(crate) fn clear_uri(&self) {
        *self.uri.lock() = UriSlot::Cleared;
    }

    /// Channel URL this proxy-side identity connects through
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag == flag
    }

    pub(crate) fn set_flags(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    pub fn channel_sink(&self) -> Option<Arc<dyn MessageSink>> {
        self.channel_sink.get().cloned()
    }

    /// Install the channel sink unless one is set; returns the one in use
    pub(crate) fn set_channel_sink(&self, sink: Arc<dyn MessageSink>) -> Arc<dyn MessageSink> {
        self.channel_sink.get_or_init(|| sink).clone()
    }

    pub fn envoy_chain(&self) -> Option<Arc<dyn MessageSink>> {
        self.envoy_chain.get().cloned()
    }

    /// Install the envoy chain unless one is set; returns the one in use
    pub(crate) fn set_envoy_chain(&self, chain: Arc<dyn MessageSink>) -> Arc<dyn MessageSink> {
        self.envoy_chain.get_or_init(|| chain).clone()
    }

    pub fn dynamic_sinks(&self) -> &Arc<DynamicSinkSet> {
        &self.dynamic_sinks
    }

    /// Observe every call made through or to this identity
    pub fn register_dynamic_sink(&self, name: impl Into<String>, sink: Arc<dyn DynamicMessageSink>) -> bool {
        self.dynamic_sinks.register(name, sink)
    }

    pub fn unregister_dynamic_sink(&self, name: &str) -> bool {
        self.dynamic_sinks.unregister(name)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("uri", &*self.uri.lock())
            .field("url", &self.url)
            .field("flags", &self.flags())
            .finish()
    }
}

/// How a well-known service creates its target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WellKnownMode {
    /// One instance serves every call; recreated after its lease expires
    Singleton,
    /// A fresh instance per call, never leased
    SingleCall,
}

/// Server identity lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Unregistered,
    Connected,
    RemoteDisconnected,
    FullyDisconnected,
}

pub(crate) enum Target {
    Instance(Arc<dyn RemoteObject>),
    /// Kept after lease expiry so the same object can be published again
    Retained(Weak<dyn RemoteObject>),
    Singleton {
        factory: ObjectFactory,
        instance: Option<Arc<dyn RemoteObject>>,
    },
    SingleCall(ObjectFactory),
    Detached,
}

/// Resolved call target
pub(crate) struct ResolvedTarget {
    pub object: Arc<dyn RemoteObject>,
    /// A singleton instance was created for this call
    pub created: bool,
}

/// Identity of a published server object
pub struct ServerIdentity {
    identity: Identity,
    type_name: String,
    context: Arc<Context>,
    mode: Option<WellKnownMode>,
    state: Mutex<ServerState>,
    lease: RwLock<Option<Arc<Lease>>>,
    server_chain: OnceLock<Arc<dyn MessageSink>>,
    target: Mutex<Target>,
    object_key: Option<usize>,
}

/// Table key of a published object instance
pub(crate) fn object_key(object: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

impl ServerIdentity {
    /// Identity for a published object instance
    pub(crate) fn for_instance(object: Arc<dyn RemoteObject>, context: Arc<Context>) -> Self {
        let key = object_key(&object);
        Self {
            identity: Identity::new(),
            type_name: object.type_name().to_string(),
            context,
            mode: None,
            state: Mutex::new(ServerState::Unregistered),
            lease: RwLock::new(None),
            server_chain: OnceLock::new(),
            target: Mutex::new(Target::Instance(object)),
            object_key: Some(key),
        }
    }

    /// Identity for a well-known service created on demand
    pub(crate) fn well_known(
        type_name: impl Into<String>,
        factory: ObjectFactory,
        mode: WellKnownMode,
        context: Arc<Context>,
    ) -> Self {
        let target = match mode {
            WellKnownMode::Singleton => Target::Singleton {
                factory,
                instance: None,
            },
            WellKnownMode::SingleCall => Target::SingleCall(factory),
        };
        let identity = Identity::new();
        identity.set_flags(flags::WELL_KNOWN);
        Self {
            identity,
            type_name: type_name.into(),
            context,
            mode: Some(mode),
            state: Mutex::new(ServerState::Unregistered),
            lease: RwLock::new(None),
            server_chain: OnceLock::new(),
            target: Mutex::new(target),
            object_key: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn uri(&self) -> Option<String> {
        self.identity.uri()
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn mode(&self) -> Option<WellKnownMode> {
        self.mode
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn is_fully_disconnected(&self) -> bool {
        self.state() == ServerState::FullyDisconnected
    }

    pub(crate) fn object_key(&self) -> Option<usize> {
        self.object_key
    }

    pub(crate) fn set_state(&self, state: ServerState) {
        let mut current = self.state.lock();
        match state {
            ServerState::Connected => self
                .identity
                .clear_flags(flags::DISCONNECTED_REMOTE | flags::DISCONNECTED_FULL),
            ServerState::RemoteDisconnected => self.identity.set_flags(flags::DISCONNECTED_REMOTE),
            ServerState::FullyDisconnected => self
                .identity
                .set_flags(flags::DISCONNECTED_REMOTE | flags::DISCONNECTED_FULL),
            ServerState::Unregistered => {}
        }
        debug!(uri = ?self.identity.uri(), from = ?*current, to = ?state, "server identity state");
        *current = state;
    }

    /// Current lease, if the object is leased
    pub fn lease(&self) -> Option<Arc<Lease>> {
        self.lease.read().clone()
    }

    pub(crate) fn set_lease(&self, lease: Option<Arc<Lease>>) {
        *self.lease.write() = lease;
    }

    pub(crate) fn take_lease(&self) -> Option<Arc<Lease>> {
        self.lease.write().take()
    }

    pub fn server_chain(&self) -> Option<Arc<dyn MessageSink>> {
        self.server_chain.get().cloned()
    }

    /// Server chain, built with `build` on first use
    pub(crate) fn server_chain_or_init(
        &self,
        build: impl FnOnce() -> Arc<dyn MessageSink>,
    ) -> Arc<dyn MessageSink> {
        self.server_chain.get_or_init(build).clone()
    }

    /// Object the next call should run on
    pub(crate) fn resolve_target(&self) -> Result<ResolvedTarget> {
        let mut target = self.target.lock();
        match &mut *target {
            Target::Instance(object) => Ok(ResolvedTarget {
                object: object.clone(),
                created: false,
            }),
            Target::Singleton { factory, instance } => match instance {
                Some(object) => Ok(ResolvedTarget {
                    object: object.clone(),
                    created: false,
                }),
                None => {
                    let object = factory(&[])?;
                    *instance = Some(object.clone());
                    Ok(ResolvedTarget {
                        object,
                        created: true,
                    })
                }
            },
            Target::SingleCall(factory) => Ok(ResolvedTarget {
                object: factory(&[])?,
                created: false,
            }),
            Target::Retained(_) | Target::Detached => Err(RemotingError::Disconnected(
                self.identity.uri().unwrap_or_default(),
            )),
        }
    }

    /// Current instance without creating one
    pub fn instance(&self) -> Option<Arc<dyn RemoteObject>> {
        match &*self.target.lock() {
            Target::Instance(object) => Some(object.clone()),
            Target::Singleton { instance, .. } => instance.clone(),
            Target::Retained(weak) => weak.upgrade(),
            Target::SingleCall(_) | Target::Detached => None,
        }
    }

    /// Hold the object weakly; used when its lease expires
    pub(crate) fn retain_weak(&self) {
        let mut target = self.target.lock();
        if let Target::Instance(object) = &*target {
            *target = Target::Retained(Arc::downgrade(object));
        }
    }

    /// Drop the singleton instance; the next call creates a new one
    pub(crate) fn reset_singleton(&self) -> bool {
        match &mut *self.target.lock() {
            Target::Singleton { instance, .. } => instance.take().is_some(),
            _ => false,
        }
    }

    pub(crate) fn detach(&self) {
        *self.target.lock() = Target::Detached;
    }

    /// Whether a retained object is still alive somewhere
    pub(crate) fn retained_alive(&self) -> bool {
        match &*self.target.lock() {
            Target::Retained(weak) => weak.strong_count() > 0,
            Target::Detached => false,
            _ => true,
        }
    }

    /// Reconnect after lease expiry when `object` is published again
    pub(crate) fn try_reactivate(&self, object: &Arc<dyn RemoteObject>) -> bool {
        let mut state = self.state.lock();
        if *state != ServerState::FullyDisconnected || self.identity.uri().is_none() {
            return false;
        }
        let mut target = self.target.lock();
        let Target::Retained(weak) = &*target else {
            return false;
        };
        match weak.upgrade() {
            Some(alive) if object_key(&alive) == object_key(object) => {
                *target = Target::Instance(alive);
                *state = ServerState::Connected;
                self.identity
                    .clear_flags(flags::DISCONNECTED_REMOTE | flags::DISCONNECTED_FULL);
                debug!(uri = ?self.identity.uri(), "server identity reactivated");
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("uri", &self.identity.uri())
            .field("type_name", &self.type_name)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}
