//! Remoting domain
//!
//! A [`RemotingDomain`] owns everything one remoting runtime needs:
//!
//! - the identity table of published objects and proxies
//! - registered channels, starting with the in-process [`CrossContextChannel`]
//! - client-activated type factories
//! - lifetime settings and the lease manager
//! - the worker pool asynchronous work runs on
//!
//! Incoming calls enter through [`RemotingDomain::dispatcher`]; each server
//! identity gets its chain on first use:
//!
//! ```text
//!   [server context sinks] ─► DynamicNotifySink ─► ServerContextTerminatorSink
//!        ─► LeaseSink ─► ServerObjectTerminatorSink ─► StackBuilderSink ─► object
//! ```
//!
//! Single-call services have no LeaseSink.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::activation::{Activator, ObjectFactory, TypeRegistry};
use crate::channel::{Channel, ChannelServices, CrossContextChannel};
use crate::context::{Context, SinkKind};
use crate::error::{RemotingError, Result};
use crate::identity::{
    flags, generate_uri, object_key, split_url, Identity, IdentityTable, ServerIdentity, ServerState,
    WellKnownMode,
};
use crate::lease::{Lease, LeaseId, LeaseManager, LeaseSink, LeaseState, LifetimeServices};
use crate::message::{ConstructionCall, Message, ReturnMessage, TypeInfo};
use crate::object::RemoteObject;
use crate::proxy::RemotingProxy;
use crate::sink::{
    deliver, DynamicNotifySink, MessageControl, MessageSink, ServerContextTerminatorSink, ServerObjectTerminatorSink,
    SinkChainBuilder, StackBuilderSink, TargetResolver,
};
use crate::value::ObjRef;
use crate::worker::WorkerPool;

/// Domain configuration
#[derive(Debug, Clone)]
pub struct RemotingConfig {
    /// Name used in generated object URIs and cross-context URLs
    pub domain_name: String,
    /// Initial lease time of published objects
    pub lease_time: Duration,
    /// Minimum remaining lease time after a call
    pub renew_on_call_time: Duration,
    /// How long a sponsor may take to answer
    pub sponsorship_timeout: Duration,
    /// Lease manager scan interval
    pub lease_poll_time: Duration,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            domain_name: "default".to_string(),
            lease_time: crate::DEFAULT_LEASE_TIME,
            renew_on_call_time: crate::DEFAULT_RENEW_ON_CALL_TIME,
            sponsorship_timeout: crate::DEFAULT_SPONSORSHIP_TIMEOUT,
            lease_poll_time: crate::DEFAULT_LEASE_POLL_TIME,
        }
    }
}

impl RemotingConfig {
    /// Create a configuration for the named domain
    pub fn new(domain_name: impl Into<String>) -> Self {
        Self {
            domain_name: domain_name.into(),
            ..Default::default()
        }
    }

    pub fn with_lease_time(mut self, value: Duration) -> Self {
        self.lease_time = value;
        self
    }

    pub fn with_renew_on_call_time(mut self, value: Duration) -> Self {
        self.renew_on_call_time = value;
        self
    }

    pub fn with_sponsorship_timeout(mut self, value: Duration) -> Self {
        self.sponsorship_timeout = value;
        self
    }

    pub fn with_lease_poll_time(mut self, value: Duration) -> Self {
        self.lease_poll_time = value;
        self
    }
}

/// State shared by the domain facade, its proxies and its sinks
pub(crate) struct DomainShared {
    name: String,
    lifetime: LifetimeServices,
    identities: IdentityTable,
    channels: ChannelServices,
    types: TypeRegistry,
    default_context: Arc<Context>,
    lease_manager: LeaseManager,
    pool: WorkerPool,
    self_ref: Weak<DomainShared>,
}

impl DomainShared {
    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn channels(&self) -> &ChannelServices {
        &self.channels
    }

    /// Context of a locally published object, for envoy sinks
    pub(crate) fn envoy_context(&self, uri: &str) -> Option<Arc<Context>> {
        self.identities
            .lookup_server(uri)
            .map(|identity| identity.context().clone())
    }

    fn obj_ref(identity: &ServerIdentity) -> ObjRef {
        ObjRef::new(identity.uri().unwrap_or_default(), identity.type_name())
    }

    fn marshal(
        &self,
        object: Arc<dyn RemoteObject>,
        uri: Option<&str>,
        context: Arc<Context>,
    ) -> Result<ObjRef> {
        if let Some(existing) = self.identities.server_for_object(object_key(&object)) {
            if let Some(requested) = uri {
                let current = existing.uri().unwrap_or_default();
                if crate::identity::table_key(requested) != crate::identity::table_key(&current) {
                    return Err(RemotingError::UriAlreadyAssigned {
                        current,
                        requested: requested.to_string(),
                    });
                }
            }
            if existing.try_reactivate(&object) {
                self.attach_lease(&existing, &object)?;
                info!(uri = ?existing.uri(), "object published again after lease expiry");
                return Ok(Self::obj_ref(&existing));
            }
            if existing.state() != ServerState::FullyDisconnected {
                return Ok(Self::obj_ref(&existing));
            }
            // An expired identity whose object was dropped; the address was reused.
            self.identities.remove_server(&existing);
        }

        let identity = Arc::new(ServerIdentity::for_instance(object.clone(), context.clone()));
        match uri {
            Some(uri) => {
                identity.identity().set_uri(normalize_uri(uri))?;
                identity.identity().set_flags(flags::WELL_KNOWN);
            }
            None => {
                identity.identity().ensure_uri(|| generate_uri(&self.name))?;
            }
        }
        if !Arc::ptr_eq(&context, &self.default_context) {
            identity.identity().set_flags(flags::CONTEXT_BOUND);
        }

        self.attach_lease(&identity, &object)?;
        if let Err(e) = self.identities.register_server(identity.clone()) {
            if let Some(lease) = identity.take_lease() {
                lease.terminate();
            }
            return Err(e);
        }
        identity.set_state(ServerState::Connected);
        info!(uri = ?identity.uri(), type_name = identity.type_name(), "object published");
        Ok(Self::obj_ref(&identity))
    }

    /// Give `object` a lease, unless it opts out
    fn attach_lease(&self, identity: &Arc<ServerIdentity>, object: &Arc<dyn RemoteObject>) -> Result<()> {
        let Some(lease) = object.initialize_lifetime_service(self.lifetime.new_lease()) else {
            debug!(uri = ?identity.uri(), "object lives until disconnected");
            identity.set_lease(None);
            return Ok(());
        };
        if lease.state() == LeaseState::Null {
            identity.set_lease(None);
            return Ok(());
        }

        let lease = Arc::new(lease);
        let lease_id = lease.id();
        let domain = self.self_ref.clone();
        let target = Arc::downgrade(identity);
        identity.set_lease(Some(lease.clone()));
        let activated = lease.activate(
            &self.lease_manager,
            self.pool.clone(),
            identity.uri().unwrap_or_default(),
            move || {
                if let (Some(domain), Some(identity)) = (domain.upgrade(), target.upgrade()) {
                    domain.lease_expired(&identity, lease_id);
                }
            },
        );
        if let Err(e) = activated {
            identity.set_lease(None);
            return Err(e);
        }
        Ok(())
    }

    fn lease_expired(&self, identity: &Arc<ServerIdentity>, lease_id: LeaseId) {
        if identity.lease().map(|l| l.id()) != Some(lease_id) {
            return;
        }
        identity.take_lease();
        if identity.mode() == Some(WellKnownMode::Singleton) {
            identity.reset_singleton();
            info!(uri = ?identity.uri(), "singleton lease expired, instance released");
            return;
        }
        identity.set_state(ServerState::RemoteDisconnected);
        identity.retain_weak();
        identity.set_state(ServerState::FullyDisconnected);
        if !identity.retained_alive() {
            self.identities.remove_server(identity);
            info!(uri = ?identity.uri(), "lease expired, dropped object removed");
            return;
        }
        info!(uri = ?identity.uri(), "lease expired, object disconnected");
    }

    /// Remove expired identities whose object has been dropped since
    fn sweep_identities(&self) {
        let purged = self.identities.purge_dead();
        if purged > 0 {
            debug!(purged, "dead identities removed");
        }
    }

    fn disconnect(&self, identity: &Arc<ServerIdentity>) {
        self.identities.remove_server(identity);
        if let Some(lease) = identity.take_lease() {
            lease.terminate();
        }
        identity.set_state(ServerState::FullyDisconnected);
        identity.detach();
        info!(uri = ?identity.uri(), "object disconnected");
        identity.identity().clear_uri();
    }

    fn register_well_known(
        &self,
        type_name: &str,
        uri: &str,
        factory: ObjectFactory,
        mode: WellKnownMode,
    ) -> Result<ObjRef> {
        let identity = Arc::new(ServerIdentity::well_known(
            type_name,
            factory,
            mode,
            self.default_context.clone(),
        ));
        identity.identity().set_uri(normalize_uri(uri))?;
        self.identities.register_server(identity.clone())?;
        identity.set_state(ServerState::Connected);
        info!(uri = %uri, type_name = %type_name, ?mode, "well-known service registered");
        Ok(Self::obj_ref(&identity))
    }

    fn proxy(&self, url: &str, type_info: TypeInfo, context: Arc<Context>) -> Arc<RemotingProxy> {
        let (_, uri) = split_url(url);
        let identity = self
            .identities
            .find_or_register_client(url, || Identity::client(url, uri));
        Arc::new(RemotingProxy::new(identity, type_info, context, self.self_ref.clone()))
    }

    fn server_chain_for(&self, msg: &Message) -> Result<Arc<dyn MessageSink>> {
        let uri = msg
            .uri()
            .ok_or_else(|| RemotingError::InvalidMessage("call carries no URI".into()))?;
        let identity = self
            .identities
            .lookup_server(uri)
            .ok_or_else(|| RemotingError::ObjectNotFound(uri.to_string()))?;
        // The object terminator checks again for a disconnect racing this call.
        if identity.is_fully_disconnected() {
            return Err(RemotingError::Disconnected(uri.to_string()));
        }
        Ok(identity.server_chain_or_init(|| self.build_server_chain(&identity)))
    }

    fn build_server_chain(&self, identity: &Arc<ServerIdentity>) -> Arc<dyn MessageSink> {
        let target = Arc::downgrade(identity);
        let resolver: Weak<dyn TargetResolver> = self.self_ref.clone();
        let sources = vec![
            identity.context().dynamic_sinks().clone(),
            identity.identity().dynamic_sinks().clone(),
        ];
        let leased = identity.mode() != Some(WellKnownMode::SingleCall);
        let context = identity.context().clone();

        let chain = SinkChainBuilder::new(Arc::new(StackBuilderSink::new(
            target.clone(),
            resolver,
            self.pool.clone(),
        )))
        .wrap(|next| Arc::new(ServerObjectTerminatorSink::new(target.clone(), next)))
        .wrap_if(leased, |next| Arc::new(LeaseSink::new(target.clone(), next)))
        .wrap(|next| Arc::new(ServerContextTerminatorSink::new(next)))
        .wrap(|next| Arc::new(DynamicNotifySink::new(sources, false, next)))
        .wrap(|next| context.wrap(SinkKind::Server, next))
        .build();
        debug!(uri = ?identity.uri(), sinks = ?crate::sink::chain_names(&chain), "server chain built");
        chain
    }

    pub(crate) fn dispatch_incoming(&self, msg: Message) -> Message {
        let msg = match msg {
            Message::Construct(ctor) => return self.activate(ctor),
            other => other,
        };
        match self.server_chain_for(&msg) {
            Ok(chain) => chain.sync_process_message(msg),
            Err(e) => {
                debug!(uri = ?msg.uri(), error = %e, "incoming call rejected");
                Message::fault_for(&msg, e)
            }
        }
    }

    pub(crate) fn async_dispatch_incoming(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        let msg = match msg {
            Message::Construct(ctor) => {
                let reply = self.activate(ctor);
                self.pool.execute(move || deliver(reply_sink.as_ref(), reply));
                return None;
            }
            other => other,
        };
        match self.server_chain_for(&msg) {
            Ok(chain) => chain.async_process_message(msg, reply_sink),
            Err(e) => {
                debug!(uri = ?msg.uri(), error = %e, "incoming async call rejected");
                let fault = Message::fault_for(&msg, e);
                self.pool.execute(move || deliver(reply_sink.as_ref(), fault));
                None
            }
        }
    }
}

impl TargetResolver for DomainShared {
    fn resolve(&self, identity: &Arc<ServerIdentity>) -> Result<Arc<dyn RemoteObject>> {
        let resolved = identity.resolve_target()?;
        if resolved.created && identity.mode() == Some(WellKnownMode::Singleton) {
            debug!(uri = ?identity.uri(), "singleton instance created");
            if let Err(e) = self.attach_lease(identity, &resolved.object) {
                warn!(uri = ?identity.uri(), error = %e, "singleton lease not activated");
            }
        }
        Ok(resolved.object)
    }
}

impl Activator for DomainShared {
    fn activate(&self, call: ConstructionCall) -> Message {
        let ctx = call.call_context().clone_for_handoff();
        let outcome = self
            .types
            .create(call.type_name(), call.args())
            .and_then(|object| self.marshal(object, None, self.default_context.clone()));
        match outcome {
            Ok(obj_ref) => {
                debug!(type_name = call.type_name(), uri = obj_ref.uri(), "object activated");
                Message::Return(ReturnMessage::construction(obj_ref, ctx))
            }
            Err(e) => {
                warn!(type_name = call.type_name(), error = %e, "activation failed");
                Message::Return(ReturnMessage::fault(e, ctx))
            }
        }
    }
}

/// Entry point of incoming calls: finds the target's server chain
pub struct IncomingDispatchSink {
    domain: Weak<DomainShared>,
}

impl IncomingDispatchSink {
    fn unavailable(msg: &Message) -> Message {
        Message::fault_for(
            msg,
            RemotingError::Disconnected(msg.uri().unwrap_or_default().to_string()),
        )
    }
}

impl MessageSink for IncomingDispatchSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        match self.domain.upgrade() {
            Some(domain) => domain.dispatch_incoming(msg),
            None => Self::unavailable(&msg),
        }
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        match self.domain.upgrade() {
            Some(domain) => domain.async_dispatch_incoming(msg, reply_sink),
            None => {
                deliver(reply_sink.as_ref(), Self::unavailable(&msg));
                None
            }
        }
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        None
    }

    fn name(&self) -> &'static str {
        "IncomingDispatchSink"
    }
}

fn normalize_uri(uri: &str) -> String {
    if uri.starts_with('/') {
        uri.to_string()
    } else {
        format!("/{}", uri)
    }
}

/// A remoting runtime: published objects, proxies, channels and leases
#[derive(Clone)]
pub struct RemotingDomain {
    shared: Arc<DomainShared>,
}

impl RemotingDomain {
    /// Create a domain on the runtime the caller is running in
    pub fn new(config: RemotingConfig) -> Result<Self> {
        let pool = WorkerPool::current()?;
        Ok(Self::with_pool(config, pool))
    }

    /// Create a domain whose asynchronous work runs on `handle`
    pub fn with_handle(config: RemotingConfig, handle: Handle) -> Self {
        Self::with_pool(config, WorkerPool::new(handle))
    }

    fn with_pool(config: RemotingConfig, pool: WorkerPool) -> Self {
        let lifetime = LifetimeServices::new(
            config.lease_time,
            config.renew_on_call_time,
            config.sponsorship_timeout,
            config.lease_poll_time,
        );
        let lease_manager = LeaseManager::new(config.lease_poll_time);
        let shared = Arc::new_cyclic(|self_ref: &Weak<DomainShared>| DomainShared {
            name: config.domain_name.clone(),
            lifetime,
            identities: IdentityTable::new(),
            channels: ChannelServices::new(),
            types: TypeRegistry::new(),
            default_context: Context::empty(),
            lease_manager,
            pool,
            self_ref: self_ref.clone(),
        });

        let sweeper = Arc::downgrade(&shared);
        shared.lease_manager.set_after_pass(Arc::new(move || {
            if let Some(domain) = sweeper.upgrade() {
                domain.sweep_identities();
            }
        }));

        let dispatcher = Arc::new(IncomingDispatchSink {
            domain: Arc::downgrade(&shared),
        });
        let local = CrossContextChannel::new(config.domain_name.as_str(), dispatcher);
        // A fresh registry has no channel to clash with.
        let _ = shared.channels.register(Arc::new(local));
        info!(domain = %config.domain_name, "remoting domain created");
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Start the lease manager's periodic scan
    ///
    /// The scan interval is the lifetime services' poll time, read here.
    pub fn start(&self) {
        let manager = &self.shared.lease_manager;
        manager.set_poll_interval(self.shared.lifetime.poll_time());
        manager.start(self.shared.pool.handle());
    }

    /// Stop the lease manager
    pub fn shutdown(&self) {
        self.shared.lease_manager.shutdown();
        info!(domain = %self.shared.name, "remoting domain shut down");
    }

    pub fn lifetime(&self) -> &LifetimeServices {
        &self.shared.lifetime
    }

    pub fn lease_manager(&self) -> &LeaseManager {
        &self.shared.lease_manager
    }

    pub fn identities(&self) -> &IdentityTable {
        &self.shared.identities
    }

    pub fn channels(&self) -> &ChannelServices {
        &self.shared.channels
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    pub fn default_context(&self) -> &Arc<Context> {
        &self.shared.default_context
    }

    /// Publish `object` under a generated URI
    ///
    /// Publishing an object again returns its existing reference. An object
    /// whose lease expired while it was still referenced comes back under
    /// the same URI with a fresh lease.
    pub fn marshal(&self, object: Arc<dyn RemoteObject>) -> Result<ObjRef> {
        self.shared
            .marshal(object, None, self.shared.default_context.clone())
    }

    /// Publish `object` under `uri`
    pub fn marshal_with_uri(&self, object: Arc<dyn RemoteObject>, uri: &str) -> Result<ObjRef> {
        self.shared
            .marshal(object, Some(uri), self.shared.default_context.clone())
    }

    /// Publish `object` as living in `context`
    pub fn marshal_in_context(&self, object: Arc<dyn RemoteObject>, context: Arc<Context>) -> Result<ObjRef> {
        self.shared.marshal(object, None, context)
    }

    /// Publish `object` under `uri` as living in `context`
    pub fn marshal_with_uri_in_context(
        &self,
        object: Arc<dyn RemoteObject>,
        uri: &str,
        context: Arc<Context>,
    ) -> Result<ObjRef> {
        self.shared.marshal(object, Some(uri), context)
    }

    /// Withdraw a published object. Its URI is released and its lease
    /// terminated.
    pub fn disconnect(&self, object: &Arc<dyn RemoteObject>) -> bool {
        match self.shared.identities.server_for_object(object_key(object)) {
            Some(identity) => {
                self.shared.disconnect(&identity);
                true
            }
            None => false,
        }
    }

    /// Withdraw whatever is published under `uri`
    pub fn disconnect_uri(&self, uri: &str) -> bool {
        match self.shared.identities.lookup_server(uri) {
            Some(identity) => {
                self.shared.disconnect(&identity);
                true
            }
            None => false,
        }
    }

    /// Publish a service created on demand under `uri`
    pub fn register_well_known(
        &self,
        type_name: &str,
        uri: &str,
        factory: ObjectFactory,
        mode: WellKnownMode,
    ) -> Result<ObjRef> {
        self.shared.register_well_known(type_name, uri, factory, mode)
    }

    /// Make a type creatable through construction calls
    pub fn register_activated_type(&self, type_name: &str, factory: ObjectFactory) {
        self.shared.types.register(type_name, factory);
    }

    /// Create an object of a registered type and return a proxy to it
    pub fn create_instance(&self, type_info: TypeInfo, args: Vec<crate::value::Value>) -> Result<Arc<RemotingProxy>> {
        let ctor = ConstructionCall::new(type_info.type_name(), args);
        let value = self.shared.activate(ctor).into_return().into_result()?;
        let obj_ref = value.as_obj_ref().cloned().ok_or_else(|| RemotingError::ActivationFailed {
            type_name: type_info.type_name().to_string(),
            reason: "construction reply carries no object reference".into(),
        })?;
        Ok(self.unmarshal(&obj_ref, type_info))
    }

    /// Proxy for a marshaled reference, calling from the default context
    pub fn unmarshal(&self, obj_ref: &ObjRef, type_info: TypeInfo) -> Arc<RemotingProxy> {
        self.unmarshal_in_context(obj_ref, type_info, self.shared.default_context.clone())
    }

    pub fn unmarshal_in_context(
        &self,
        obj_ref: &ObjRef,
        type_info: TypeInfo,
        context: Arc<Context>,
    ) -> Arc<RemotingProxy> {
        self.shared.proxy(obj_ref.uri(), type_info, context)
    }

    /// Proxy for the object at `url`
    ///
    /// No channel is consulted until the first call, so an unreachable URL
    /// only fails then.
    pub fn connect(&self, url: &str, type_info: TypeInfo) -> Arc<RemotingProxy> {
        self.shared
            .proxy(url, type_info, self.shared.default_context.clone())
    }

    pub fn register_channel(&self, channel: Arc<dyn Channel>) -> Result<()> {
        self.shared.channels.register(channel)
    }

    /// Sink transports hand incoming calls to
    pub fn dispatcher(&self) -> Arc<dyn MessageSink> {
        Arc::new(IncomingDispatchSink {
            domain: Arc::downgrade(&self.shared),
        })
    }

    /// Run an incoming call and return its reply
    pub fn dispatch_incoming(&self, msg: Message) -> Message {
        self.shared.dispatch_incoming(msg)
    }

    /// Run an incoming call; the reply goes to `reply_sink`
    pub fn async_dispatch_incoming(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        self.shared.async_dispatch_incoming(msg, reply_sink)
    }

    /// Lease of a published object
    pub fn lease_of(&self, object: &Arc<dyn RemoteObject>) -> Option<Arc<Lease>> {
        self.shared
            .identities
            .server_for_object(object_key(object))
            .and_then(|identity| identity.lease())
    }

    /// Lease of whatever is published under `uri`
    pub fn lease_for_uri(&self, uri: &str) -> Option<Arc<Lease>> {
        self.shared
            .identities
            .lookup_server(uri)
            .and_then(|identity| identity.lease())
    }

    /// Server identity published under `uri`
    pub fn server_identity(&self, uri: &str) -> Option<Arc<ServerIdentity>> {
        self.shared.identities.lookup_server(uri)
    }

    /// URL reaching `uri` through the in-process channel
    pub fn local_url(&self, uri: &str) -> String {
        format!("{}://{}{}", crate::channel::CROSS_CONTEXT_SCHEME, self.shared.name, normalize_uri(uri))
    }
}

impl fmt::Debug for RemotingDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotingDomain")
            .field("name", &self.shared.name)
            .field("servers", &self.shared.identities.server_count())
            .field("channels", &self.shared.channels.channel_names())
            .finish()
    }
}
