//! Proxies
//!
//! A [`RemotingProxy`] stands in for an object reached through a channel.
//! Every call is turned into a message and sent down the proxy's chain:
//!
//! ```text
//!   invoke ──► [client context sinks] ──► DynamicNotifySink ──► ClientContextTerminatorSink
//!                                                                        │
//!              channel sink ◄── EnvoyTerminatorSink ◄── [envoy sinks] ◄──┘
//! ```
//!
//! When the calling context contributes no client sinks and nobody has
//! registered a dynamic sink, calls go straight to the envoy chain. The
//! outcome is the same; only the empty links are skipped.
//!
//! `get_type` and `get_hash_code` are answered by the proxy itself.

mod async_result;

pub use async_result::{AsyncCallback, AsyncReplySink, AsyncResult};

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use tracing::{debug, trace};

use crate::activation::Activator;
use crate::context::{Context, SinkKind};
use crate::domain::DomainShared;
use crate::error::{RemotingError, Result};
use crate::identity::{table_key, Identity};
use crate::message::{
    CallContext, CallKind, Message, MethodCache, MethodCall, MethodDescriptor, ReturnMessage, TypeInfo, GET_HASH_CODE,
    GET_TYPE,
};
use crate::sink::{ClientContextTerminatorSink, DynamicNotifySink, EnvoyTerminatorSink, MessageSink, SinkChainBuilder};
use crate::value::{ObjRef, Value};

/// Client-side stand-in for a remote object
pub struct RemotingProxy {
    identity: Arc<Identity>,
    methods: MethodCache,
    context: Arc<Context>,
    domain: Weak<DomainShared>,
    chain: OnceLock<Arc<dyn MessageSink>>,
}

impl RemotingProxy {
    pub(crate) fn new(
        identity: Arc<Identity>,
        type_info: TypeInfo,
        context: Arc<Context>,
        domain: Weak<DomainShared>,
    ) -> Self {
        Self {
            identity,
            methods: MethodCache::new(type_info),
            context,
            domain,
            chain: OnceLock::new(),
        }
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn uri(&self) -> String {
        self.identity.uri().unwrap_or_default()
    }

    pub fn type_info(&self) -> &TypeInfo {
        self.methods.type_info()
    }

    /// Context the proxy makes its calls from
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn obj_ref(&self) -> ObjRef {
        ObjRef::new(self.uri(), self.type_info().type_name())
    }

    /// Call `name` and wait for the reply
    ///
    /// Logical data of `ctx` travels with the call; logical data set by the
    /// target comes back into `ctx`. One-way methods return `Null` at once.
    pub fn invoke(&self, ctx: &mut CallContext, name: &str, args: Vec<Value>) -> Result<Value> {
        if let Some(value) = self.answer_locally(name) {
            return Ok(value);
        }
        let metadata = self.methods.resolve(name, args.len())?;
        let descriptor = metadata.descriptor.clone();
        let kind = CallKind::classify(&descriptor, false);
        let call = self.build_call(descriptor, args, ctx.clone_for_handoff());
        let sink = self.sink()?;

        if kind == CallKind::OneWay {
            trace!(uri = %call.uri(), method = name, "one-way call");
            sink.async_process_message(Message::Call(call), None);
            return Ok(Value::Null);
        }

        let reply = sink.sync_process_message(Message::Call(call)).into_return();
        let (outcome, returned) = reply.into_parts();
        ctx.merge(&returned);
        outcome
    }

    /// Start a call to `name` without waiting
    ///
    /// Failures, including a missing channel, are reported through the
    /// returned result, never raised here.
    pub fn begin_invoke(
        &self,
        ctx: &CallContext,
        name: &str,
        args: Vec<Value>,
        callback: Option<AsyncCallback>,
    ) -> Arc<AsyncResult> {
        if let Some(value) = self.answer_locally(name) {
            let descriptor = MethodDescriptor::new(self.type_info().type_name(), name, 0);
            let result = AsyncResult::new(descriptor, callback);
            self.complete_later(&result, ReturnMessage::ok(value, CallContext::new()));
            return result;
        }
        let metadata = match self.methods.resolve(name, args.len()) {
            Ok(metadata) => metadata,
            Err(e) => {
                let descriptor = MethodDescriptor::new(self.type_info().type_name(), name, args.len());
                let result = AsyncResult::new(descriptor, callback);
                self.complete_later(&result, ReturnMessage::fault(e, CallContext::new()));
                return result;
            }
        };
        let descriptor = metadata.descriptor.clone();
        let result = AsyncResult::new(descriptor.clone(), callback);

        let kind = CallKind::classify(&descriptor, true);
        let call = self.build_call(descriptor, args, ctx.clone_for_handoff());
        let sink = match self.sink() {
            Ok(sink) => sink,
            Err(e) => {
                self.complete_later(&result, ReturnMessage::for_call(&call, Err(e)));
                return result;
            }
        };

        if kind == CallKind::OneWay {
            sink.async_process_message(Message::Call(call), None);
            self.complete_later(&result, ReturnMessage::ok(Value::Null, CallContext::new()));
            return result;
        }

        let reply_sink: Arc<dyn MessageSink> = Arc::new(AsyncReplySink::new(result.clone()));
        let control = sink.async_process_message(Message::Call(call), Some(reply_sink));
        result.set_control(control);
        result
    }

    /// Wait for a call started with [`RemotingProxy::begin_invoke`] and take
    /// its outcome
    ///
    /// Logical data the target set comes back into `ctx`. Ending the same
    /// call twice fails.
    pub fn end_invoke(&self, ctx: &mut CallContext, result: &AsyncResult) -> Result<Value> {
        let (outcome, returned) = result.take_reply()?.into_parts();
        ctx.merge(&returned);
        outcome
    }

    /// Call `name` without blocking the runtime
    pub async fn call_async(&self, ctx: &mut CallContext, name: &str, args: Vec<Value>) -> Result<Value> {
        let result = self.begin_invoke(ctx, name, args, None);
        result.completed().await;
        self.end_invoke(ctx, &result)
    }

    /// Send a prepared message
    ///
    /// Construction messages go to the domain's activator; calls go down the
    /// chain. The reply is always a message, faults included.
    pub fn invoke_message(&self, msg: Message) -> Message {
        match msg {
            Message::Construct(ctor) => match self.domain.upgrade() {
                Some(domain) => domain.activate(ctor),
                None => Message::fault(RemotingError::ActivationFailed {
                    type_name: ctor.type_name().to_string(),
                    reason: "domain has shut down".into(),
                }),
            },
            Message::Call(call) => {
                if let Some(value) = self.answer_locally(call.method_name()) {
                    return Message::Return(ReturnMessage::for_call(&call, Ok(value)));
                }
                let sink = match self.sink() {
                    Ok(sink) => sink,
                    Err(e) => return Message::Return(ReturnMessage::for_call(&call, Err(e))),
                };
                if call.is_one_way() {
                    let reply = ReturnMessage::for_call(&call, Ok(Value::Null));
                    sink.async_process_message(Message::Call(call), None);
                    return Message::Return(reply);
                }
                sink.sync_process_message(Message::Call(call))
            }
            reply @ Message::Return(_) => Message::fault_for(
                &reply,
                RemotingError::InvalidMessage("a proxy cannot send a reply".into()),
            ),
        }
    }

    /// Whether calls currently skip the client context chain
    pub fn uses_fast_path(&self) -> bool {
        !self.context.contributes(SinkKind::Client)
            && self.context.dynamic_sinks().is_empty()
            && self.identity.dynamic_sinks().is_empty()
    }

    fn build_call(&self, descriptor: MethodDescriptor, args: Vec<Value>, ctx: CallContext) -> MethodCall {
        MethodCall::new(self.uri(), descriptor, args).with_call_context(ctx)
    }

    fn answer_locally(&self, name: &str) -> Option<Value> {
        self.methods.universal(name).map(|descriptor| match descriptor.name() {
            GET_TYPE => Value::from(self.type_info().type_name()),
            GET_HASH_CODE => {
                let mut hasher = DefaultHasher::new();
                table_key(&self.uri()).hash(&mut hasher);
                Value::from(hasher.finish() as i64)
            }
            _ => Value::Null,
        })
    }

    /// Complete `result` from a worker, never on the calling thread
    fn complete_later(&self, result: &Arc<AsyncResult>, reply: ReturnMessage) {
        let result = result.clone();
        match self.domain.upgrade() {
            Some(domain) => domain.pool().execute(move || {
                result.complete(reply);
            }),
            None => {
                result.complete(reply);
            }
        }
    }

    fn sink(&self) -> Result<Arc<dyn MessageSink>> {
        let (envoy, settled) = self.envoy_chain()?;
        if self.uses_fast_path() {
            return Ok(envoy);
        }
        if !settled {
            return Ok(self.client_chain(envoy));
        }
        Ok(self.chain.get_or_init(|| self.client_chain(envoy)).clone())
    }

    fn client_chain(&self, envoy: Arc<dyn MessageSink>) -> Arc<dyn MessageSink> {
        let sources = vec![self.context.dynamic_sinks().clone(), self.identity.dynamic_sinks().clone()];
        let context = self.context.clone();
        SinkChainBuilder::new(Arc::new(ClientContextTerminatorSink::new(envoy)))
            .wrap(|next| Arc::new(DynamicNotifySink::new(sources, true, next)))
            .wrap(|next| context.wrap(SinkKind::Client, next))
            .build()
    }

    /// Envoy chain of the target, materializing the channel sink on first use
    ///
    /// The envoy sinks come from the context the target was published in.
    /// Until its server identity is found in this domain the channel sink is
    /// used alone and nothing is kept, so a target published after the
    /// proxy's first call still gets its envoy sinks. The flag tells whether
    /// the returned chain is the one kept for good.
    fn envoy_chain(&self) -> Result<(Arc<dyn MessageSink>, bool)> {
        if let Some(chain) = self.identity.envoy_chain() {
            return Ok((chain, true));
        }
        let uri = self.uri();
        let url = self.identity.url().map(str::to_string).unwrap_or_else(|| uri.clone());
        let domain = self
            .domain
            .upgrade()
            .ok_or_else(|| RemotingError::NoChannelSink(url.clone()))?;

        let channel = match self.identity.channel_sink() {
            Some(sink) => sink,
            None => {
                let sink = domain.channels().create_message_sink(&url)?;
                self.identity.set_channel_sink(sink)
            }
        };

        let Some(server_ctx) = domain.envoy_context(&uri) else {
            trace!(uri = %uri, "no local server identity yet, envoy chain not kept");
            return Ok((channel, false));
        };
        let chain = if server_ctx.contributes(SinkKind::Envoy) {
            server_ctx.wrap(SinkKind::Envoy, Arc::new(EnvoyTerminatorSink::new(channel)))
        } else {
            channel
        };
        debug!(uri = %uri, url = %url, "envoy chain materialized");
        Ok((self.identity.set_envoy_chain(chain), true))
    }
}

impl fmt::Debug for RemotingProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotingProxy")
            .field("uri", &self.identity.uri())
            .field("url", &self.identity.url())
            .field("type_name", &self.type_info().type_name())
            .field("context", &self.context.id())
            .finish()
    }
}
