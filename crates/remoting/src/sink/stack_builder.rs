//! Server-side terminal sink
//!
//! [`StackBuilderSink`] is the last link of every server chain. It resolves
//! the target object, runs the call on it and turns the outcome into a
//! reply. A panic in the target becomes a fault reply; it never unwinds
//! into the chain.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::{CallControl, MessageControl, MessageSink};
use crate::error::{RemotingError, Result};
use crate::identity::{object_key, ServerIdentity};
use crate::message::{CallContext, Message, MethodCall, ReturnMessage, GET_HASH_CODE, GET_TYPE};
use crate::object::RemoteObject;
use crate::value::Value;
use crate::worker::{panic_message, WorkerPool};

/// Supplies the object a call runs on
///
/// Resolution may create the object (a singleton's first call) and set up
/// its lifetime.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, identity: &Arc<ServerIdentity>) -> Result<Arc<dyn RemoteObject>>;
}

/// Terminal sink invoking the target object
pub struct StackBuilderSink {
    identity: Weak<ServerIdentity>,
    resolver: Weak<dyn TargetResolver>,
    pool: WorkerPool,
}

impl StackBuilderSink {
    pub fn new(identity: Weak<ServerIdentity>, resolver: Weak<dyn TargetResolver>, pool: WorkerPool) -> Self {
        Self {
            identity,
            resolver,
            pool,
        }
    }

    fn target(&self, uri: &str) -> Result<Arc<dyn RemoteObject>> {
        let identity = self
            .identity
            .upgrade()
            .ok_or_else(|| RemotingError::Disconnected(uri.to_string()))?;
        let resolver = self
            .resolver
            .upgrade()
            .ok_or_else(|| RemotingError::Disconnected(uri.to_string()))?;
        resolver.resolve(&identity)
    }

    fn invoke(&self, call: &MethodCall) -> ReturnMessage {
        let mut ctx = call.call_context().clone();
        let outcome = self
            .target(call.uri())
            .and_then(|target| run_on_target(&target, call, &mut ctx));
        let mut reply = ReturnMessage::for_call(call, outcome);
        *reply.call_context_mut() = ctx.clone_for_handoff();
        reply
    }

    fn process(&self, msg: Message) -> Message {
        match msg {
            Message::Call(call) => Message::Return(self.invoke(&call)),
            other => Message::fault_for(
                &other,
                RemotingError::InvalidMessage("only method calls reach an object".into()),
            ),
        }
    }
}

fn run_on_target(target: &Arc<dyn RemoteObject>, call: &MethodCall, ctx: &mut CallContext) -> Result<Value> {
    let method = call.method();
    if method.is_universal() {
        return match method.name() {
            GET_TYPE => Ok(Value::from(target.type_name())),
            GET_HASH_CODE => Ok(Value::from(object_key(target) as i64)),
            other => Err(RemotingError::MethodNotFound(other.to_string())),
        };
    }
    catch_unwind(AssertUnwindSafe(|| target.invoke(method, call.args(), ctx))).unwrap_or_else(|payload| {
        let message = panic_message(payload);
        warn!(uri = %call.uri(), method = %method.name(), panic = %message, "target panicked");
        Err(RemotingError::TargetPanicked(message))
    })
}

impl MessageSink for StackBuilderSink {
    fn sync_process_message(&self, msg: Message) -> Message {
        self.process(msg)
    }

    fn async_process_message(
        &self,
        msg: Message,
        reply_sink: Option<Arc<dyn MessageSink>>,
    ) -> Option<Arc<dyn MessageControl>> {
        let worker = StackBuilderSink {
            identity: self.identity.clone(),
            resolver: self.resolver.clone(),
            pool: self.pool.clone(),
        };

        let Some(reply_sink) = reply_sink else {
            // One-way: nobody is waiting for the outcome, nothing to cancel.
            self.pool.execute(move || {
                if let Some(e) = worker.process(msg).exception() {
                    warn!(error = %e, "one-way call failed");
                }
            });
            return None;
        };

        let control = CallControl::new();
        let task_control = control.clone();
        self.pool.execute(move || {
            let reply = if task_control.begin() {
                worker.process(msg)
            } else {
                debug!(uri = ?msg.uri(), "async call cancelled before it ran");
                Message::fault_for(&msg, RemotingError::Cancelled)
            };
            reply_sink.sync_process_message(reply);
        });
        Some(control)
    }

    fn next_sink(&self) -> Option<Arc<dyn MessageSink>> {
        None
    }

    fn name(&self) -> &'static str {
        "StackBuilderSink"
    }
}
