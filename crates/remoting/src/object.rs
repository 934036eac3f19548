//! Remote object capability

use std::any::Any;

use crate::error::Result;
use crate::lease::Lease;
use crate::message::{CallContext, MethodDescriptor};
use crate::value::Value;

/// An object that can be published and called through a proxy
///
/// Implementations dispatch on the method name themselves; the runtime
/// has already matched the call to a descriptor of the proxy's contract.
pub trait RemoteObject: Send + Sync + 'static {
    fn type_name(&self) -> &str;

    /// Run a call against the object
    ///
    /// `ctx` is the call context that arrived with the call; changes to its
    /// logical entries travel back to the caller with the reply.
    fn invoke(&self, method: &MethodDescriptor, args: &[Value], ctx: &mut CallContext) -> Result<Value>;

    /// Lifetime override hook, called once when the object is first published
    ///
    /// `lease` is still Initial, so its times may be changed. Returning
    /// `None` opts the object out of leasing: it lives until disconnected.
    fn initialize_lifetime_service(&self, lease: Lease) -> Option<Lease> {
        Some(lease)
    }

    /// Cast to Any for downcasting
    fn as_any(&self) -> &dyn Any;
}
