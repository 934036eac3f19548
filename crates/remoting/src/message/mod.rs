//! Call descriptors
//!
//! A [`Message`] describes one invocation travelling through a sink chain:
//! - [`MethodCall`]: target URI, method, arguments, properties, headers and
//!   a [`CallContext`] snapshot
//! - [`ConstructionCall`]: activation request, answered by an activator
//! - [`ReturnMessage`]: the reply, carrying a value or a fault

mod call_context;
mod message;
mod method;

pub use call_context::*;
pub use message::*;
pub use method::*;
