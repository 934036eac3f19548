//! Remoting error types

use thiserror::Error;

use crate::lease::LeaseState;

/// Result type for remoting operations
pub type Result<T> = std::result::Result<T, RemotingError>;

/// Remoting errors
///
/// Errors are `Clone` so that a failure raised deep in a sink chain can be
/// carried back inside a reply message and raised again, unchanged, at the
/// proxy boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemotingError {
    /// Pop/store/dispatch against an empty sink stack
    #[error("sink stack is empty")]
    SinkStackEmpty,

    /// Pop/store named a sink that has no frame on the stack
    #[error("sink stack has no frame for {0}")]
    SinkStackFrameNotFound(String),

    /// Remembered frames cannot be dispatched over live frames
    #[error("cannot dispatch remembered frames: {0} active frame(s) remain")]
    SinkStackNotEmpty(usize),

    /// No channel could produce a message sink for the target
    #[error("no channel sink for {0}")]
    NoChannelSink(String),

    /// Target identity has been disconnected
    #[error("object {0} has been disconnected")]
    Disconnected(String),

    /// Nothing is registered under the URI
    #[error("no object registered at {0}")]
    ObjectNotFound(String),

    /// URI assignment attempted on an identity that already has one
    #[error("URI already assigned: {current} (requested {requested})")]
    UriAlreadyAssigned { current: String, requested: String },

    /// Another identity already owns the URI
    #[error("URI {0} is already in use")]
    UriInUse(String),

    /// Lease lifetime settings may only change in the Initial state
    #[error("lease is {0:?}; lifetime settings can only change while Initial")]
    LeaseNotInitial(LeaseState),

    /// A set-once setting was assigned twice
    #[error("{0} has already been assigned")]
    SettingAlreadyAssigned(&'static str),

    /// A channel with the same name is already registered
    #[error("channel {0} is already registered")]
    ChannelAlreadyRegistered(String),

    /// Failure raised by the target object
    #[error("{kind}: {message}")]
    Application { kind: String, message: String },

    /// Target object panicked during invocation
    #[error("target panicked: {0}")]
    TargetPanicked(String),

    /// Construction message could not be satisfied
    #[error("activation of {type_name} failed: {reason}")]
    ActivationFailed { type_name: String, reason: String },

    /// No method with that name and arity
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Several overloads match a call
    #[error("ambiguous call to {name}: {candidates} overloads take {arity} argument(s)")]
    AmbiguousMethod {
        name: String,
        arity: usize,
        candidates: usize,
    },

    /// No tokio runtime to run workers on
    #[error("no async runtime available: {0}")]
    NoRuntime(String),

    /// Message shape not valid for the operation
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Formatter failed to serialize or deserialize
    #[error("formatter error: {0}")]
    Formatter(String),

    /// Transport-level failure reported by a channel sink
    #[error("channel error: {0}")]
    Channel(String),

    /// Call was cancelled before it ran
    #[error("call cancelled")]
    Cancelled,

    /// Async call ended more than once
    #[error("async call result has already been consumed")]
    AlreadyEnded,
}

impl RemotingError {
    /// Build an application fault
    pub fn application(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Whether this error reflects a broken sink stack (programming error)
    pub fn is_sink_stack_misuse(&self) -> bool {
        matches!(
            self,
            Self::SinkStackEmpty | Self::SinkStackFrameNotFound(_) | Self::SinkStackNotEmpty(_)
        )
    }
}
