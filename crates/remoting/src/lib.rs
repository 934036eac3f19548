//! Object remoting core
//!
//! Calls on remote objects are turned into messages that travel through
//! chains of message sinks. Published objects are found by URI and kept
//! alive by leases.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   RemotingDomain (facade)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Proxies             │  Identities        │  Lifetime       │
//! │  - method cache      │  - URI table       │  - leases       │
//! │  - client chain      │  - server chains   │  - sponsors     │
//! │  - async results     │  - well-known      │  - manager scan │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Message sinks       │  Contexts          │  Activation     │
//! │  - terminators       │  - properties      │  - type factory │
//! │  - dynamic sinks     │  - synchronization │                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Channels: cross-context, formatter sinks, sink stacks      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`message`]: messages, call contexts and method metadata
//! - [`sink`]: the message sink contract and the built-in sinks
//! - [`channel`]: channels, channel sinks and sink stacks
//! - [`identity`]: identities and the identity table
//! - [`proxy`]: proxies and pending asynchronous calls
//! - [`lease`]: leases, sponsors and the lease manager
//! - [`context`]: contexts and context properties
//! - [`activation`]: construction calls and type factories
//! - [`domain`]: the [`RemotingDomain`] facade

pub mod activation;
pub mod channel;
pub mod context;
pub mod domain;
pub mod error;
pub mod identity;
pub mod lease;
pub mod message;
pub mod object;
pub mod proxy;
pub mod sink;
pub mod value;
pub mod worker;

pub use activation::{Activator, ObjectFactory, TypeRegistry};
pub use context::{Context, ContextProperty, SinkKind, SynchronizationProperty};
pub use domain::{IncomingDispatchSink, RemotingConfig, RemotingDomain};
pub use error::{RemotingError, Result};
pub use identity::{Identity, ServerIdentity, ServerState, WellKnownMode};
pub use lease::{ClientSponsor, Lease, LeaseManager, LeaseState, LifetimeServices, Sponsor};
pub use message::{CallContext, ConstructionCall, Message, MethodCall, MethodDescriptor, ReturnMessage, TypeInfo};
pub use object::RemoteObject;
pub use proxy::{AsyncResult, RemotingProxy};
pub use sink::{MessageControl, MessageSink};
pub use value::{ObjRef, Value};
pub use worker::WorkerPool;

use std::time::Duration;

/// Initial lease time of a published object
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(5 * 60);

/// Minimum lease time left after an incoming call
pub const DEFAULT_RENEW_ON_CALL_TIME: Duration = Duration::from_secs(2 * 60);

/// Time a sponsor has to answer a renewal request
pub const DEFAULT_SPONSORSHIP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Interval between lease manager scans
pub const DEFAULT_LEASE_POLL_TIME: Duration = Duration::from_secs(10);
