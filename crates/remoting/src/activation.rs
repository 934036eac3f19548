//! Activation
//!
//! Construction calls never reach an existing object. They go to an
//! [`Activator`], which creates the instance and answers with a
//! construction return carrying the new object's reference.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{RemotingError, Result};
use crate::message::{ConstructionCall, Message};
use crate::object::RemoteObject;
use crate::value::Value;

/// Creates an instance from constructor arguments
pub type ObjectFactory = Arc<dyn Fn(&[Value]) -> Result<Arc<dyn RemoteObject>> + Send + Sync>;

/// Answers construction calls
pub trait Activator: Send + Sync {
    /// Create the requested object; the reply is a construction return or
    /// a fault
    fn activate(&self, call: ConstructionCall) -> Message;
}

/// Factories for client-activated types, keyed by type name
#[derive(Default)]
pub struct TypeRegistry {
    factories: RwLock<HashMap<String, ObjectFactory>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any earlier one for the type
    pub fn register(&self, type_name: impl Into<String>, factory: ObjectFactory) {
        let type_name = type_name.into();
        debug!(type_name = %type_name, "activated type registered");
        self.factories.write().insert(type_name, factory);
    }

    pub fn unregister(&self, type_name: &str) -> bool {
        self.factories.write().remove(type_name).is_some()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.read().contains_key(type_name)
    }

    /// Run the type's factory
    pub fn create(&self, type_name: &str, args: &[Value]) -> Result<Arc<dyn RemoteObject>> {
        let factory = self
            .factories
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| RemotingError::ActivationFailed {
                type_name: type_name.to_string(),
                reason: "type is not registered for activation".into(),
            })?;
        factory(args).map_err(|e| match e {
            e @ RemotingError::ActivationFailed { .. } => e,
            other => RemotingError::ActivationFailed {
                type_name: type_name.to_string(),
                reason: other.to_string(),
            },
        })
    }
}
