//! Logical call context
//!
//! Ambient data attached to a logical call. The context is passed explicitly
//! with every call; what crosses a call boundary is decided per value:
//!
//! - data whose [`ContextData::flows_across_boundaries`] is `true` lives in
//!   the logical store and travels with outgoing messages
//! - everything else lives in the local store and never leaves the caller
//!
//! The principal (identity/security data) travels with the context but is
//! never merged back from a reply.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// Data that can be stored in a [`CallContext`]
pub trait ContextData: fmt::Debug + Send + Sync + 'static {
    /// Affinity marker. Only data returning `true` crosses call boundaries.
    fn flows_across_boundaries(&self) -> bool {
        false
    }

    /// Independent copy for handoff, or `None` to share the value.
    fn deep_clone(&self) -> Option<Arc<dyn ContextData>> {
        None
    }

    /// Cast to Any for downcasting
    fn as_any(&self) -> &dyn Any;
}

impl ContextData for Value {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A [`Value`] marked to flow across call boundaries
#[derive(Clone, Debug, PartialEq)]
pub struct LogicalValue(pub Value);

impl ContextData for LogicalValue {
    fn flows_across_boundaries(&self) -> bool {
        true
    }

    fn deep_clone(&self) -> Option<Arc<dyn ContextData>> {
        Some(Arc::new(self.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Call context for a logical call
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    logical: HashMap<String, Arc<dyn ContextData>>,
    local: HashMap<String, Arc<dyn ContextData>>,
    principal: Option<String>,
}

impl CallContext {
    /// Create an empty call context
    pub fn new() -> Self {
        Self::default()
    }

    /// Store data under `key`; the data's affinity picks the store
    pub fn set_data(&mut self, key: impl Into<String>, data: Arc<dyn ContextData>) {
        let key = key.into();
        if data.flows_across_boundaries() {
            self.local.remove(&key);
            self.logical.insert(key, data);
        } else {
            self.logical.remove(&key);
            self.local.insert(key, data);
        }
    }

    /// Store a value that stays with the caller
    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        self.set_data(key, Arc::new(value));
    }

    /// Store a value that flows with outgoing calls
    pub fn set_logical_value(&mut self, key: impl Into<String>, value: Value) {
        self.set_data(key, Arc::new(LogicalValue(value)));
    }

    /// Look up data; logical entries shadow local ones
    pub fn get_data(&self, key: &str) -> Option<Arc<dyn ContextData>> {
        self.logical
            .get(key)
            .or_else(|| self.local.get(key))
            .cloned()
    }

    /// Look up a plain value stored with `set_value` or `set_logical_value`
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let data = self.get_data(key)?;
        let any = data.as_any();
        if let Some(v) = any.downcast_ref::<LogicalValue>() {
            return Some(v.0.clone());
        }
        any.downcast_ref::<Value>().cloned()
    }

    /// Remove `key` from both stores
    pub fn free_named_data_slot(&mut self, key: &str) {
        self.logical.remove(key);
        self.local.remove(key);
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn set_principal(&mut self, principal: Option<String>) {
        self.principal = principal;
    }

    /// Whether any data would flow with an outgoing call
    pub fn has_user_data(&self) -> bool {
        !self.logical.is_empty()
    }

    /// Keys of the logical store
    pub fn logical_keys(&self) -> impl Iterator<Item = &str> {
        self.logical.keys().map(String::as_str)
    }

    /// Copy of the part of this context that crosses a call boundary
    ///
    /// Logical entries are shared unless their type offers a deep clone.
    /// Local data is left behind.
    pub fn clone_for_handoff(&self) -> CallContext {
        let logical = self
            .logical
            .iter()
            .map(|(k, v)| (k.clone(), v.deep_clone().unwrap_or_else(|| v.clone())))
            .collect();
        CallContext {
            logical,
            local: HashMap::new(),
            principal: self.principal.clone(),
        }
    }

    /// Merge the context returned by a call back into this one
    ///
    /// Only logical user data is taken over. The principal is never copied
    /// from a reply.
    pub fn merge(&mut self, returned: &CallContext) {
        for (key, value) in &returned.logical {
            self.local.remove(key);
            self.logical.insert(key.clone(), value.clone());
        }
    }
}
