//! Method metadata

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{RemotingError, Result};

/// Method answered locally by every proxy: the target's type name
pub const GET_TYPE: &str = "get_type";

/// Method answered locally by every proxy: a hash of the target identity
pub const GET_HASH_CODE: &str = "get_hash_code";

/// Describes one remotely callable method
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    type_name: String,
    name: String,
    param_count: usize,
    one_way: bool,
}

impl MethodDescriptor {
    /// Create a request/reply method descriptor
    pub fn new(type_name: impl Into<String>, name: impl Into<String>, param_count: usize) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
            param_count,
            one_way: false,
        }
    }

    /// Mark the method as one-way (no reply expected)
    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    /// Whether this is one of the methods every proxy answers locally
    pub fn is_universal(&self) -> bool {
        self.name == GET_TYPE || self.name == GET_HASH_CODE
    }
}

/// Remotely visible contract of a type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    type_name: String,
    methods: Vec<MethodDescriptor>,
}

impl TypeInfo {
    /// Create an empty contract for `type_name`
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            methods: Vec::new(),
        }
    }

    /// Add a request/reply method
    pub fn method(mut self, name: impl Into<String>, param_count: usize) -> Self {
        let descriptor = MethodDescriptor::new(self.type_name.clone(), name, param_count);
        self.methods.push(descriptor);
        self
    }

    /// Add a one-way method
    pub fn one_way_method(mut self, name: impl Into<String>, param_count: usize) -> Self {
        let descriptor = MethodDescriptor::new(self.type_name.clone(), name, param_count).one_way();
        self.methods.push(descriptor);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }
}

/// How a call is driven through the sink chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// Caller blocks for the reply
    Sync,
    /// Caller gets a pending result back immediately
    BeginAsync,
    /// No reply expected
    OneWay,
    /// Caller collects the reply of an earlier BeginAsync
    EndAsync,
}

impl CallKind {
    /// Classify a call from the method metadata and the calling convention
    pub fn classify(method: &MethodDescriptor, begin: bool) -> Self {
        if method.is_one_way() {
            CallKind::OneWay
        } else if begin {
            CallKind::BeginAsync
        } else {
            CallKind::Sync
        }
    }
}

/// Cached resolution of a method name
#[derive(Clone, Debug)]
pub struct MethodMetadata {
    pub descriptor: MethodDescriptor,
    /// Other methods share the name (with a different arity)
    pub overloaded: bool,
}

/// Per-type method lookup cache
pub struct MethodCache {
    type_info: TypeInfo,
    resolved: RwLock<HashMap<(String, usize), Arc<MethodMetadata>>>,
}

impl MethodCache {
    /// Create a cache over a type contract
    pub fn new(type_info: TypeInfo) -> Self {
        Self {
            type_info,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.type_info
    }

    /// Resolve a method by name and argument count
    pub fn resolve(&self, name: &str, arity: usize) -> Result<Arc<MethodMetadata>> {
        if let Some(found) = self.resolved.read().get(&(name.to_string(), arity)) {
            return Ok(found.clone());
        }

        let named: Vec<&MethodDescriptor> = self
            .type_info
            .methods()
            .iter()
            .filter(|m| m.name() == name)
            .collect();
        let matching: Vec<&MethodDescriptor> = named
            .iter()
            .copied()
            .filter(|m| m.param_count() == arity)
            .collect();

        let descriptor = match matching.as_slice() {
            [] => {
                return Err(RemotingError::MethodNotFound(format!(
                    "{}.{}/{}",
                    self.type_info.type_name(),
                    name,
                    arity
                )))
            }
            [one] => (*one).clone(),
            many => {
                return Err(RemotingError::AmbiguousMethod {
                    name: name.to_string(),
                    arity,
                    candidates: many.len(),
                })
            }
        };

        let metadata = Arc::new(MethodMetadata {
            descriptor,
            overloaded: named.len() > 1,
        });
        self.resolved
            .write()
            .insert((name.to_string(), arity), metadata.clone());
        Ok(metadata)
    }

    /// Descriptor for a universal method, which needs no contract entry
    pub fn universal(&self, name: &str) -> Option<MethodDescriptor> {
        (name == GET_TYPE || name == GET_HASH_CODE)
            .then(|| MethodDescriptor::new(self.type_info.type_name(), name, 0))
    }
}
