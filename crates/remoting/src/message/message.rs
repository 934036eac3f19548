//! Call and reply messages

use std::collections::HashMap;

use crate::error::{RemotingError, Result};
use crate::value::{ObjRef, Value};

use super::call_context::CallContext;
use super::method::MethodDescriptor;

/// Reserved property keys answered from the message itself
pub mod keys {
    /// Target URI
    pub const URI: &str = "__Uri";
    /// Method name
    pub const METHOD_NAME: &str = "__MethodName";
    /// Type name of the target or of the type being activated
    pub const TYPE_NAME: &str = "__TypeName";
    /// Set on replies to construction calls
    pub const CONSTRUCTION: &str = "__Construction";
}

fn is_reserved(key: &str) -> bool {
    matches!(
        key,
        keys::URI | keys::METHOD_NAME | keys::TYPE_NAME | keys::CONSTRUCTION
    )
}

/// Out-of-band header carried with a call
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: Value,
    pub must_understand: bool,
}

impl Header {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            must_understand: false,
        }
    }
}

/// A method invocation
///
/// The target URI and the method are fixed when the call is built; sinks
/// in transit may only change the property bag, the headers and the call
/// context.
#[derive(Clone, Debug)]
pub struct MethodCall {
    uri: String,
    method: MethodDescriptor,
    args: Vec<Value>,
    properties: HashMap<String, Value>,
    headers: Vec<Header>,
    call_context: CallContext,
}

impl MethodCall {
    /// Create a call with an empty call context
    pub fn new(uri: impl Into<String>, method: MethodDescriptor, args: Vec<Value>) -> Self {
        Self {
            uri: uri.into(),
            method,
            args,
            properties: HashMap::new(),
            headers: Vec::new(),
            call_context: CallContext::new(),
        }
    }

    /// Attach a call context snapshot
    pub fn with_call_context(mut self, call_context: CallContext) -> Self {
        self.call_context = call_context;
        self
    }

    /// Attach out-of-band headers
    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn method_name(&self) -> &str {
        self.method.name()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn is_one_way(&self) -> bool {
        self.method.is_one_way()
    }

    /// Read a property; reserved keys are answered from the call itself
    pub fn property(&self, key: &str) -> Option<Value> {
        match key {
            keys::URI => Some(Value::from(self.uri.as_str())),
            keys::METHOD_NAME => Some(Value::from(self.method.name())),
            keys::TYPE_NAME => Some(Value::from(self.method.type_name())),
            _ => self.properties.get(key).cloned(),
        }
    }

    /// Set a property. Returns false for reserved keys, which are read-only.
    pub fn set_property(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if is_reserved(&key) {
            return false;
        }
        self.properties.insert(key, value);
        true
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn add_header(&mut self, header: Header) {
        self.headers.push(header);
    }

    pub fn call_context(&self) -> &CallContext {
        &self.call_context
    }

    pub fn call_context_mut(&mut self) -> &mut CallContext {
        &mut self.call_context
    }
}

/// Activation request for a registered type
#[derive(Clone, Debug)]
pub struct ConstructionCall {
    type_name: String,
    args: Vec<Value>,
    properties: HashMap<String, Value>,
    call_context: CallContext,
}

impl ConstructionCall {
    pub fn new(type_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            type_name: type_name.into(),
            args,
            properties: HashMap::new(),
            call_context: CallContext::new(),
        }
    }

    pub fn with_call_context(mut self, call_context: CallContext) -> Self {
        self.call_context = call_context;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        match key {
            keys::TYPE_NAME => Some(Value::from(self.type_name.as_str())),
            _ => self.properties.get(key).cloned(),
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if is_reserved(&key) {
            return false;
        }
        self.properties.insert(key, value);
        true
    }

    pub fn call_context(&self) -> &CallContext {
        &self.call_context
    }

    pub fn call_context_mut(&mut self) -> &mut CallContext {
        &mut self.call_context
    }
}

/// Reply to a call: a return value or a fault
#[derive(Clone, Debug)]
pub struct ReturnMessage {
    outcome: Result<Value>,
    out_args: Vec<Value>,
    properties: HashMap<String, Value>,
    call_context: CallContext,
    method: Option<MethodDescriptor>,
    uri: Option<String>,
    construction: bool,
}

impl ReturnMessage {
    fn with_outcome(outcome: Result<Value>, call_context: CallContext) -> Self {
        Self {
            outcome,
            out_args: Vec::new(),
            properties: HashMap::new(),
            call_context,
            method: None,
            uri: None,
            construction: false,
        }
    }

    /// Normal return carrying `value`
    pub fn ok(value: Value, call_context: CallContext) -> Self {
        Self::with_outcome(Ok(value), call_context)
    }

    /// Exception-carrying reply
    pub fn fault(error: RemotingError, call_context: CallContext) -> Self {
        Self::with_outcome(Err(error), call_context)
    }

    /// Reply to `call`, keeping its target, method and call context
    pub fn for_call(call: &MethodCall, outcome: Result<Value>) -> Self {
        let mut reply = Self::with_outcome(outcome, call.call_context.clone());
        reply.method = Some(call.method.clone());
        reply.uri = Some(call.uri.clone());
        reply
    }

    /// Construction-return: the new object's reference
    pub fn construction(obj_ref: ObjRef, call_context: CallContext) -> Self {
        let mut reply = Self::ok(Value::Object(obj_ref), call_context);
        reply.construction = true;
        reply
    }

    pub fn with_out_args(mut self, out_args: Vec<Value>) -> Self {
        self.out_args = out_args;
        self
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn exception(&self) -> Option<&RemotingError> {
        self.outcome.as_ref().err()
    }

    pub fn is_fault(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn is_construction(&self) -> bool {
        self.construction
    }

    pub fn out_args(&self) -> &[Value] {
        &self.out_args
    }

    pub fn method(&self) -> Option<&MethodDescriptor> {
        self.method.as_ref()
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        match key {
            keys::URI => self.uri.as_deref().map(Value::from),
            keys::METHOD_NAME => self.method.as_ref().map(|m| Value::from(m.name())),
            keys::CONSTRUCTION => Some(Value::Bool(self.construction)),
            _ => self.properties.get(key).cloned(),
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if is_reserved(&key) {
            return false;
        }
        self.properties.insert(key, value);
        true
    }

    pub fn call_context(&self) -> &CallContext {
        &self.call_context
    }

    pub fn call_context_mut(&mut self) -> &mut CallContext {
        &mut self.call_context
    }

    /// Unwrap the reply into the value or the carried error
    pub fn into_result(self) -> Result<Value> {
        self.outcome
    }

    /// Split into the outcome and the returned call context
    pub fn into_parts(self) -> (Result<Value>, CallContext) {
        (self.outcome, self.call_context)
    }
}

/// Any message travelling through a sink chain
#[derive(Clone, Debug)]
pub enum Message {
    Call(MethodCall),
    Construct(ConstructionCall),
    Return(ReturnMessage),
}

impl Message {
    /// A fault reply with an empty call context
    pub fn fault(error: RemotingError) -> Self {
        Message::Return(ReturnMessage::fault(error, CallContext::new()))
    }

    /// A fault reply to `request`, carrying its call context back
    pub fn fault_for(request: &Message, error: RemotingError) -> Self {
        match request {
            Message::Call(call) => Message::Return(ReturnMessage::for_call(call, Err(error))),
            other => Message::Return(ReturnMessage::fault(error, other.call_context().clone())),
        }
    }

    /// Target URI, if the message names one
    pub fn uri(&self) -> Option<&str> {
        match self {
            Message::Call(call) => Some(call.uri()),
            Message::Return(ret) => ret.uri(),
            Message::Construct(_) => None,
        }
    }

    pub fn method(&self) -> Option<&MethodDescriptor> {
        match self {
            Message::Call(call) => Some(call.method()),
            Message::Return(ret) => ret.method(),
            Message::Construct(_) => None,
        }
    }

    pub fn is_one_way(&self) -> bool {
        matches!(self, Message::Call(call) if call.is_one_way())
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Message::Return(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Message::Return(ret) if ret.is_fault())
    }

    /// Error carried by a fault reply
    pub fn exception(&self) -> Option<&RemotingError> {
        match self {
            Message::Return(ret) => ret.exception(),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&MethodCall> {
        match self {
            Message::Call(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_return(&self) -> Option<&ReturnMessage> {
        match self {
            Message::Return(ret) => Some(ret),
            _ => None,
        }
    }

    /// Convert into a reply; a request in reply position is a fault
    pub fn into_return(self) -> ReturnMessage {
        match self {
            Message::Return(ret) => ret,
            other => {
                let ctx = other.call_context().clone();
                ReturnMessage::fault(
                    RemotingError::InvalidMessage("expected a reply message".into()),
                    ctx,
                )
            }
        }
    }

    pub fn call_context(&self) -> &CallContext {
        match self {
            Message::Call(call) => call.call_context(),
            Message::Construct(ctor) => ctor.call_context(),
            Message::Return(ret) => ret.call_context(),
        }
    }

    pub fn call_context_mut(&mut self) -> &mut CallContext {
        match self {
            Message::Call(call) => call.call_context_mut(),
            Message::Construct(ctor) => ctor.call_context_mut(),
            Message::Return(ret) => ret.call_context_mut(),
        }
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        match self {
            Message::Call(call) => call.property(key),
            Message::Construct(ctor) => ctor.property(key),
            Message::Return(ret) => ret.property(key),
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: Value) -> bool {
        match self {
            Message::Call(call) => call.set_property(key, value),
            Message::Construct(ctor) => ctor.set_property(key, value),
            Message::Return(ret) => ret.set_property(key, value),
        }
    }
}

impl From<MethodCall> for Message {
    fn from(call: MethodCall) -> Self {
        Message::Call(call)
    }
}

impl From<ConstructionCall> for Message {
    fn from(ctor: ConstructionCall) -> Self {
        Message::Construct(ctor)
    }
}

impl From<ReturnMessage> for Message {
    fn from(ret: ReturnMessage) -> Self {
        Message::Return(ret)
    }
}
