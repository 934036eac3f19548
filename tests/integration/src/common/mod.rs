//! Common test utilities for integration tests
//!
//! Provides test objects, sponsors, dynamic sinks and an in-memory
//! loopback channel built from the formatter sinks.

#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::Level;

use remoting::channel::{
    Channel, ChannelMessage, ClientChannelSink, ClientFormatterSink, ClientSinkStack, Formatter, ServerChannelSink,
    ServerProcessing, ServerSinkStack, SinkState, TransportHeaders,
};
use remoting::sink::DynamicMessageSink;
use remoting::{
    CallContext, Lease, Message, MessageSink, MethodDescriptor, RemoteObject, RemotingConfig, RemotingDomain,
    RemotingError, Result, Sponsor, TypeInfo, Value, WorkerPool,
};

/// Initialize logging for tests
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::WARN)
        .with_test_writer()
        .try_init();
}

/// Domain with default lifetime settings
pub fn test_domain(name: &str) -> RemotingDomain {
    RemotingDomain::new(RemotingConfig::new(name)).unwrap()
}

/// Poll `check` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Async variant of [`wait_until`]
pub async fn wait_until_async(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

// ============================================================================
// Test objects
// ============================================================================

/// Contract of [`Calculator`]
pub fn calculator_type() -> TypeInfo {
    TypeInfo::new("Calculator")
        .method("add", 2)
        .method("add", 3)
        .method("div", 2)
        .method("boom", 0)
        .method("whoami", 0)
        .method("slow", 1)
        .method("count", 0)
        .one_way_method("log", 1)
}

/// Remote object used by most tests
#[derive(Default)]
pub struct Calculator {
    pub calls: AtomicUsize,
    pub logged: Mutex<Vec<String>>,
}

impl Calculator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn logged(&self) -> Vec<String> {
        self.logged.lock().clone()
    }
}

fn int_arg(args: &[Value], index: usize) -> Result<i64> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| RemotingError::application("ArgumentError", format!("argument {} must be an integer", index)))
}

impl RemoteObject for Calculator {
    fn type_name(&self) -> &str {
        "Calculator"
    }

    fn invoke(&self, method: &MethodDescriptor, args: &[Value], ctx: &mut CallContext) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match (method.name(), args.len()) {
            ("add", 2) => Ok(Value::from(int_arg(args, 0)? + int_arg(args, 1)?)),
            ("add", 3) => Ok(Value::from(int_arg(args, 0)? + int_arg(args, 1)? + int_arg(args, 2)?)),
            ("div", _) => {
                let divisor = int_arg(args, 1)?;
                if divisor == 0 {
                    return Err(RemotingError::application("DivideByZero", "division by zero"));
                }
                Ok(Value::from(int_arg(args, 0)? / divisor))
            }
            ("boom", _) => panic!("calculator exploded"),
            ("whoami", _) => {
                let user = ctx.get_value("user").unwrap_or_default();
                ctx.set_logical_value("seen_by", Value::from("calculator"));
                Ok(user)
            }
            ("slow", _) => {
                let millis = int_arg(args, 0)?;
                std::thread::sleep(Duration::from_millis(millis as u64));
                Ok(Value::from(millis))
            }
            ("count", _) => Ok(Value::from(self.calls.load(Ordering::SeqCst) as i64)),
            ("log", _) => {
                let text = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
                self.logged.lock().push(text);
                Ok(Value::Null)
            }
            (other, _) => Err(RemotingError::MethodNotFound(other.to_string())),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Contract of [`Counter`]
pub fn counter_type() -> TypeInfo {
    TypeInfo::new("Counter").method("next", 0)
}

/// Counter with a configurable lifetime
pub struct Counter {
    value: AtomicI64,
    /// Replaces the default lease time; `None` keeps it, zero opts out
    lease_time: Option<Duration>,
}

impl Counter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            value: AtomicI64::new(0),
            lease_time: None,
        })
    }

    pub fn with_lease_time(lease_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            value: AtomicI64::new(0),
            lease_time: Some(lease_time),
        })
    }
}

impl RemoteObject for Counter {
    fn type_name(&self) -> &str {
        "Counter"
    }

    fn invoke(&self, method: &MethodDescriptor, _args: &[Value], _ctx: &mut CallContext) -> Result<Value> {
        match method.name() {
            "next" => Ok(Value::from(self.value.fetch_add(1, Ordering::SeqCst) + 1)),
            other => Err(RemotingError::MethodNotFound(other.to_string())),
        }
    }

    fn initialize_lifetime_service(&self, lease: Lease) -> Option<Lease> {
        match self.lease_time {
            Some(time) if time.is_zero() => None,
            Some(time) => {
                lease.set_initial_lease_time(time).ok()?;
                Some(lease)
            }
            None => Some(lease),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Sponsors
// ============================================================================

/// Sponsor answering with a fixed renewal, or declining after `limit` calls
pub struct FixedSponsor {
    renewal: Duration,
    limit: usize,
    pub calls: AtomicUsize,
}

impl FixedSponsor {
    pub fn new(renewal: Duration) -> Arc<Self> {
        Self::limited(renewal, usize::MAX)
    }

    pub fn limited(renewal: Duration, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            renewal,
            limit,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Sponsor for FixedSponsor {
    fn renewal(&self, _lease: &Lease) -> Result<Duration> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.limit {
            Ok(self.renewal)
        } else {
            Ok(Duration::ZERO)
        }
    }
}

/// Sponsor that always fails
#[derive(Default)]
pub struct FailingSponsor {
    pub calls: AtomicUsize,
}

impl Sponsor for FailingSponsor {
    fn renewal(&self, _lease: &Lease) -> Result<Duration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RemotingError::application("SponsorError", "sponsor unavailable"))
    }
}

/// Sponsor that answers only after `delay`
pub struct SlowSponsor {
    pub delay: Duration,
    pub renewal: Duration,
    pub calls: AtomicUsize,
}

impl Sponsor for SlowSponsor {
    fn renewal(&self, _lease: &Lease) -> Result<Duration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(self.renewal)
    }
}

// ============================================================================
// Dynamic sinks
// ============================================================================

/// Dynamic sink writing "start"/"finish" events to a shared log
pub struct RecordingDynamicSink {
    pub label: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl RecordingDynamicSink {
    pub fn new(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self { label, log: log.clone() })
    }
}

fn side(client_side: bool) -> &'static str {
    if client_side {
        "client"
    } else {
        "server"
    }
}

impl DynamicMessageSink for RecordingDynamicSink {
    fn process_message_start(&self, _msg: &Message, client_side: bool, _is_async: bool) {
        self.log
            .lock()
            .push(format!("{}:start:{}", self.label, side(client_side)));
    }

    fn process_message_finish(&self, _reply: &Message, client_side: bool, _is_async: bool) {
        self.log
            .lock()
            .push(format!("{}:finish:{}", self.label, side(client_side)));
    }
}

// ============================================================================
// Loopback channel
// ============================================================================

/// Formatter keeping messages in a side table; the stream carries a token
#[derive(Default)]
pub struct TokenFormatter {
    next: AtomicU64,
    parked: Mutex<HashMap<u64, Message>>,
    pub fail_serialize: std::sync::atomic::AtomicBool,
}

impl TokenFormatter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn parked(&self) -> usize {
        self.parked.lock().len()
    }
}

impl Formatter for TokenFormatter {
    fn serialize_message(&self, msg: &Message, headers: &mut TransportHeaders) -> Result<Bytes> {
        if self.fail_serialize.load(Ordering::SeqCst) {
            return Err(RemotingError::Formatter("serialization disabled".into()));
        }
        let token = self.next.fetch_add(1, Ordering::SeqCst);
        self.parked.lock().insert(token, msg.clone());
        headers.set("Content-Type", "application/x-token");
        Ok(Bytes::copy_from_slice(&token.to_be_bytes()))
    }

    fn deserialize_message(&self, stream: &Bytes, headers: &TransportHeaders) -> Result<Message> {
        if headers.get("Content-Type") != Some("application/x-token") {
            return Err(RemotingError::Formatter("unexpected content type".into()));
        }
        let bytes: [u8; 8] = stream
            .as_ref()
            .try_into()
            .map_err(|_| RemotingError::Formatter("bad token length".into()))?;
        self.parked
            .lock()
            .remove(&u64::from_be_bytes(bytes))
            .ok_or_else(|| RemotingError::Formatter("unknown token".into()))
    }
}

/// Client transport handing requests straight to a server channel sink
pub struct LoopbackTransportSink {
    server: Arc<dyn ServerChannelSink>,
    pool: WorkerPool,
    pub requests: AtomicUsize,
}

impl LoopbackTransportSink {
    pub fn new(server: Arc<dyn ServerChannelSink>, pool: WorkerPool) -> Arc<Self> {
        Arc::new(Self {
            server,
            pool,
            requests: AtomicUsize::new(0),
        })
    }
}

impl ClientChannelSink for LoopbackTransportSink {
    fn process_message(&self, request: ChannelMessage) -> Result<ChannelMessage> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = std::sync::mpsc::channel();
        let stack = ServerSinkStack::with_responder(move |response| {
            let _ = tx.send(response);
        });
        match self.server.process_message(&stack, request)? {
            ServerProcessing::Complete(response) => Ok(response),
            ServerProcessing::OneWay => Ok(ChannelMessage::default()),
            ServerProcessing::Async => rx
                .recv_timeout(Duration::from_secs(10))
                .map_err(|e| RemotingError::Channel(e.to_string())),
        }
    }

    fn async_process_request(&self, stack: &Arc<ClientSinkStack>, request: ChannelMessage) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let server = self.server.clone();
        let client = stack.clone();
        self.pool.execute(move || {
            let replies = client.clone();
            let server_stack = ServerSinkStack::with_responder(move |response| {
                let _ = replies.async_process_response(response);
            });
            match server.process_message(&server_stack, request) {
                Ok(ServerProcessing::Complete(response)) => {
                    let _ = client.async_process_response(response);
                }
                Ok(ServerProcessing::OneWay) | Ok(ServerProcessing::Async) => {}
                Err(e) => client.dispatch_exception(e),
            }
        });
        Ok(())
    }

    fn async_process_response(
        &self,
        stack: &Arc<ClientSinkStack>,
        _state: Option<SinkState>,
        response: ChannelMessage,
    ) -> Result<()> {
        stack.async_process_response(response)
    }

    fn next_channel_sink(&self) -> Option<Arc<dyn ClientChannelSink>> {
        None
    }

    fn name(&self) -> &'static str {
        "LoopbackTransportSink"
    }
}

/// Channel for `loop://` URLs, served in-process through the formatter sinks
pub struct LoopbackChannel {
    formatter: Arc<dyn Formatter>,
    transport: Arc<LoopbackTransportSink>,
}

pub const LOOPBACK_PREFIX: &str = "loop://";

impl LoopbackChannel {
    pub fn new(formatter: Arc<dyn Formatter>, server: Arc<dyn ServerChannelSink>, pool: WorkerPool) -> Arc<Self> {
        Arc::new(Self {
            formatter,
            transport: LoopbackTransportSink::new(server, pool),
        })
    }

    pub fn requests(&self) -> usize {
        self.transport.requests.load(Ordering::SeqCst)
    }
}

impl Channel for LoopbackChannel {
    fn name(&self) -> &str {
        "loop"
    }

    fn create_message_sink(&self, url: &str) -> Option<Arc<dyn MessageSink>> {
        if !url.starts_with(LOOPBACK_PREFIX) {
            return None;
        }
        let sink: Arc<dyn MessageSink> = ClientFormatterSink::new(self.formatter.clone(), self.transport.clone());
        Some(sink)
    }
}

/// Server channel sink recording the responses it sees on the way back
pub struct AuditSink {
    pub label: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
    pub next: Arc<dyn ServerChannelSink>,
    self_ref: std::sync::Weak<AuditSink>,
}

impl AuditSink {
    pub fn new(label: &'static str, log: &Arc<Mutex<Vec<String>>>, next: Arc<dyn ServerChannelSink>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            label,
            log: log.clone(),
            next,
            self_ref: self_ref.clone(),
        })
    }
}

impl ServerChannelSink for AuditSink {
    fn process_message(&self, stack: &Arc<ServerSinkStack>, request: ChannelMessage) -> Result<ServerProcessing> {
        let this: Arc<dyn ServerChannelSink> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| RemotingError::Channel("audit sink dropped".into()))?;
        stack.push(this.clone(), Some(Box::new(self.label)));
        // Stored before going down, so an asynchronous dispatch below can
        // bring the frame back.
        stack.store(&this, Some(Box::new(self.label)))?;
        let outcome = self.next.process_message(stack, request)?;
        if let ServerProcessing::Complete(_) | ServerProcessing::OneWay = &outcome {
            self.log.lock().push(format!("{}:sync", self.label));
        }
        Ok(outcome)
    }

    fn async_process_response(
        &self,
        stack: &Arc<ServerSinkStack>,
        state: Option<SinkState>,
        response: ChannelMessage,
    ) -> Result<()> {
        let tag = state
            .and_then(|s| s.downcast::<&'static str>().ok())
            .map(|s| *s)
            .unwrap_or("-");
        self.log.lock().push(format!("{}:async:{}", self.label, tag));
        stack.async_process_response(response)
    }

    fn next_channel_sink(&self) -> Option<Arc<dyn ServerChannelSink>> {
        Some(self.next.clone())
    }

    fn name(&self) -> &'static str {
        "AuditSink"
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Thread-safe counters for concurrent tests
pub struct ConcurrentStats {
    success: AtomicU64,
    failure: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl ConcurrentStats {
    pub fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            max_latency_us: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        let us = latency.as_micros() as u64;
        self.success.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        let count = self.success_count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed) / count)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_micros(self.max_latency_us.load(Ordering::Relaxed))
    }
}

impl Default for ConcurrentStats {
    fn default() -> Self {
        Self::new()
    }
}
