//! Channel Tests - Calls Through Formatter Sinks
//!
//! A loopback channel serializes every call with a token formatter and
//! hands it to a server formatter sink in the same process, so both the
//! message level and the channel sink level are exercised.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::*;
use remoting::channel::{Channel, ServerChannelSink, ServerFormatterSink};
use remoting::{CallContext, RemoteObject, RemotingDomain, RemotingError, Value};

const URL: &str = "loop://host/app/x.rem";

struct Loopback {
    calc: Arc<Calculator>,
    formatter: Arc<TokenFormatter>,
    channel: Arc<LoopbackChannel>,
}

/// Publish a calculator at `app/x.rem` and register a loopback channel
/// reaching it
fn loopback(domain: &RemotingDomain, asynchronous: bool, audit: Option<&Arc<Mutex<Vec<String>>>>) -> Loopback {
    let calc = Calculator::new();
    let object: Arc<dyn RemoteObject> = calc.clone();
    domain.marshal_with_uri(object, "app/x.rem").unwrap();

    let formatter = TokenFormatter::new();
    let mut server: Arc<dyn ServerChannelSink> = if asynchronous {
        ServerFormatterSink::asynchronous(formatter.clone(), domain.dispatcher())
    } else {
        ServerFormatterSink::new(formatter.clone(), domain.dispatcher())
    };
    if let Some(log) = audit {
        server = AuditSink::new("audit", log, server);
    }
    let channel = LoopbackChannel::new(formatter.clone(), server, domain.pool().clone());
    domain.register_channel(channel.clone()).unwrap();
    Loopback {
        calc,
        formatter,
        channel,
    }
}

fn args(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| Value::from(*v)).collect()
}

/// Test: Synchronous calls survive serialization both ways
#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_sync_calls() {
    init_logging();
    let domain = test_domain("loop-sync");
    let lb = loopback(&domain, false, None);
    let proxy = domain.connect(URL, calculator_type());
    assert_eq!(proxy.uri(), "/app/x.rem");

    let mut ctx = CallContext::new();
    assert_eq!(proxy.invoke(&mut ctx, "add", args(&[20, 22])).unwrap(), Value::from(42));
    assert_eq!(
        proxy.invoke(&mut ctx, "div", args(&[1, 0])),
        Err(RemotingError::application("DivideByZero", "division by zero"))
    );

    ctx.set_logical_value("user", Value::from("bob"));
    assert_eq!(proxy.invoke(&mut ctx, "whoami", vec![]).unwrap(), Value::from("bob"));
    assert_eq!(ctx.get_value("seen_by"), Some(Value::from("calculator")));

    assert_eq!(lb.channel.requests(), 3);
    assert_eq!(lb.calc.calls.load(Ordering::SeqCst), 3);
    assert_eq!(lb.formatter.parked(), 0);
}

/// Test: A server formatter that dispatches asynchronously still answers
/// synchronous callers
#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_async_server() {
    init_logging();
    let domain = test_domain("loop-async-server");
    let lb = loopback(&domain, true, None);
    let proxy = domain.connect(URL, calculator_type());

    let mut ctx = CallContext::new();
    assert_eq!(proxy.invoke(&mut ctx, "add", args(&[1, 2, 3])).unwrap(), Value::from(6));
    assert_eq!(
        proxy.invoke(&mut ctx, "boom", vec![]),
        Err(RemotingError::TargetPanicked("calculator exploded".into()))
    );
    assert_eq!(lb.formatter.parked(), 0);
}

/// Test: Asynchronous calls come back through the client sink stack
#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_async_client() {
    init_logging();
    for asynchronous in [false, true] {
        let domain = test_domain(if asynchronous { "loop-async-both" } else { "loop-async-client" });
        let lb = loopback(&domain, asynchronous, None);
        let proxy = domain.connect(URL, calculator_type());

        let mut ctx = CallContext::new();
        let result = proxy.begin_invoke(&ctx, "add", args(&[5, 6]), None);
        assert!(result.wait_timeout(Duration::from_secs(5)));
        assert_eq!(proxy.end_invoke(&mut ctx, &result).unwrap(), Value::from(11));

        assert_eq!(proxy.call_async(&mut ctx, "slow", args(&[10])).await.unwrap(), Value::from(10));
        assert_eq!(lb.channel.requests(), 2);
        assert_eq!(lb.formatter.parked(), 0);
    }
}

/// Test: One-way calls cross the channel without a response
#[tokio::test(flavor = "multi_thread")]
async fn test_loopback_one_way() {
    init_logging();
    let domain = test_domain("loop-oneway");
    let lb = loopback(&domain, true, None);
    let proxy = domain.connect(URL, calculator_type());

    assert_eq!(
        proxy
            .invoke(&mut CallContext::new(), "log", vec![Value::from("over the wire")])
            .unwrap(),
        Value::Null
    );
    assert!(wait_until_async(Duration::from_secs(5), || !lb.calc.logged().is_empty()).await);
    assert_eq!(lb.calc.logged(), vec!["over the wire".to_string()]);
}

/// Test: A sink that stored its frame sees the response of an asynchronous
/// dispatch, with its state, before the transport does
#[tokio::test(flavor = "multi_thread")]
async fn test_stored_frame_sees_async_response() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let domain = test_domain("loop-audit-async");
    let _lb = loopback(&domain, true, Some(&log));
    let proxy = domain.connect(URL, calculator_type());

    assert_eq!(
        proxy.invoke(&mut CallContext::new(), "add", args(&[2, 2])).unwrap(),
        Value::from(4)
    );
    assert_eq!(*log.lock(), vec!["audit:async:audit".to_string()]);
}

/// Test: With a synchronous server formatter the response comes straight
/// back through the call stack
#[tokio::test(flavor = "multi_thread")]
async fn test_stored_frame_unused_on_sync_response() {
    init_logging();
    let log = Arc::new(Mutex::new(Vec::new()));
    let domain = test_domain("loop-audit-sync");
    let _lb = loopback(&domain, false, Some(&log));
    let proxy = domain.connect(URL, calculator_type());

    assert_eq!(
        proxy.invoke(&mut CallContext::new(), "add", args(&[3, 3])).unwrap(),
        Value::from(6)
    );
    assert_eq!(*log.lock(), vec!["audit:sync".to_string()]);
}

/// Test: A formatter failure is reported to the caller as a fault
#[tokio::test(flavor = "multi_thread")]
async fn test_formatter_failure_is_fault() {
    init_logging();
    let domain = test_domain("loop-formatter");
    let lb = loopback(&domain, false, None);
    let proxy = domain.connect(URL, calculator_type());
    lb.formatter.fail_serialize.store(true, Ordering::SeqCst);

    let mut ctx = CallContext::new();
    let expected = RemotingError::Formatter("serialization disabled".into());
    assert_eq!(proxy.invoke(&mut ctx, "add", args(&[1, 1])), Err(expected.clone()));

    let result = proxy.begin_invoke(&ctx, "add", args(&[1, 1]), None);
    assert!(result.wait_timeout(Duration::from_secs(5)));
    assert_eq!(proxy.end_invoke(&mut ctx, &result), Err(expected));

    assert_eq!(lb.channel.requests(), 0);
    assert_eq!(lb.calc.calls.load(Ordering::SeqCst), 0);

    lb.formatter.fail_serialize.store(false, Ordering::SeqCst);
    assert_eq!(proxy.invoke(&mut ctx, "add", args(&[1, 1])).unwrap(), Value::from(2));
}

/// Test: Channels are asked by priority and names are unique
#[tokio::test(flavor = "multi_thread")]
async fn test_channel_registration() {
    init_logging();
    let domain = test_domain("loop-registry");
    let lb = loopback(&domain, false, None);
    assert_eq!(domain.channels().channel_names(), vec!["xctx", "loop"]);
    assert_eq!(lb.channel.name(), "loop");

    let again = LoopbackChannel::new(
        TokenFormatter::new(),
        ServerFormatterSink::new(TokenFormatter::new(), domain.dispatcher()),
        domain.pool().clone(),
    );
    assert_eq!(
        domain.register_channel(again),
        Err(RemotingError::ChannelAlreadyRegistered("loop".into()))
    );

    let stranger = domain.connect("zzz://host/app/x.rem", calculator_type());
    assert_eq!(
        stranger.invoke(&mut CallContext::new(), "add", args(&[1, 1])),
        Err(RemotingError::NoChannelSink("zzz://host/app/x.rem".into()))
    );

    assert!(domain.channels().unregister("loop"));
    let orphan = domain.connect("loop://other/app/x.rem", calculator_type());
    assert_eq!(
        orphan.invoke(&mut CallContext::new(), "add", args(&[1, 1])),
        Err(RemotingError::NoChannelSink("loop://other/app/x.rem".into()))
    );
}

/// Test: The in-process channel reaches objects by their local URL
#[tokio::test(flavor = "multi_thread")]
async fn test_cross_context_url() {
    init_logging();
    let domain = test_domain("xctx-url");
    let object: Arc<dyn RemoteObject> = Calculator::new();
    let obj_ref = domain.marshal(object).unwrap();
    let url = domain.local_url(obj_ref.uri());
    assert!(url.starts_with("xctx://xctx-url/"));

    let proxy = domain.connect(&url, calculator_type());
    assert_eq!(
        proxy.invoke(&mut CallContext::new(), "add", args(&[7, 8])).unwrap(),
        Value::from(15)
    );
}
