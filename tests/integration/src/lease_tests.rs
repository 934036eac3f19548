//! Lease Tests - Object Lifetime Through Leases and Sponsors
//!
//! The lease manager is driven by hand with chosen clock readings, so the
//! tests do not wait for real lease times to pass. Sponsor calls still run
//! on the worker pool and are waited for.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use common::*;
use remoting::{
    CallContext, ClientSponsor, Lease, LeaseManager, LeaseState, Message, MethodCall, MethodDescriptor, RemoteObject,
    RemotingConfig, RemotingDomain, RemotingError, ServerState, Sponsor, Value, WorkerPool,
};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn millis(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn domain(name: &str, config: impl FnOnce(RemotingConfig) -> RemotingConfig) -> RemotingDomain {
    RemotingDomain::new(config(RemotingConfig::new(name))).unwrap()
}

/// Standalone lease counting how often its expiry handler ran
fn activated_lease(manager: &LeaseManager, lease: Lease) -> (Arc<Lease>, Arc<AtomicUsize>) {
    let lease = Arc::new(lease);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    lease
        .activate(manager, WorkerPool::current().unwrap(), "/lease/test.rem", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    (lease, fired)
}

/// Test: With a zero sponsorship timeout sponsors are refused and the
/// object is disconnected when its time runs out
#[tokio::test(flavor = "multi_thread")]
async fn test_scenario_a_sponsorship_disabled() {
    init_logging();
    let domain = domain("scenario-a", |c| {
        c.with_lease_time(secs(5))
            .with_renew_on_call_time(secs(2))
            .with_sponsorship_timeout(Duration::ZERO)
    });
    let object: Arc<dyn RemoteObject> = Counter::new();
    let obj_ref = domain.marshal(object.clone()).unwrap();
    let lease = domain.lease_of(&object).unwrap();
    assert_eq!(lease.state(), LeaseState::Active);

    let sponsor = FixedSponsor::new(secs(10));
    assert!(!lease.register(sponsor.clone()));
    assert_eq!(lease.sponsor_count(), 0);

    let summary = domain.lease_manager().poll(Instant::now() + secs(6));
    assert_eq!(summary.expired, 1);
    assert_eq!(lease.state(), LeaseState::Expired);
    assert_eq!(sponsor.calls(), 0);

    let identity = domain.server_identity(obj_ref.uri()).unwrap();
    assert_eq!(identity.state(), ServerState::FullyDisconnected);
    let proxy = domain.unmarshal(&obj_ref, counter_type());
    assert_eq!(
        proxy.invoke(&mut CallContext::new(), "next", vec![]),
        Err(RemotingError::Disconnected(obj_ref.uri().to_string()))
    );
}

/// Test: A sponsor's renewal sets the expiry to now plus the renewal
#[tokio::test(flavor = "multi_thread")]
async fn test_scenario_b_sponsor_renews() {
    init_logging();
    let domain = domain("scenario-b", |c| c.with_lease_time(secs(1)));
    let object: Arc<dyn RemoteObject> = Counter::new();
    let obj_ref = domain.marshal(object.clone()).unwrap();
    let lease = domain.lease_of(&object).unwrap();

    let sponsor = FixedSponsor::new(secs(10));
    assert!(lease.register(sponsor.clone()));

    let summary = domain.lease_manager().poll(Instant::now() + secs(2));
    assert_eq!(summary.expired, 1);
    let manager = domain.lease_manager();
    assert!(wait_until(secs(5), || {
        lease.state() == LeaseState::Active && manager.is_tracked(lease.id()) && manager.pending_sponsor_calls() == 0
    }));
    assert_eq!(sponsor.calls(), 1);

    let expiry = lease.expiry().unwrap();
    assert!(expiry <= Instant::now() + secs(10));
    assert!(expiry > Instant::now() + secs(9));

    let proxy = domain.unmarshal(&obj_ref, counter_type());
    assert_eq!(
        proxy.invoke(&mut CallContext::new(), "next", vec![]).unwrap(),
        Value::from(1)
    );
}

/// Test: A sponsor that stops renewing lets the lease expire on the next
/// round
#[tokio::test(flavor = "multi_thread")]
async fn test_sponsor_declines_later() {
    init_logging();
    let manager = LeaseManager::new(secs(10));
    let (lease, fired) = activated_lease(&manager, Lease::new(secs(1), Duration::ZERO, secs(2)));
    let sponsor = FixedSponsor::limited(secs(3), 1);
    assert!(lease.register(sponsor.clone()));

    manager.poll(Instant::now() + secs(2));
    assert!(wait_until(secs(5), || {
        lease.state() == LeaseState::Active && manager.is_tracked(lease.id())
    }));

    manager.poll(Instant::now() + secs(5));
    assert!(wait_until(secs(5), || fired.load(Ordering::SeqCst) == 1));
    assert_eq!(lease.state(), LeaseState::Expired);
    assert_eq!(sponsor.calls(), 2);
    assert_eq!(lease.sponsor_count(), 0);
}

/// Test: Sponsors that all fail are each asked once and the lease expires
/// exactly once
#[tokio::test(flavor = "multi_thread")]
async fn test_failing_sponsors_expire_once() {
    init_logging();
    let manager = LeaseManager::new(secs(10));
    let (lease, fired) = activated_lease(&manager, Lease::new(millis(50), Duration::ZERO, secs(2)));

    let sponsors: Vec<Arc<FailingSponsor>> = (0..3).map(|_| Arc::new(FailingSponsor::default())).collect();
    for sponsor in &sponsors {
        let sponsor: Arc<dyn Sponsor> = sponsor.clone();
        assert!(lease.register(sponsor));
    }
    let declining = FixedSponsor::new(Duration::ZERO);
    assert!(lease.register(declining.clone()));

    manager.poll(Instant::now() + secs(1));
    assert!(wait_until(secs(5), || fired.load(Ordering::SeqCst) == 1));
    assert_eq!(lease.state(), LeaseState::Expired);

    for sponsor in &sponsors {
        assert_eq!(sponsor.calls.load(Ordering::SeqCst), 1);
    }
    assert_eq!(declining.calls(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    assert_eq!(manager.poll(Instant::now() + secs(60)).expired, 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(manager.tracked_count(), 0);
    assert_eq!(manager.pending_sponsor_calls(), 0);
}

/// Test: A published object whose sponsors all fail is disconnected
#[tokio::test(flavor = "multi_thread")]
async fn test_failing_sponsors_disconnect_object() {
    init_logging();
    let domain = domain("failing", |c| c.with_lease_time(millis(100)));
    let object: Arc<dyn RemoteObject> = Counter::new();
    let obj_ref = domain.marshal(object.clone()).unwrap();
    let lease = domain.lease_of(&object).unwrap();
    let failing: Arc<dyn Sponsor> = Arc::new(FailingSponsor::default());
    lease.register(failing);

    domain.lease_manager().poll(Instant::now() + secs(1));
    let identity = domain.server_identity(obj_ref.uri()).unwrap();
    assert!(wait_until(secs(5), || identity.state() == ServerState::FullyDisconnected));
    assert!(domain.lease_of(&object).is_none());
}

/// Test: A sponsor that does not answer in time is dropped
#[tokio::test(flavor = "multi_thread")]
async fn test_slow_sponsor_times_out() {
    init_logging();
    let manager = LeaseManager::new(secs(10));
    let (lease, fired) = activated_lease(&manager, Lease::new(millis(50), Duration::ZERO, millis(50)));
    let slow = Arc::new(SlowSponsor {
        delay: millis(300),
        renewal: secs(10),
        calls: AtomicUsize::new(0),
    });
    let sponsor: Arc<dyn Sponsor> = slow.clone();
    assert!(lease.register(sponsor));

    manager.poll(Instant::now() + secs(1));
    assert_eq!(lease.state(), LeaseState::Renewing);
    assert_eq!(manager.pending_sponsor_calls(), 1);

    let summary = manager.poll(Instant::now() + secs(1));
    assert_eq!(summary.timed_out, 1);
    assert_eq!(lease.state(), LeaseState::Expired);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // The late answer changes nothing.
    assert!(wait_until(secs(2), || slow.calls.load(Ordering::SeqCst) == 1));
    std::thread::sleep(millis(400));
    assert_eq!(lease.state(), LeaseState::Expired);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// Test: Every call keeps the lease at least the renew-on-call time away
#[tokio::test(flavor = "multi_thread")]
async fn test_renew_on_call() {
    init_logging();
    let domain = domain("renew-on-call", |c| {
        c.with_lease_time(millis(200)).with_renew_on_call_time(secs(30))
    });
    let object: Arc<dyn RemoteObject> = Counter::new();
    let obj_ref = domain.marshal(object.clone()).unwrap();
    let lease = domain.lease_of(&object).unwrap();
    assert!(lease.current_lease_time() <= millis(200));

    let proxy = domain.unmarshal(&obj_ref, counter_type());
    proxy.invoke(&mut CallContext::new(), "next", vec![]).unwrap();
    assert!(lease.current_lease_time() > secs(25));

    assert_eq!(domain.lease_manager().poll(Instant::now() + secs(1)).expired, 0);
    assert_eq!(lease.state(), LeaseState::Active);
}

/// Test: Renewals never bring the expiry closer
#[tokio::test(flavor = "multi_thread")]
async fn test_renew_is_monotonic() {
    init_logging();
    let manager = LeaseManager::new(secs(10));
    let (lease, _) = activated_lease(&manager, Lease::new(secs(5), secs(1), secs(1)));

    let mut last = lease.expiry().unwrap();
    for renewal in [secs(40), secs(2), Duration::ZERO, secs(39), secs(41), millis(1)] {
        lease.renew(renewal);
        lease.renew_on_call();
        let expiry = lease.expiry().unwrap();
        assert!(expiry >= last);
        last = expiry;
    }
    assert!(lease.current_lease_time() > secs(39));
}

/// Test: Once expired, every lease operation is a quiet no-op, from any
/// thread
#[tokio::test(flavor = "multi_thread")]
async fn test_expired_lease_is_terminal() {
    init_logging();
    let manager = LeaseManager::new(secs(10));
    let (lease, fired) = activated_lease(&manager, Lease::new(millis(10), millis(10), secs(1)));
    manager.poll(Instant::now() + secs(1));
    assert_eq!(lease.state(), LeaseState::Expired);

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let lease = lease.clone();
            std::thread::spawn(move || {
                let sponsor: Arc<dyn Sponsor> = FixedSponsor::new(secs(5));
                for _ in 0..50 {
                    assert!(!lease.register(sponsor.clone()));
                    assert!(!lease.unregister(&sponsor));
                    assert_eq!(lease.renew(secs(5)), Duration::ZERO);
                    lease.renew_on_call();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(lease.state(), LeaseState::Expired);
    assert_eq!(lease.current_lease_time(), Duration::ZERO);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(manager.tracked_count(), 0);
}

/// Test: A client sponsor keeps its leases alive until closed
#[tokio::test(flavor = "multi_thread")]
async fn test_client_sponsor() {
    init_logging();
    let domain = domain("client-sponsor", |c| c.with_lease_time(secs(1)));
    let first: Arc<dyn RemoteObject> = Counter::new();
    let second: Arc<dyn RemoteObject> = Counter::new();
    domain.marshal(first.clone()).unwrap();
    domain.marshal(second.clone()).unwrap();
    let leases = [domain.lease_of(&first).unwrap(), domain.lease_of(&second).unwrap()];

    let sponsor = ClientSponsor::new(secs(5));
    for lease in &leases {
        assert!(sponsor.register(lease));
    }
    assert_eq!(sponsor.lease_count(), 2);

    assert_eq!(domain.lease_manager().poll(Instant::now() + secs(2)).expired, 2);
    let manager = domain.lease_manager();
    assert!(wait_until(secs(5), || {
        leases.iter().all(|l| l.state() == LeaseState::Active)
            && manager.tracked_count() == 2
            && manager.pending_sponsor_calls() == 0
    }));

    sponsor.unregister(&leases[0]);
    assert_eq!(leases[0].sponsor_count(), 0);
    sponsor.close();
    assert_eq!(sponsor.lease_count(), 0);
    assert_eq!(leases[1].sponsor_count(), 0);

    manager.poll(Instant::now() + secs(60));
    for lease in &leases {
        assert_eq!(lease.state(), LeaseState::Expired);
    }
}

/// Test: Objects may opt out of leasing or pick their own lease time
#[tokio::test(flavor = "multi_thread")]
async fn test_lifetime_overrides() {
    init_logging();
    let domain = domain("overrides", |c| c.with_lease_time(millis(100)));

    let immortal: Arc<dyn RemoteObject> = Counter::with_lease_time(Duration::ZERO);
    let obj_ref = domain.marshal(immortal.clone()).unwrap();
    assert!(domain.lease_of(&immortal).is_none());

    let custom: Arc<dyn RemoteObject> = Counter::with_lease_time(secs(30));
    domain.marshal(custom.clone()).unwrap();
    let lease = domain.lease_of(&custom).unwrap();
    assert_eq!(lease.initial_lease_time(), secs(30));

    domain.lease_manager().poll(Instant::now() + secs(3600));
    let proxy = domain.unmarshal(&obj_ref, counter_type());
    assert_eq!(
        proxy.invoke(&mut CallContext::new(), "next", vec![]).unwrap(),
        Value::from(1)
    );
}

/// Test: Lifetime settings can be assigned once, before first use
#[tokio::test(flavor = "multi_thread")]
async fn test_lifetime_settings_assign_once() {
    init_logging();
    let domain = test_domain("settings");
    domain.lifetime().set_lease_time(secs(42)).unwrap();
    assert!(matches!(
        domain.lifetime().set_lease_time(secs(1)),
        Err(RemotingError::SettingAlreadyAssigned(_))
    ));

    let object: Arc<dyn RemoteObject> = Counter::new();
    domain.marshal(object.clone()).unwrap();
    assert_eq!(domain.lease_of(&object).unwrap().initial_lease_time(), secs(42));
    assert!(domain.lifetime().set_renew_on_call_time(secs(1)).is_err());
}

/// Test: Expired objects nobody holds leave the identity table, whether
/// they were dropped before or after their lease ran out
#[tokio::test(flavor = "multi_thread")]
async fn test_expired_dropped_objects_are_removed() {
    init_logging();
    let domain = domain("reclaim", |c| c.with_lease_time(millis(10)));
    let uris: Vec<String> = (0..100)
        .map(|_| {
            let object: Arc<dyn RemoteObject> = Counter::new();
            domain.marshal(object).unwrap().uri().to_string()
        })
        .collect();
    assert_eq!(domain.identities().server_count(), 100);

    assert_eq!(domain.lease_manager().poll(Instant::now() + secs(5)).expired, 100);
    assert_eq!(domain.identities().server_count(), 0);
    assert!(uris.iter().all(|uri| domain.server_identity(uri).is_none()));

    let held: Arc<dyn RemoteObject> = Counter::new();
    let obj_ref = domain.marshal(held.clone()).unwrap();
    domain.lease_manager().poll(Instant::now() + secs(5));
    let identity = domain.server_identity(obj_ref.uri()).unwrap();
    assert_eq!(identity.state(), ServerState::FullyDisconnected);
    assert_eq!(domain.identities().server_count(), 1);

    drop(held);
    domain.lease_manager().poll(Instant::now() + secs(10));
    assert_eq!(domain.identities().server_count(), 0);
    assert!(domain.server_identity(obj_ref.uri()).is_none());
}

/// Test: Calls to an expired object are refused before any server sink
/// sees them
#[tokio::test(flavor = "multi_thread")]
async fn test_expired_object_refused_before_server_sinks() {
    init_logging();
    let domain = domain("refused", |c| {
        c.with_lease_time(millis(10))
            .with_renew_on_call_time(Duration::ZERO)
    });
    let object: Arc<dyn RemoteObject> = Counter::new();
    let obj_ref = domain.marshal(object.clone()).unwrap();
    let identity = domain.server_identity(obj_ref.uri()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    identity
        .identity()
        .register_dynamic_sink("watch", RecordingDynamicSink::new("watch", &log));

    let proxy = domain.unmarshal(&obj_ref, counter_type());
    assert_eq!(proxy.invoke(&mut CallContext::new(), "next", vec![]).unwrap(), Value::from(1));
    assert_eq!(*log.lock(), vec!["watch:start:server", "watch:finish:server"]);
    log.lock().clear();

    domain.lease_manager().poll(Instant::now() + secs(3600));
    assert_eq!(identity.state(), ServerState::FullyDisconnected);

    let disconnected = RemotingError::Disconnected(obj_ref.uri().to_string());
    let call = MethodCall::new(obj_ref.uri(), MethodDescriptor::new("Counter", "next", 0), vec![]);
    let reply = domain.dispatch_incoming(Message::Call(call));
    assert_eq!(reply.exception(), Some(&disconnected));

    let mut ctx = CallContext::new();
    assert_eq!(proxy.invoke(&mut ctx, "next", vec![]), Err(disconnected.clone()));
    let pending = proxy.begin_invoke(&ctx, "next", vec![], None);
    assert_eq!(proxy.end_invoke(&mut ctx, &pending), Err(disconnected));

    std::thread::sleep(millis(50));
    assert!(log.lock().is_empty());
}

/// Test: The background scan expires leases without manual polling
#[tokio::test(flavor = "multi_thread")]
async fn test_manager_scans_in_background() {
    init_logging();
    let domain = domain("background", |c| {
        c.with_lease_time(millis(100))
            .with_renew_on_call_time(Duration::ZERO)
            .with_lease_poll_time(millis(20))
    });
    domain.start();
    assert!(domain.lease_manager().is_running());

    let object: Arc<dyn RemoteObject> = Counter::new();
    let obj_ref = domain.marshal(object).unwrap();
    let identity = domain.server_identity(obj_ref.uri()).unwrap();
    assert!(wait_until_async(secs(5), || identity.state() == ServerState::FullyDisconnected).await);

    domain.shutdown();
    assert!(!domain.lease_manager().is_running());
}
