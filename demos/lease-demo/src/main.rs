//! Lease Demo
//!
//! Publishes a counter, calls it through a proxy and keeps it alive with a
//! sponsor for a few rounds. Once the sponsor stops renewing, the lease
//! manager disconnects the object and further calls fail.
//!
//! USAGE:
//!   lease-demo [OPTIONS]
//!
//! EXAMPLES:
//!   lease-demo                               # Default timings
//!   lease-demo --lease-ms 200 --renewals 5   # Short lease, more renewals
//!   lease-demo --verbose                     # Show debug logging

use std::any::Any;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use remoting::{
    CallContext, Lease, MethodDescriptor, RemoteObject, RemotingConfig, RemotingDomain, RemotingError, Result,
    ServerState, Sponsor, TypeInfo, Value,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "lease-demo")]
#[command(version)]
#[command(about = "Watch a published object live on sponsor renewals and then expire")]
struct Args {
    /// Initial lease time of the published counter, in milliseconds
    #[arg(long, default_value_t = 500)]
    lease_ms: u64,

    /// Time the sponsor grants on each renewal, in milliseconds
    #[arg(long, default_value_t = 800)]
    renewal_ms: u64,

    /// Renewals the sponsor grants before it declines
    #[arg(long, default_value_t = 3)]
    renewals: usize,

    /// Interval between lease manager scans, in milliseconds
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

struct Counter {
    value: AtomicI64,
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

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sponsor granting a fixed number of renewals
struct CountdownSponsor {
    renewal: Duration,
    remaining: AtomicUsize,
}

impl Sponsor for CountdownSponsor {
    fn renewal(&self, lease: &Lease) -> Result<Duration> {
        let left = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match left {
            Ok(n) => {
                println!("[SPONSOR] renewing lease {} for {:?} ({} left)", lease.id(), self.renewal, n - 1);
                Ok(self.renewal)
            }
            Err(_) => {
                println!("[SPONSOR] declining lease {}", lease.id());
                Ok(Duration::ZERO)
            }
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let renewal = Duration::from_millis(args.renewal_ms);
    let config = RemotingConfig::new("lease-demo")
        .with_lease_time(Duration::from_millis(args.lease_ms))
        .with_renew_on_call_time(Duration::from_millis(args.lease_ms / 2))
        .with_lease_poll_time(Duration::from_millis(args.poll_ms));
    let domain = RemotingDomain::new(config)?;
    domain.start();

    println!("========================================================");
    println!("                    Lease Demo");
    println!("========================================================");
    println!("  Lease time:   {} ms", args.lease_ms);
    println!("  Renewal:      {} ms x {}", args.renewal_ms, args.renewals);
    println!("  Manager scan: {} ms", args.poll_ms);
    println!("========================================================");

    let object: Arc<dyn RemoteObject> = Arc::new(Counter {
        value: AtomicI64::new(0),
    });
    let obj_ref = domain.marshal(object.clone())?;
    info!(uri = %obj_ref.uri(), "counter published");

    let proxy = domain.unmarshal(&obj_ref, TypeInfo::new("Counter").method("next", 0));
    let mut ctx = CallContext::new();
    for _ in 0..3 {
        let value = proxy.invoke(&mut ctx, "next", vec![])?;
        println!("[CLIENT] next() = {:?}", value);
    }

    let lease = domain
        .lease_of(&object)
        .ok_or_else(|| RemotingError::ObjectNotFound(obj_ref.uri().to_string()))?;
    let sponsor = Arc::new(CountdownSponsor {
        renewal,
        remaining: AtomicUsize::new(args.renewals),
    });
    if !lease.register(sponsor) {
        warn!("sponsor was not accepted");
    }

    let identity = domain
        .server_identity(obj_ref.uri())
        .ok_or_else(|| RemotingError::ObjectNotFound(obj_ref.uri().to_string()))?;
    let started = Instant::now();
    let deadline = Duration::from_millis(args.lease_ms + args.renewal_ms * (args.renewals as u64 + 2));
    let mut last_state = None;
    while identity.state() != ServerState::FullyDisconnected {
        let state = lease.state();
        if last_state != Some(state) {
            println!(
                "[LEASE]  {:>6} ms  {:?}, {:?} left",
                started.elapsed().as_millis(),
                state,
                lease.current_lease_time()
            );
            last_state = Some(state);
        }
        if started.elapsed() > deadline {
            warn!("object still alive after {:?}", deadline);
            break;
        }
        tokio::time::sleep(Duration::from_millis(args.poll_ms / 2 + 1)).await;
    }
    println!(
        "[LEASE]  {:>6} ms  {:?}, object {:?}",
        started.elapsed().as_millis(),
        lease.state(),
        identity.state()
    );

    match proxy.invoke(&mut ctx, "next", vec![]) {
        Ok(value) => println!("[CLIENT] next() = {:?} (object still alive)", value),
        Err(e) => println!("[CLIENT] next() failed: {}", e),
    }

    domain.shutdown();
    Ok(())
}
