//! Leases and the lease manager
//!
//! A [`Lease`] is the remaining-lifetime clock of one published object.
//!
//! ```text
//!   Initial ──activate──► Active ◄──renewed──┐
//!                            │               │
//!                      expiry reached     sponsor call
//!                            ▼               │
//!                         Renewing ──────────┘
//!                            │
//!                  no sponsor renews
//!                            ▼
//!                         Expired   (terminal)
//! ```
//!
//! - The [`LeaseManager`] scans tracked leases and reports expiry.
//! - An expired lease asks its sponsors, one at a time, for more time.
//!   The order is decided by a [`SponsorPolicy`].
//! - Sponsor callbacks always run on the worker pool.
//! - Once Expired, every operation is a quiet no-op.
//!
//! Locks are taken in a fixed order: lease state, then sponsor table.
//! Manager tables are only touched after both are released.

mod config;
mod manager;
mod policy;
mod sink;
mod sponsor;

pub use config::*;
pub use manager::*;
pub use policy::*;
pub use sink::LeaseSink;
pub use sponsor::ClientSponsor;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RemotingError, Result};
use crate::worker::{panic_message, WorkerPool};

pub type LeaseId = u64;
pub type SponsorId = u64;

static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(1);

/// Lease lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// No lease should exist for the object
    Null,
    /// Created, settings still configurable
    Initial,
    /// Counting down
    Active,
    /// Expiry reached, a sponsor is being asked
    Renewing,
    /// Terminal
    Expired,
}

/// Party that can vote to keep a leased object alive
///
/// Returning a zero duration or an error declines the renewal.
pub trait Sponsor: Send + Sync {
    fn renewal(&self, lease: &Lease) -> Result<Duration>;
}

fn same_sponsor(a: &Arc<dyn Sponsor>, b: &Arc<dyn Sponsor>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct SponsorEntry {
    id: SponsorId,
    sponsor: Arc<dyn Sponsor>,
    state: SponsorState,
    last_renewal: Duration,
}

struct LeaseInner {
    state: LeaseState,
    expiry: Instant,
    initial: Duration,
    renew_on_call: Duration,
    sponsorship_timeout: Duration,
    /// Clock reading that started the current sponsor round
    round: Option<Instant>,
}

type ExpiryHandler = Box<dyn FnOnce() + Send>;

/// Work decided under the lease locks and carried out after releasing them
#[derive(Default)]
struct Followup {
    cancel_calls: Vec<SponsorId>,
    untrack: bool,
    track: Option<Instant>,
    call: Option<(SponsorId, Arc<dyn Sponsor>, Duration)>,
    expired: Option<ExpiryHandler>,
}

/// Remaining-lifetime clock of one published object
pub struct Lease {
    id: LeaseId,
    inner: Mutex<LeaseInner>,
    sponsors: Mutex<Vec<SponsorEntry>>,
    next_sponsor: AtomicU64,
    policy: Arc<dyn SponsorPolicy>,
    uri: OnceLock<String>,
    self_ref: OnceLock<Weak<Lease>>,
    manager: OnceLock<Weak<ManagerShared>>,
    pool: OnceLock<WorkerPool>,
    on_expired: Mutex<Option<ExpiryHandler>>,
}

impl Lease {
    /// Create a lease in the Initial state (Null if `initial` is zero)
    pub fn new(initial: Duration, renew_on_call: Duration, sponsorship_timeout: Duration) -> Self {
        let state = if initial.is_zero() {
            LeaseState::Null
        } else {
            LeaseState::Initial
        };
        Self {
            id: NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(LeaseInner {
                state,
                expiry: Instant::now(),
                initial,
                renew_on_call,
                sponsorship_timeout,
                round: None,
            }),
            sponsors: Mutex::new(Vec::new()),
            next_sponsor: AtomicU64::new(1),
            policy: Arc::new(LargestRenewalFirst),
            uri: OnceLock::new(),
            self_ref: OnceLock::new(),
            manager: OnceLock::new(),
            pool: OnceLock::new(),
            on_expired: Mutex::new(None),
        }
    }

    /// Replace the sponsor selection policy
    pub fn with_sponsor_policy(mut self, policy: Arc<dyn SponsorPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// URI of the leased object, once activated
    pub fn uri(&self) -> Option<&str> {
        self.uri.get().map(String::as_str)
    }

    pub fn state(&self) -> LeaseState {
        self.inner.lock().state
    }

    pub fn initial_lease_time(&self) -> Duration {
        self.inner.lock().initial
    }

    pub fn renew_on_call_time(&self) -> Duration {
        self.inner.lock().renew_on_call
    }

    pub fn sponsorship_timeout(&self) -> Duration {
        self.inner.lock().sponsorship_timeout
    }

    /// Time left before expiry
    pub fn current_lease_time(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.state {
            LeaseState::Initial => inner.initial,
            LeaseState::Active | LeaseState::Renewing => {
                inner.expiry.saturating_duration_since(Instant::now())
            }
            LeaseState::Null | LeaseState::Expired => Duration::ZERO,
        }
    }

    /// Absolute expiry, while the lease is counting down
    pub fn expiry(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        matches!(inner.state, LeaseState::Active | LeaseState::Renewing).then_some(inner.expiry)
    }

    pub fn sponsor_count(&self) -> usize {
        self.sponsors.lock().len()
    }

    fn check_configurable(inner: &LeaseInner) -> Result<()> {
        match inner.state {
            LeaseState::Initial => Ok(()),
            other => Err(RemotingError::LeaseNotInitial(other)),
        }
    }

    /// Set the initial lease time; zero turns the lease into Null
    pub fn set_initial_lease_time(&self, value: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_configurable(&inner)?;
        inner.initial = value;
        if value.is_zero() {
            inner.state = LeaseState::Null;
        }
        Ok(())
    }

    pub fn set_renew_on_call_time(&self, value: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_configurable(&inner)?;
        inner.renew_on_call = value;
        Ok(())
    }

    /// Set the sponsorship timeout; zero disables sponsors
    pub fn set_sponsorship_timeout(&self, value: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_configurable(&inner)?;
        inner.sponsorship_timeout = value;
        Ok(())
    }

    /// Start counting down and hand the lease to the manager
    ///
    /// `on_expired` runs once, when the lease expires without renewal. It
    /// does not run when the lease is terminated.
    pub fn activate(
        self: &Arc<Self>,
        manager: &LeaseManager,
        pool: WorkerPool,
        uri: impl Into<String>,
        on_expired: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let uri = uri.into();
        let expiry = {
            let mut inner = self.inner.lock();
            if inner.state != LeaseState::Initial {
                return Err(RemotingError::LeaseNotInitial(inner.state));
            }
            inner.state = LeaseState::Active;
            inner.expiry = Instant::now() + inner.initial;

            let _ = self.self_ref.set(Arc::downgrade(self));
            let _ = self.manager.set(Arc::downgrade(manager.shared()));
            let _ = self.pool.set(pool);
            let _ = self.uri.set(uri.clone());
            *self.on_expired.lock() = Some(Box::new(on_expired));
            inner.expiry
        };

        manager.shared().track(self.clone(), expiry);
        debug!(lease = self.id, uri = %uri, "lease activated");
        Ok(())
    }

    /// Register a sponsor with no renewal hint
    pub fn register(&self, sponsor: Arc<dyn Sponsor>) -> bool {
        self.register_with_renewal(sponsor, Duration::ZERO)
    }

    /// Register a sponsor, extending the lease by `renewal` if non-zero
    ///
    /// Returns true if the sponsor was added. Registering is a no-op once
    /// the lease expired or when sponsorship is disabled; duplicates are
    /// ignored.
    pub fn register_with_renewal(&self, sponsor: Arc<dyn Sponsor>, renewal: Duration) -> bool {
        let mut followup = Followup::default();
        let added = {
            let mut inner = self.inner.lock();
            if inner.state == LeaseState::Expired || inner.sponsorship_timeout.is_zero() {
                debug!(lease = self.id, state = ?inner.state, "sponsor registration ignored");
                return false;
            }
            if !renewal.is_zero() {
                followup.track = Self::extend(&mut inner, renewal);
            }

            let mut sponsors = self.sponsors.lock();
            if sponsors.iter().any(|e| same_sponsor(&e.sponsor, &sponsor)) {
                false
            } else {
                sponsors.push(SponsorEntry {
                    id: self.next_sponsor.fetch_add(1, Ordering::Relaxed),
                    sponsor,
                    state: SponsorState::Initial,
                    last_renewal: renewal,
                });
                true
            }
        };
        self.finish(followup);
        added
    }

    /// Remove a sponsor. A renewal call in flight to it is abandoned.
    pub fn unregister(&self, sponsor: &Arc<dyn Sponsor>) -> bool {
        let mut followup = Followup::default();
        {
            let mut inner = self.inner.lock();
            if inner.state == LeaseState::Expired {
                return false;
            }
            let mut sponsors = self.sponsors.lock();
            let Some(pos) = sponsors.iter().position(|e| same_sponsor(&e.sponsor, sponsor)) else {
                return false;
            };
            let entry = sponsors.remove(pos);
            if entry.state == SponsorState::Waiting {
                followup.cancel_calls.push(entry.id);
                self.escalate(&mut inner, &mut sponsors, &mut followup);
            }
        }
        self.finish(followup);
        true
    }

    /// Extend the lease to at least `now + renewal`
    ///
    /// Returns the time left, or zero if the lease is not counting down.
    pub fn renew(&self, renewal: Duration) -> Duration {
        let mut followup = Followup::default();
        let remaining = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, LeaseState::Active | LeaseState::Renewing) {
                return Duration::ZERO;
            }
            followup.track = Self::extend(&mut inner, renewal);
            inner.expiry.saturating_duration_since(Instant::now())
        };
        self.finish(followup);
        remaining
    }

    /// Extend by the renew-on-call time; called for every intercepted call
    pub fn renew_on_call(&self) {
        let mut followup = Followup::default();
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, LeaseState::Active | LeaseState::Renewing)
                || inner.renew_on_call.is_zero()
            {
                return;
            }
            let renewal = inner.renew_on_call;
            followup.track = Self::extend(&mut inner, renewal);
        }
        self.finish(followup);
    }

    /// Expire without running the expiry handler
    pub(crate) fn terminate(&self) {
        let mut followup = Followup::default();
        {
            let mut inner = self.inner.lock();
            if inner.state == LeaseState::Expired {
                return;
            }
            let mut sponsors = self.sponsors.lock();
            self.expire(&mut inner, &mut sponsors, &mut followup);
        }
        // Terminated by the owner: the handler must not run.
        followup.expired = None;
        self.finish(followup);
        debug!(lease = self.id, "lease terminated");
    }

    /// Expiry reported by the manager for clock reading `now`
    pub(crate) fn lease_expired(self: &Arc<Self>, now: Instant) {
        let mut followup = Followup::default();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                LeaseState::Active | LeaseState::Renewing => {}
                _ => return,
            }
            if inner.expiry > now {
                // Renewed between the scan and here.
                followup.track = Some(inner.expiry);
            } else {
                inner.round = Some(now);
                let mut sponsors = self.sponsors.lock();
                self.process_next_sponsor(&mut inner, &mut sponsors, &mut followup);
            }
        }
        followup.run(self);
    }

    /// Outcome of a sponsor renewal call
    pub(crate) fn renewal_completed(self: &Arc<Self>, sponsor_id: SponsorId, outcome: Result<Duration>) {
        let mut followup = Followup::default();
        {
            let mut inner = self.inner.lock();
            if inner.state == LeaseState::Expired {
                return;
            }
            let mut sponsors = self.sponsors.lock();
            let Some(pos) = sponsors
                .iter()
                .position(|e| e.id == sponsor_id && e.state == SponsorState::Waiting)
            else {
                // Timed out or unregistered meanwhile.
                return;
            };
            followup.cancel_calls.push(sponsor_id);

            match outcome {
                Ok(renewal) if !renewal.is_zero() => {
                    let entry = &mut sponsors[pos];
                    entry.state = SponsorState::Completed;
                    entry.last_renewal = renewal;
                    inner.state = LeaseState::Active;
                    inner.round = None;
                    inner.expiry = inner.expiry.max(Instant::now() + renewal);
                    followup.track = Some(inner.expiry);
                    debug!(lease = self.id, sponsor = sponsor_id, ?renewal, "sponsor renewed lease");
                }
                outcome => {
                    sponsors.remove(pos);
                    match outcome {
                        Err(e) => warn!(lease = self.id, sponsor = sponsor_id, error = %e, "sponsor failed"),
                        Ok(_) => debug!(lease = self.id, sponsor = sponsor_id, "sponsor declined"),
                    }
                    self.escalate(&mut inner, &mut sponsors, &mut followup);
                }
            }
        }
        followup.run(self);
    }

    /// A sponsor call ran past the sponsorship timeout
    pub(crate) fn sponsor_timed_out(self: &Arc<Self>, sponsor_id: SponsorId) {
        let mut followup = Followup::default();
        {
            let mut inner = self.inner.lock();
            if inner.state == LeaseState::Expired {
                return;
            }
            let mut sponsors = self.sponsors.lock();
            let Some(pos) = sponsors
                .iter()
                .position(|e| e.id == sponsor_id && e.state == SponsorState::Waiting)
            else {
                return;
            };
            sponsors.remove(pos);
            warn!(lease = self.id, sponsor = sponsor_id, "sponsor timed out");
            self.escalate(&mut inner, &mut sponsors, &mut followup);
        }
        followup.run(self);
    }

    fn extend(inner: &mut LeaseInner, renewal: Duration) -> Option<Instant> {
        if !matches!(inner.state, LeaseState::Active | LeaseState::Renewing) {
            return None;
        }
        let target = Instant::now() + renewal;
        if target > inner.expiry {
            inner.expiry = target;
            Some(target)
        } else {
            None
        }
    }

    /// Continue a sponsor round after a sponsor dropped out
    fn escalate(&self, inner: &mut LeaseInner, sponsors: &mut Vec<SponsorEntry>, followup: &mut Followup) {
        if inner.state != LeaseState::Renewing {
            return;
        }
        let round = inner.round.unwrap_or_else(Instant::now);
        if inner.expiry > round {
            // Renewed by a call while the sponsor was out.
            inner.state = LeaseState::Active;
            inner.round = None;
            followup.track = Some(inner.expiry);
        } else {
            self.process_next_sponsor(inner, sponsors, followup);
        }
    }

    fn process_next_sponsor(
        &self,
        inner: &mut LeaseInner,
        sponsors: &mut Vec<SponsorEntry>,
        followup: &mut Followup,
    ) {
        if sponsors.iter().any(|e| e.state == SponsorState::Waiting) {
            return;
        }
        let candidates: Vec<SponsorCandidate> = sponsors
            .iter()
            .map(|e| SponsorCandidate {
                state: e.state,
                last_renewal: e.last_renewal,
            })
            .collect();

        match self.policy.select(&candidates) {
            Some(pos) if pos < sponsors.len() => {
                let entry = &mut sponsors[pos];
                entry.state = SponsorState::Waiting;
                inner.state = LeaseState::Renewing;
                followup.call = Some((entry.id, entry.sponsor.clone(), inner.sponsorship_timeout));
                debug!(lease = self.id, sponsor = entry.id, "asking sponsor for renewal");
            }
            _ => self.expire(inner, sponsors, followup),
        }
    }

    fn expire(&self, inner: &mut LeaseInner, sponsors: &mut Vec<SponsorEntry>, followup: &mut Followup) {
        followup.cancel_calls.extend(
            sponsors
                .iter()
                .filter(|e| e.state == SponsorState::Waiting)
                .map(|e| e.id),
        );
        sponsors.clear();
        inner.state = LeaseState::Expired;
        inner.round = None;
        followup.untrack = true;
        followup.expired = self.on_expired.lock().take();
        info!(lease = self.id, uri = self.uri().unwrap_or("-"), "lease expired");
    }

    fn dispatch_sponsor_call(self: &Arc<Self>, sponsor_id: SponsorId, sponsor: Arc<dyn Sponsor>) {
        let Some(pool) = self.pool.get() else {
            warn!(lease = self.id, "no worker pool for sponsor call");
            self.sponsor_timed_out(sponsor_id);
            return;
        };
        let lease = self.clone();
        pool.execute(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| sponsor.renewal(&lease)))
                .unwrap_or_else(|payload| Err(RemotingError::TargetPanicked(panic_message(payload))));
            lease.renewal_completed(sponsor_id, outcome);
        });
    }

    fn finish(&self, followup: Followup) {
        // Before activation there is no manager, handler or sponsor call.
        if let Some(me) = self.self_ref.get().and_then(Weak::upgrade) {
            followup.run(&me);
        }
    }
}

impl Followup {
    fn run(self, lease: &Arc<Lease>) {
        let manager = lease.manager.get().and_then(Weak::upgrade);
        if let Some(manager) = &manager {
            for sponsor_id in &self.cancel_calls {
                manager.cancel_sponsor_call(lease.id, *sponsor_id);
            }
            if self.untrack {
                manager.untrack(lease.id);
            }
            if let Some(expiry) = self.track {
                manager.track(lease.clone(), expiry);
            }
        }
        if let Some((sponsor_id, sponsor, timeout)) = self.call {
            if let Some(manager) = &manager {
                manager.register_sponsor_call(lease.clone(), sponsor_id, Instant::now() + timeout);
            }
            lease.dispatch_sponsor_call(sponsor_id, sponsor);
        }
        if let Some(handler) = self.expired {
            handler();
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("uri", &self.uri())
            .field("state", &self.state())
            .finish()
    }
}
