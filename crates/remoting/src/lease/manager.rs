//! Lease manager
//!
//! Periodically scans tracked leases and pending sponsor calls. A pass
//! collects everything that ran out under the table locks, then notifies
//! the leases with no lock held, since a notification may re-enter the
//! tables. The next pass is scheduled only after the current one finishes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{Lease, LeaseId, SponsorId};

/// What one scan found
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Leases reported as expired
    pub expired: usize,
    /// Sponsor calls reported as timed out
    pub timed_out: usize,
}

struct TrackedLease {
    lease: Arc<Lease>,
    expiry: Instant,
}

struct PendingSponsorCall {
    lease: Arc<Lease>,
    deadline: Instant,
}

/// Work run at the end of every pass, after expired leases were notified
pub(crate) type PassHook = Arc<dyn Fn() + Send + Sync>;

/// Tables shared between the manager, its leases and the scan task
#[derive(Default)]
pub struct ManagerShared {
    leases: Mutex<HashMap<LeaseId, TrackedLease>>,
    sponsor_calls: Mutex<HashMap<(LeaseId, SponsorId), PendingSponsorCall>>,
    after_pass: Mutex<Option<PassHook>>,
}

impl ManagerShared {
    /// Track a lease, or update the expiry it is tracked under
    pub(crate) fn track(&self, lease: Arc<Lease>, expiry: Instant) {
        self.leases
            .lock()
            .insert(lease.id(), TrackedLease { lease, expiry });
    }

    pub(crate) fn untrack(&self, id: LeaseId) {
        self.leases.lock().remove(&id);
    }

    pub(crate) fn register_sponsor_call(&self, lease: Arc<Lease>, sponsor: SponsorId, deadline: Instant) {
        self.sponsor_calls
            .lock()
            .insert((lease.id(), sponsor), PendingSponsorCall { lease, deadline });
    }

    pub(crate) fn cancel_sponsor_call(&self, lease: LeaseId, sponsor: SponsorId) {
        self.sponsor_calls.lock().remove(&(lease, sponsor));
    }

    fn poll(&self, now: Instant) -> PollSummary {
        let expired: Vec<Arc<Lease>> = {
            let mut leases = self.leases.lock();
            let ids: Vec<LeaseId> = leases
                .iter()
                .filter(|(_, t)| t.expiry <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| leases.remove(id))
                .map(|t| t.lease)
                .collect()
        };

        let timed_out: Vec<(Arc<Lease>, SponsorId)> = {
            let mut calls = self.sponsor_calls.lock();
            let keys: Vec<(LeaseId, SponsorId)> = calls
                .iter()
                .filter(|(_, c)| c.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.iter()
                .filter_map(|k| calls.remove(k).map(|c| (c.lease, k.1)))
                .collect()
        };

        for lease in &expired {
            lease.lease_expired(now);
        }
        for (lease, sponsor) in &timed_out {
            lease.sponsor_timed_out(*sponsor);
        }

        let hook = self.after_pass.lock().clone();
        if let Some(hook) = hook {
            hook();
        }

        let summary = PollSummary {
            expired: expired.len(),
            timed_out: timed_out.len(),
        };
        trace!(?summary, "lease manager pass");
        summary
    }
}

/// Process-wide lease scanner
pub struct LeaseManager {
    shared: Arc<ManagerShared>,
    poll_interval: Mutex<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseManager {
    /// Create a manager; scanning starts with [`LeaseManager::start`]
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(ManagerShared::default()),
            poll_interval: Mutex::new(poll_interval),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }

    pub fn poll_interval(&self) -> Duration {
        *self.poll_interval.lock()
    }

    /// Change the scan interval; a running scan picks it up on restart
    pub fn set_poll_interval(&self, interval: Duration) {
        *self.poll_interval.lock() = interval;
    }

    /// Install the work run after each pass
    pub(crate) fn set_after_pass(&self, hook: PassHook) {
        *self.shared.after_pass.lock() = Some(hook);
    }

    /// Run one scan against the clock reading `now`
    pub fn poll(&self, now: Instant) -> PollSummary {
        self.shared.poll(now)
    }

    /// Number of leases currently tracked
    pub fn tracked_count(&self) -> usize {
        self.shared.leases.lock().len()
    }

    /// Number of sponsor calls waiting for an answer
    pub fn pending_sponsor_calls(&self) -> usize {
        self.shared.sponsor_calls.lock().len()
    }

    pub fn is_tracked(&self, id: LeaseId) -> bool {
        self.shared.leases.lock().contains_key(&id)
    }

    /// Start periodic scanning on `handle`
    pub fn start(&self, handle: &Handle) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let shared = Arc::downgrade(&self.shared);
        let interval = self.poll_interval();
        *task = Some(handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let pass = tokio::task::spawn_blocking(move || shared.poll(Instant::now()));
                if pass.await.is_err() {
                    debug!("lease manager pass panicked");
                }
            }
        }));
        debug!(?interval, "lease manager started");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop periodic scanning
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("lease manager stopped");
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
