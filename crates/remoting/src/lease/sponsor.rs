//! Ready-made sponsor

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{Lease, Sponsor};
use crate::error::Result;

/// Sponsor that renews every lease it is registered with by a fixed time
pub struct ClientSponsor {
    renewal_time: Duration,
    leases: Mutex<Vec<Weak<Lease>>>,
}

impl ClientSponsor {
    pub fn new(renewal_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            renewal_time,
            leases: Mutex::new(Vec::new()),
        })
    }

    pub fn renewal_time(&self) -> Duration {
        self.renewal_time
    }

    /// Sponsor `lease`. Returns false if the lease would not take it.
    pub fn register(self: &Arc<Self>, lease: &Arc<Lease>) -> bool {
        let sponsor: Arc<dyn Sponsor> = self.clone();
        if !lease.register(sponsor) {
            return false;
        }
        let mut leases = self.leases.lock();
        leases.retain(|l| l.strong_count() > 0);
        leases.push(Arc::downgrade(lease));
        true
    }

    /// Stop sponsoring `lease`
    pub fn unregister(self: &Arc<Self>, lease: &Arc<Lease>) {
        let sponsor: Arc<dyn Sponsor> = self.clone();
        lease.unregister(&sponsor);
        self.leases
            .lock()
            .retain(|l| l.strong_count() > 0 && !std::ptr::eq(l.as_ptr(), Arc::as_ptr(lease)));
    }

    /// Stop sponsoring every lease
    pub fn close(self: &Arc<Self>) {
        let leases: Vec<Weak<Lease>> = std::mem::take(&mut *self.leases.lock());
        let sponsor: Arc<dyn Sponsor> = self.clone();
        for lease in leases.iter().filter_map(Weak::upgrade) {
            lease.unregister(&sponsor);
        }
        debug!(count = leases.len(), "client sponsor closed");
    }

    /// Number of live leases being sponsored
    pub fn lease_count(&self) -> usize {
        self.leases
            .lock()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }
}

impl Sponsor for ClientSponsor {
    fn renewal(&self, lease: &Lease) -> Result<Duration> {
        debug!(lease = lease.id(), renewal = ?self.renewal_time, "client sponsor renewing");
        Ok(self.renewal_time)
    }
}
