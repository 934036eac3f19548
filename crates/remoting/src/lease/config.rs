//! Process-wide lifetime settings
//!
//! Each setting can be assigned once, and only before it is first read.
//! Reading a setting that was never assigned locks in its default.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

use super::Lease;
use crate::error::{RemotingError, Result};

/// A value that may be assigned at most once
#[derive(Debug)]
pub struct SetOnce<T> {
    name: &'static str,
    default: T,
    value: OnceLock<T>,
}

impl<T: Copy + std::fmt::Debug> SetOnce<T> {
    pub fn new(name: &'static str, default: T) -> Self {
        Self {
            name,
            default,
            value: OnceLock::new(),
        }
    }

    /// Assign the value; fails if it was assigned or read before
    pub fn set(&self, value: T) -> Result<()> {
        self.value
            .set(value)
            .map_err(|_| RemotingError::SettingAlreadyAssigned(self.name))?;
        debug!(setting = self.name, ?value, "lifetime setting assigned");
        Ok(())
    }

    pub fn get(&self) -> T {
        *self.value.get_or_init(|| self.default)
    }

    pub fn is_assigned(&self) -> bool {
        self.value.get().is_some()
    }
}

/// Lifetime settings of one remoting domain
#[derive(Debug)]
pub struct LifetimeServices {
    lease_time: SetOnce<Duration>,
    renew_on_call_time: SetOnce<Duration>,
    sponsorship_timeout: SetOnce<Duration>,
    poll_time: SetOnce<Duration>,
}

impl LifetimeServices {
    /// Settings with the given defaults, none assigned yet
    pub fn new(
        lease_time: Duration,
        renew_on_call_time: Duration,
        sponsorship_timeout: Duration,
        poll_time: Duration,
    ) -> Self {
        Self {
            lease_time: SetOnce::new("lease_time", lease_time),
            renew_on_call_time: SetOnce::new("renew_on_call_time", renew_on_call_time),
            sponsorship_timeout: SetOnce::new("sponsorship_timeout", sponsorship_timeout),
            poll_time: SetOnce::new("lease_manager_poll_time", poll_time),
        }
    }

    pub fn set_lease_time(&self, value: Duration) -> Result<()> {
        self.lease_time.set(value)
    }

    pub fn set_renew_on_call_time(&self, value: Duration) -> Result<()> {
        self.renew_on_call_time.set(value)
    }

    pub fn set_sponsorship_timeout(&self, value: Duration) -> Result<()> {
        self.sponsorship_timeout.set(value)
    }

    pub fn set_poll_time(&self, value: Duration) -> Result<()> {
        self.poll_time.set(value)
    }

    pub fn lease_time(&self) -> Duration {
        self.lease_time.get()
    }

    pub fn renew_on_call_time(&self) -> Duration {
        self.renew_on_call_time.get()
    }

    pub fn sponsorship_timeout(&self) -> Duration {
        self.sponsorship_timeout.get()
    }

    pub fn poll_time(&self) -> Duration {
        self.poll_time.get()
    }

    /// A lease in the Initial state carrying the current settings
    pub fn new_lease(&self) -> Lease {
        Lease::new(
            self.lease_time(),
            self.renew_on_call_time(),
            self.sponsorship_timeout(),
        )
    }
}

impl Default for LifetimeServices {
    fn default() -> Self {
        Self::new(
            crate::DEFAULT_LEASE_TIME,
            crate::DEFAULT_RENEW_ON_CALL_TIME,
            crate::DEFAULT_SPONSORSHIP_TIMEOUT,
            crate::DEFAULT_LEASE_POLL_TIME,
        )
    }
}
