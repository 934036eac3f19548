//! Sponsor selection

use std::fmt;
use std::time::Duration;

/// Where a sponsor is in the renewal protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SponsorState {
    /// Registered, not yet asked
    Initial,
    /// Renewal call in flight
    Waiting,
    /// Renewed the lease at least once
    Completed,
}

/// What a policy sees of one registered sponsor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SponsorCandidate {
    pub state: SponsorState,
    /// Renewal granted the last time this sponsor was asked (or the hint
    /// given at registration)
    pub last_renewal: Duration,
}

/// Picks the next sponsor to ask when a lease runs out
///
/// Any policy is acceptable as long as it never picks a `Waiting` sponsor
/// and returns `None` only when no other sponsor is left.
pub trait SponsorPolicy: fmt::Debug + Send + Sync {
    fn select(&self, candidates: &[SponsorCandidate]) -> Option<usize>;
}

/// Ask the sponsor that renewed most generously before; otherwise the
/// first sponsor that has never been asked.
#[derive(Clone, Copy, Debug, Default)]
pub struct LargestRenewalFirst;

impl SponsorPolicy for LargestRenewalFirst {
    fn select(&self, candidates: &[SponsorCandidate]) -> Option<usize> {
        let mut best: Option<(usize, Duration)> = None;
        for (i, c) in candidates.iter().enumerate() {
            if c.state == SponsorState::Waiting || c.last_renewal.is_zero() {
                continue;
            }
            if best.map_or(true, |(_, d)| c.last_renewal > d) {
                best = Some((i, c.last_renewal));
            }
        }
        best.map(|(i, _)| i).or_else(|| {
            candidates
                .iter()
                .position(|c| c.state == SponsorState::Initial)
        })
    }
}

/// Ask sponsors in registration order
#[derive(Clone, Copy, Debug, Default)]
pub struct RegistrationOrder;

impl SponsorPolicy for RegistrationOrder {
    fn select(&self, candidates: &[SponsorCandidate]) -> Option<usize> {
        candidates
            .iter()
            .position(|c| c.state != SponsorState::Waiting)
    }
}
