//! Lease duration policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-side lease duration policy.
///
/// A client asks for an interval; the server stretches it to
/// `interval * mul + add` but keeps the extra time inside `[min, max]`
/// seconds so a client never loses a lease early and a dead client never
/// pins a file for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeasePolicy {
    pub mul: u32,
    pub add: u32,
    pub min_secs: u32,
    pub max_secs: u32,
    /// Seconds a conflicting request waits before holders are asked to
    /// relinquish. Negative disables relinquish callouts.
    pub lease_timeout_secs: i32,
    /// Longest lease a client may request.
    pub max_lease_secs: u32,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            mul: 2,
            add: 0,
            min_secs: 600,
            max_secs: 65_535,
            lease_timeout_secs: 0,
            max_lease_secs: 600,
        }
    }
}

impl LeasePolicy {
    #[must_use]
    pub fn with_bounds(mut self, min_secs: u32, max_secs: u32) -> Self {
        self.min_secs = min_secs;
        self.max_secs = max_secs;
        self
    }

    #[must_use]
    pub fn with_scaling(mut self, mul: u32, add: u32) -> Self {
        self.mul = mul;
        self.add = add;
        self
    }

    #[must_use]
    pub fn with_lease_timeout(mut self, secs: i32) -> Self {
        self.lease_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_max_lease(mut self, secs: u32) -> Self {
        self.max_lease_secs = secs;
        self
    }

    /// Server-side expiry for a client-requested interval, in seconds.
    ///
    /// Always within `[interval + min, interval + max]`.
    #[must_use]
    pub fn server_timeout_secs(&self, interval_secs: u32) -> u64 {
        let t = u64::from(interval_secs);
        let stretched = t * u64::from(self.mul) + u64::from(self.add);
        let extra = stretched
            .saturating_sub(t)
            .clamp(u64::from(self.min_secs), u64::from(self.max_secs.max(self.min_secs)));
        t + extra
    }

    #[must_use]
    pub fn server_timeout(&self, interval_secs: u32) -> Duration {
        Duration::from_secs(self.server_timeout_secs(interval_secs))
    }

    #[inline]
    #[must_use]
    pub fn callouts_enabled(&self) -> bool {
        self.lease_timeout_secs >= 0
    }

    /// Bound on a blocked byte-range lock attempt.
    #[must_use]
    pub fn frlock_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_lease_secs / 2).max(1))
    }

    /// Clamp a requested interval to the configured maximum.
    #[must_use]
    pub fn clamp_interval(&self, interval_secs: u32) -> u32 {
        interval_secs.min(self.max_lease_secs)
    }
}
