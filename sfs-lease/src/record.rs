//! Per-(file, client) lease record.

use sfs_core::{ClientOrd, GenerationSet, LeaseMask, LeaseType, MAX_LEASE_TYPES};
use std::fmt;
use tokio::time::Instant;

/// Where a client stands on one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unheld,
    Waiting,
    Held,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unheld => write!(f, "UNHELD"),
            Self::Waiting => write!(f, "WAITING"),
            Self::Held => write!(f, "HELD"),
        }
    }
}

/// Leases one client holds or awaits on one file.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    pub client: ClientOrd,
    pub held: LeaseMask,
    pub waiting: LeaseMask,
    pub expire_at: [Option<Instant>; MAX_LEASE_TYPES],
    pub gens: GenerationSet,
    pub direct_io: bool,
    /// Table `write_seq` this client last observed with a reading lease.
    pub last_write_seq: u64,
}

impl LeaseRecord {
    #[must_use]
    pub fn new(client: ClientOrd) -> Self {
        Self {
            client,
            held: LeaseMask::EMPTY,
            waiting: LeaseMask::EMPTY,
            expire_at: [None; MAX_LEASE_TYPES],
            gens: GenerationSet::default(),
            direct_io: false,
            last_write_seq: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> LeaseState {
        if !self.held.is_empty() {
            LeaseState::Held
        } else if !self.waiting.is_empty() {
            LeaseState::Waiting
        } else {
            LeaseState::Unheld
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty() && self.waiting.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn holds(&self, ltype: LeaseType) -> bool {
        self.held.contains(ltype)
    }

    pub fn grant(&mut self, ltype: LeaseType, expire_at: Option<Instant>) {
        self.held.insert(ltype);
        self.waiting.remove(ltype);
        self.expire_at[ltype.index()] = expire_at;
    }

    /// Drop `mask` from the held set. Returns the bits actually dropped.
    pub fn release(&mut self, mask: LeaseMask) -> LeaseMask {
        let dropped = self.held & mask;
        for ltype in dropped.iter() {
            self.held.remove(ltype);
            self.expire_at[ltype.index()] = None;
        }
        self.waiting = self.waiting.difference(mask);
        dropped
    }

    /// Held expiring leases whose deadline is at or before `now`.
    #[must_use]
    pub fn expired(&self, now: Instant) -> LeaseMask {
        let mut mask = LeaseMask::EMPTY;
        for ltype in self.held.iter() {
            if ltype.is_non_expiring() {
                continue;
            }
            if self.expire_at[ltype.index()].is_some_and(|at| at <= now) {
                mask.insert(ltype);
            }
        }
        mask
    }

    #[must_use]
    pub fn earliest_expiry(&self) -> Option<Instant> {
        self.held
            .iter()
            .filter(|t| !t.is_non_expiring())
            .filter_map(|t| self.expire_at[t.index()])
            .min()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_transitions() {
        let mut rec = LeaseRecord::new(3);
        assert_eq!(rec.state(), LeaseState::Unheld);
        rec.waiting.insert(LeaseType::Read);
        assert_eq!(rec.state(), LeaseState::Waiting);
        rec.grant(LeaseType::Read, None);
        assert_eq!(rec.state(), LeaseState::Held);
        assert!(rec.waiting.is_empty());
        rec.release(LeaseMask::READ);
        assert!(rec.is_empty());
    }

    #[test]
    fn test_expired_skips_non_expiring() {
        let now = Instant::now();
        let mut rec = LeaseRecord::new(1);
        rec.grant(LeaseType::Read, Some(now));
        rec.grant(LeaseType::Open, Some(now));
        let expired = rec.expired(now + Duration::from_secs(1));
        assert_eq!(expired, LeaseMask::READ);
        assert_eq!(rec.earliest_expiry(), Some(now));
    }

    #[test]
    fn test_release_reports_dropped_bits() {
        let mut rec = LeaseRecord::new(1);
        rec.grant(LeaseType::Write, None);
        let dropped = rec.release(LeaseMask::WRITE | LeaseMask::READ);
        assert_eq!(dropped, LeaseMask::WRITE);
    }
}
