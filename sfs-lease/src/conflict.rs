//! Lease conflict table.
//!
//! Pure function of what other clients hold. `other` is the union of every
//! other client's held mask; `other_mmap` counts only clients that also
//! hold a map lease.

use sfs_core::{ActionFlags, LeaseMask, LeaseType, TruncateKind};

#[derive(Debug, Clone, Copy)]
pub struct ConflictInput {
    pub ltype: LeaseType,
    pub other: LeaseMask,
    pub other_mmap: LeaseMask,
    /// Leases the requester itself already holds.
    pub own: LeaseMask,
    pub multihost: bool,
    pub truncate: TruncateKind,
    /// Truncate request grows the file.
    pub growing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Grant { actions: ActionFlags },
    /// Blocked; `relinquish` is what conflicting holders are asked to give up.
    Wait { relinquish: LeaseMask },
}

impl Decision {
    const GRANT: Self = Self::Grant {
        actions: ActionFlags::EMPTY,
    };
    const DIRECT_IO: Self = Self::Grant {
        actions: ActionFlags::DIRECTIO_ON,
    };

    #[inline]
    #[must_use]
    pub fn is_grant(self) -> bool {
        matches!(self, Self::Grant { .. })
    }
}

const fn wait(relinquish: LeaseMask) -> Decision {
    Decision::Wait { relinquish }
}

#[must_use]
pub fn evaluate(input: &ConflictInput) -> Decision {
    let other = input.other;
    let mmap = input.other_mmap;
    let mh = input.multihost;

    match input.ltype {
        LeaseType::Read | LeaseType::ReadMap => {
            if other.intersects(LeaseMask::TRUNCATE | LeaseMask::EXCLUSIVE) {
                return wait(LeaseMask::EMPTY);
            }
            if mmap.intersects(LeaseMask::WRITE | LeaseMask::WRITE_MAP) {
                return wait(LeaseMask::WRITE | LeaseMask::WRITE_MAP);
            }
            if other.intersects(LeaseMask::WRITE_APPEND) {
                if mh {
                    return Decision::DIRECT_IO;
                }
                return wait(LeaseMask::WRITE_APPEND);
            }
            Decision::GRANT
        },
        LeaseType::Write | LeaseType::WriteMap => {
            if other.intersects(LeaseMask::TRUNCATE | LeaseMask::STAGE | LeaseMask::EXCLUSIVE) {
                return wait(LeaseMask::EMPTY);
            }
            let busy = other.difference(LeaseMask::OPEN | LeaseMask::FRLOCK | LeaseMask::MAP);
            if busy.is_empty() {
                return Decision::GRANT;
            }
            if !mh {
                return wait(LeaseMask::APPEND | LeaseMask::READ_WRITE);
            }
            if mmap.intersects(LeaseMask::READ_WRITE) {
                return wait(LeaseMask::READ_WRITE);
            }
            if input.own.intersects(LeaseMask::MAP) && other.intersects(LeaseMask::WRITE_APPEND) {
                return wait(LeaseMask::WRITE_APPEND);
            }
            Decision::DIRECT_IO
        },
        LeaseType::Append => {
            if other.intersects(
                LeaseMask::APPEND | LeaseMask::TRUNCATE | LeaseMask::STAGE | LeaseMask::EXCLUSIVE,
            ) || mmap.intersects(LeaseMask::READ_WRITE)
            {
                return wait(LeaseMask::APPEND);
            }
            if other
                .difference(LeaseMask::OPEN | LeaseMask::FRLOCK)
                .is_empty()
            {
                return Decision::GRANT;
            }
            if mh {
                Decision::DIRECT_IO
            } else {
                wait(LeaseMask::READ_WRITE)
            }
        },
        LeaseType::Truncate => {
            let busy = other.difference(LeaseMask::STAGE | LeaseMask::OPEN | LeaseMask::FRLOCK);
            if busy.is_empty() || input.truncate == TruncateKind::Release {
                return Decision::GRANT;
            }
            if input.growing && mh && !other.contains(LeaseType::Append) {
                return Decision::GRANT;
            }
            if input.growing {
                wait(LeaseMask::EMPTY)
            } else {
                wait(LeaseMask::APPEND | LeaseMask::READ_WRITE)
            }
        },
        LeaseType::Exclusive => {
            if other.difference(LeaseMask::OPEN).is_empty() {
                Decision::GRANT
            } else {
                wait(LeaseMask::READ_WRITE | LeaseMask::APPEND | LeaseMask::MAP)
            }
        },
        LeaseType::Stage | LeaseType::Open | LeaseType::FileRecordLock => Decision::GRANT,
    }
}
