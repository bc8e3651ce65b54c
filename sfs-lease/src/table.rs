//! Per-file lease table.

use crate::record::LeaseRecord;
use crate::store::InodePin;
use sfs_core::{ClientOrd, FileId, LeaseMask};
use std::sync::Arc;
use tokio::time::Instant;

/// All leases on one file. Holds the file pinned for as long as it exists.
#[derive(Debug)]
pub struct LeaseTable {
    ino: FileId,
    records: Vec<LeaseRecord>,
    notify_cursor: usize,
    /// Bumped on every write-capable grant.
    pub write_seq: u64,
    /// Client that owns the file size while appending.
    pub size_owner: Option<ClientOrd>,
    /// Sole writer when multi-host write is off.
    pub write_owner: Option<ClientOrd>,
    retired: bool,
    _pin: Arc<InodePin>,
}

impl LeaseTable {
    #[must_use]
    pub fn new(ino: FileId, pin: Arc<InodePin>) -> Self {
        Self {
            ino,
            records: Vec::new(),
            notify_cursor: 0,
            write_seq: 0,
            size_owner: None,
            write_owner: None,
            retired: false,
            _pin: pin,
        }
    }

    #[inline]
    #[must_use]
    pub fn ino(&self) -> FileId {
        self.ino
    }

    /// Set once the table has been unlinked from the manager's map.
    #[inline]
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    #[must_use]
    pub fn records(&self) -> &[LeaseRecord] {
        &self.records
    }

    #[must_use]
    pub fn record(&self, client: ClientOrd) -> Option<&LeaseRecord> {
        self.records.iter().find(|r| r.client == client)
    }

    pub fn record_mut(&mut self, client: ClientOrd) -> Option<&mut LeaseRecord> {
        self.records.iter_mut().find(|r| r.client == client)
    }

    pub fn record_or_insert(&mut self, client: ClientOrd) -> &mut LeaseRecord {
        let idx = match self.records.iter().position(|r| r.client == client) {
            Some(idx) => idx,
            None => {
                self.records.push(LeaseRecord::new(client));
                self.records.len() - 1
            },
        };
        &mut self.records[idx]
    }

    /// `(other, other_mmap)` as seen by `client`.
    #[must_use]
    pub fn other_masks(&self, client: ClientOrd) -> (LeaseMask, LeaseMask) {
        let mut other = LeaseMask::EMPTY;
        let mut other_mmap = LeaseMask::EMPTY;
        for rec in self.records.iter().filter(|r| r.client != client) {
            other |= rec.held;
            if rec.held.intersects(LeaseMask::MAP) {
                other_mmap |= rec.held;
            }
        }
        (other, other_mmap)
    }

    /// Union of every client's held mask.
    #[must_use]
    pub fn held_union(&self) -> LeaseMask {
        self.records.iter().fold(LeaseMask::EMPTY, |m, r| m | r.held)
    }

    #[must_use]
    pub fn any_other_waiting(&self, client: ClientOrd) -> bool {
        self.records
            .iter()
            .any(|r| r.client != client && !r.waiting.is_empty())
    }

    /// Clients holding any of `mask`, other than `client`.
    #[must_use]
    pub fn holders_of(&self, mask: LeaseMask, client: ClientOrd) -> Vec<(ClientOrd, LeaseMask)> {
        self.records
            .iter()
            .filter(|r| r.client != client && r.held.intersects(mask))
            .map(|r| (r.client, r.held & mask))
            .collect()
    }

    /// Next waiting record, round-robin from the notify cursor, for which
    /// `satisfiable` accepts the waiting mask.
    pub fn next_waiter(
        &mut self,
        mut satisfiable: impl FnMut(&Self, ClientOrd, LeaseMask) -> bool,
    ) -> Option<(ClientOrd, LeaseMask)> {
        let n = self.records.len();
        for step in 0..n {
            let idx = (self.notify_cursor + step) % n;
            let rec = &self.records[idx];
            if rec.waiting.is_empty() {
                continue;
            }
            let (client, waiting) = (rec.client, rec.waiting);
            if satisfiable(self, client, waiting) {
                self.notify_cursor = (idx + 1) % n;
                return Some((client, waiting));
            }
        }
        None
    }

    /// Drop records with nothing held or awaited.
    pub fn prune(&mut self) {
        self.records.retain(|r| !r.is_empty());
        if self.notify_cursor >= self.records.len() {
            self.notify_cursor = 0;
        }
    }

    #[must_use]
    pub fn earliest_expiry(&self) -> Option<Instant> {
        self.records.iter().filter_map(LeaseRecord::earliest_expiry).min()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.iter().all(LeaseRecord::is_empty)
    }
}
