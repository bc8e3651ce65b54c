//! Byte-range record locks riding the `FileRecordLock` lease.

use sfs_core::{ClientOrd, FileId};
use sfs_network::{LockKind, RecordLock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// How a blocked lock attempt finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrlockOutcome {
    Granted,
    TimedOut,
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
struct HeldRange {
    client: ClientOrd,
    owner: u64,
    start: u64,
    /// Exclusive end; `u64::MAX` for "to end of file".
    end: u64,
    exclusive: bool,
}

impl HeldRange {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

#[derive(Default)]
struct FileLocks {
    held: Vec<HeldRange>,
    changed: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    files: HashMap<FileId, FileLocks>,
    cancel: HashMap<ClientOrd, CancellationToken>,
}

/// Held byte-range locks for every file plus cancellation of blocked
/// attempts per client.
#[derive(Clone, Default)]
pub struct RecordLocks {
    inner: Arc<Mutex<Inner>>,
}

fn range_of(lock: &RecordLock) -> (u64, u64) {
    let end = if lock.len == 0 {
        u64::MAX
    } else {
        lock.start.saturating_add(lock.len)
    };
    (lock.start, end)
}

impl RecordLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock if nothing conflicting is held. Existing ranges of the
    /// same owner inside the request are replaced.
    pub fn try_lock(&self, ino: FileId, client: ClientOrd, lock: &RecordLock) -> bool {
        let exclusive = lock.kind == LockKind::Exclusive;
        let (start, end) = range_of(lock);
        let mut inner = self.lock();
        let file = inner.files.entry(ino).or_default();
        let conflict = file.held.iter().any(|h| {
            (h.client, h.owner) != (client, lock.owner)
                && h.overlaps(start, end)
                && (exclusive || h.exclusive)
        });
        if conflict {
            return false;
        }
        split_out(&mut file.held, client, lock.owner, start, end);
        file.held.push(HeldRange {
            client,
            owner: lock.owner,
            start,
            end,
            exclusive,
        });
        true
    }

    pub fn unlock(&self, ino: FileId, client: ClientOrd, lock: &RecordLock) {
        let (start, end) = range_of(lock);
        let mut inner = self.lock();
        if let Some(file) = inner.files.get_mut(&ino) {
            split_out(&mut file.held, client, lock.owner, start, end);
            file.changed.notify_waiters();
            if file.held.is_empty() {
                inner.files.remove(&ino);
            }
        }
    }

    /// Drop every lock `client` holds on `ino`.
    pub fn unlock_all(&self, ino: FileId, client: ClientOrd) {
        let mut inner = self.lock();
        if let Some(file) = inner.files.get_mut(&ino) {
            file.held.retain(|h| h.client != client);
            file.changed.notify_waiters();
            if file.held.is_empty() {
                inner.files.remove(&ino);
            }
        }
    }

    /// Wake every blocked attempt of `client` with `Interrupted`.
    pub fn cancel_client(&self, client: ClientOrd) {
        if let Some(token) = self.lock().cancel.remove(&client) {
            token.cancel();
        }
    }

    #[must_use]
    pub fn held_count(&self, ino: FileId) -> usize {
        self.lock().files.get(&ino).map_or(0, |f| f.held.len())
    }

    /// Retry `lock` each time a range on the file is released, until it is
    /// taken, `timeout` passes, or the client's attempts are cancelled.
    pub async fn lock_blocking(
        &self,
        ino: FileId,
        client: ClientOrd,
        lock: RecordLock,
        timeout: Duration,
    ) -> FrlockOutcome {
        let deadline = Instant::now() + timeout;
        let token = self
            .lock()
            .cancel
            .entry(client)
            .or_default()
            .child_token();

        loop {
            let changed = {
                let mut inner = self.lock();
                Arc::clone(&inner.files.entry(ino).or_default().changed)
            };
            let notified = changed.notified();
            if self.try_lock(ino, client, &lock) {
                return FrlockOutcome::Granted;
            }
            tokio::select! {
                () = notified => {},
                () = sleep_until(deadline) => return FrlockOutcome::TimedOut,
                () = token.cancelled() => return FrlockOutcome::Interrupted,
            }
        }
    }
}

/// Remove `[start, end)` from the ranges held by `(client, owner)`,
/// splitting ranges that straddle it.
fn split_out(held: &mut Vec<HeldRange>, client: ClientOrd, owner: u64, start: u64, end: u64) {
    let mut kept = Vec::with_capacity(held.len() + 1);
    for h in held.drain(..) {
        if h.client != client || h.owner != owner || !h.overlaps(start, end) {
            kept.push(h);
            continue;
        }
        if h.start < start {
            kept.push(HeldRange { end: start, ..h });
        }
        if end < h.end {
            kept.push(HeldRange { start: end, ..h });
        }
    }
    *held = kept;
}
