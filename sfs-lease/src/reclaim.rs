//! Expiry timers, one per leased file.

use crate::manager::LeaseManager;
use sfs_core::FileId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

struct Scheduled {
    at: Instant,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct Reclaimer {
    tasks: Mutex<HashMap<FileId, Scheduled>>,
}

impl Reclaimer {
    fn tasks(&self) -> MutexGuard<'_, HashMap<FileId, Scheduled>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run reclamation for `ino` at `at`, replacing any earlier schedule.
    pub(crate) fn schedule(&self, ino: FileId, at: Instant, manager: Weak<LeaseManager>) {
        let mut tasks = self.tasks();
        if let Some(existing) = tasks.get(&ino) {
            if existing.at == at && !existing.task.is_finished() {
                return;
            }
        }
        let task = tokio::spawn(async move {
            sleep_until(at).await;
            if let Some(manager) = manager.upgrade() {
                manager.reclaimer().finished(ino, at);
                manager.reclaim_expired(ino).await;
            }
        });
        if let Some(old) = tasks.insert(ino, Scheduled { at, task }) {
            old.task.abort();
        }
    }

    pub(crate) fn cancel(&self, ino: FileId) {
        if let Some(old) = self.tasks().remove(&ino) {
            old.task.abort();
        }
    }

    /// Forget the entry of a task that has started running.
    fn finished(&self, ino: FileId, at: Instant) {
        let mut tasks = self.tasks();
        if tasks.get(&ino).is_some_and(|s| s.at == at) {
            tasks.remove(&ino);
        }
    }

    pub(crate) fn scheduled_at(&self, ino: FileId) -> Option<Instant> {
        self.tasks().get(&ino).map(|s| s.at)
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        for (_, s) in self.tasks().drain() {
            s.task.abort();
        }
    }
}
