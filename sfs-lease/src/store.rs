//! Collaborator seams: the inode layer and the archive/stage subsystem.

use sfs_core::{ClientOrd, FileId, InodeSnapshot, Result, ShareError};
use sfs_network::{Callout, Notify};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Inode operations the lease manager consumes from the allocator layer.
pub trait InodeStore: Send + Sync {
    fn read_inode(&self, ino: FileId) -> Result<InodeSnapshot>;

    /// Persist the inode's metadata.
    fn write_inode_back(&self, inode: &InodeSnapshot) -> Result<()>;

    fn invalidate_cached_pages(&self, ino: FileId, offset: u64, len: u64);

    /// Set the file size and release backing store beyond it.
    fn truncate_to_size(&self, ino: FileId, size: u64) -> Result<()>;

    /// Keep `ino` resident until the returned pin is dropped.
    fn pin(&self, ino: FileId) -> Result<InodePin>;
}

/// Lease transitions reported to the archiving and staging subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveEvent {
    /// No client holds a data-modifying lease any more.
    Archivable,
    /// Truncate and exclusive holders are gone; staging may proceed.
    Stageable,
}

pub trait ArchiveHook: Send + Sync {
    fn lease_transition(&self, ino: FileId, event: ArchiveEvent);
}

/// Archive hook that ignores every event.
#[derive(Debug, Default)]
pub struct NoArchive;

impl ArchiveHook for NoArchive {
    fn lease_transition(&self, _ino: FileId, _event: ArchiveEvent) {}
}

/// Outbound server-to-client traffic raised by lease decisions.
///
/// Called with the file's table lock held; implementations must not block.
pub trait LeaseEvents: Send + Sync {
    fn callout(&self, client: ClientOrd, callout: Callout);
    fn notify(&self, client: ClientOrd, notify: Notify);
}

type ReleaseFn = Box<dyn FnOnce(FileId) + Send + Sync>;

/// Holds an inode resident. Dropping the pin releases it.
pub struct InodePin {
    ino: FileId,
    release: Option<ReleaseFn>,
}

impl InodePin {
    pub fn new(ino: FileId, release: impl FnOnce(FileId) + Send + Sync + 'static) -> Self {
        Self {
            ino,
            release: Some(Box::new(release)),
        }
    }

    #[inline]
    #[must_use]
    pub fn ino(&self) -> FileId {
        self.ino
    }
}

impl Drop for InodePin {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.ino);
        }
    }
}

impl std::fmt::Debug for InodePin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodePin").field("ino", &self.ino).finish()
    }
}

#[derive(Default)]
struct MemoryInner {
    inodes: HashMap<FileId, InodeSnapshot>,
    pins: HashMap<FileId, usize>,
    flushes: HashMap<FileId, usize>,
    invalidations: HashMap<FileId, usize>,
    next_ino: u64,
}

/// In-memory inode table standing in for the on-disk allocator.
#[derive(Clone, Default)]
pub struct MemoryInodeStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryInodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryInner) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Insert or replace an inode.
    pub fn insert(&self, inode: InodeSnapshot) {
        self.with(|inner| {
            inner.next_ino = inner.next_ino.max(inode.ino.0);
            inner.inodes.insert(inode.ino, inode);
        });
    }

    /// Allocate a fresh inode with `mode`.
    pub fn allocate(&self, mode: u32) -> InodeSnapshot {
        self.with(|inner| {
            inner.next_ino += 1;
            let mut inode = InodeSnapshot::new(FileId(inner.next_ino));
            inode.mode = mode;
            inode.generation = 1;
            inner.inodes.insert(inode.ino, inode);
            inode
        })
    }

    pub fn remove(&self, ino: FileId) -> Option<InodeSnapshot> {
        self.with(|inner| inner.inodes.remove(&ino))
    }

    /// Apply `f` to a stored inode.
    pub fn update(&self, ino: FileId, f: impl FnOnce(&mut InodeSnapshot)) -> Result<InodeSnapshot> {
        self.with(|inner| match inner.inodes.get_mut(&ino) {
            Some(inode) => {
                f(inode);
                Ok(*inode)
            },
            None => Err(ShareError::NotFound(format!("inode {ino}"))),
        })
    }

    #[must_use]
    pub fn pin_count(&self, ino: FileId) -> usize {
        self.with(|inner| inner.pins.get(&ino).copied().unwrap_or(0))
    }

    #[must_use]
    pub fn flush_count(&self, ino: FileId) -> usize {
        self.with(|inner| inner.flushes.get(&ino).copied().unwrap_or(0))
    }

    #[must_use]
    pub fn invalidation_count(&self, ino: FileId) -> usize {
        self.with(|inner| inner.invalidations.get(&ino).copied().unwrap_or(0))
    }

    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.with(|inner| inner.inodes.len())
    }
}

impl InodeStore for MemoryInodeStore {
    fn read_inode(&self, ino: FileId) -> Result<InodeSnapshot> {
        self.with(|inner| inner.inodes.get(&ino).copied())
            .ok_or_else(|| ShareError::NotFound(format!("inode {ino}")))
    }

    fn write_inode_back(&self, inode: &InodeSnapshot) -> Result<()> {
        self.with(|inner| {
            if !inner.inodes.contains_key(&inode.ino) {
                return Err(ShareError::NotFound(format!("inode {}", inode.ino)));
            }
            inner.inodes.insert(inode.ino, *inode);
            *inner.flushes.entry(inode.ino).or_insert(0) += 1;
            Ok(())
        })
    }

    fn invalidate_cached_pages(&self, ino: FileId, _offset: u64, _len: u64) {
        self.with(|inner| *inner.invalidations.entry(ino).or_insert(0) += 1);
    }

    fn truncate_to_size(&self, ino: FileId, size: u64) -> Result<()> {
        self.update(ino, |inode| {
            inode.size = size;
            inode.allocated = size;
        })
        .map(|_| ())
    }

    fn pin(&self, ino: FileId) -> Result<InodePin> {
        self.read_inode(ino)?;
        self.with(|inner| *inner.pins.entry(ino).or_insert(0) += 1);
        let inner = Arc::clone(&self.inner);
        Ok(InodePin::new(ino, move |ino| {
            let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(count) = guard.pins.get_mut(&ino) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    guard.pins.remove(&ino);
                }
            }
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_released_on_drop() {
        let store = MemoryInodeStore::new();
        let inode = store.allocate(0o100_644);
        let pin = store.pin(inode.ino).unwrap();
        assert_eq!(store.pin_count(inode.ino), 1);
        drop(pin);
        assert_eq!(store.pin_count(inode.ino), 0);
    }

    #[test]
    fn test_pin_missing_inode_fails() {
        let store = MemoryInodeStore::new();
        assert!(matches!(store.pin(FileId(99)), Err(ShareError::NotFound(_))));
    }

    #[test]
    fn test_truncate_releases_allocation() {
        let store = MemoryInodeStore::new();
        let ino = store.allocate(0o100_644).ino;
        store
            .update(ino, |i| {
                i.size = 100;
                i.allocated = 4096;
            })
            .unwrap();
        store.truncate_to_size(ino, 100).unwrap();
        let inode = store.read_inode(ino).unwrap();
        assert_eq!(inode.allocated, 100);
    }
}
