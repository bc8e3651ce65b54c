//! Namespace operations served by the metadata server.

use sfs_core::{ErrorCode, FileId, InodeSnapshot, Result, ShareError};
use sfs_lease::{InodeStore, MemoryInodeStore};
use sfs_network::{NameReply, NameRequest};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;
const S_IFLNK: u32 = 0o120_000;

pub const ROOT_MODE: u32 = S_IFDIR | 0o755;
pub const SYMLINK_MODE: u32 = S_IFLNK | 0o777;

#[inline]
#[must_use]
pub const fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Directory operations applied on behalf of clients.
pub trait Namespace: Send + Sync {
    fn root(&self) -> FileId;

    fn file_count(&self) -> u64;

    fn apply(&self, request: &NameRequest) -> Result<NameReply>;
}

fn fail(code: ErrorCode) -> ShareError {
    ShareError::Remote(code)
}

#[derive(Default)]
struct Dirs {
    entries: HashMap<FileId, BTreeMap<String, FileId>>,
    acls: HashMap<FileId, bytes::Bytes>,
}

/// Directory tree kept in memory over a [`MemoryInodeStore`].
pub struct MemoryNamespace {
    store: MemoryInodeStore,
    root: FileId,
    dirs: Mutex<Dirs>,
}

impl MemoryNamespace {
    #[must_use]
    pub fn new(store: MemoryInodeStore) -> Self {
        let mut root = store.allocate(ROOT_MODE);
        root.nlink = 2;
        store.insert(root);
        let mut dirs = Dirs::default();
        dirs.entries.insert(root.ino, BTreeMap::new());
        Self {
            store,
            root: root.ino,
            dirs: Mutex::new(dirs),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Dirs> {
        self.dirs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn acl(&self, ino: FileId) -> Option<bytes::Bytes> {
        self.lock().acls.get(&ino).cloned()
    }

    fn dir(dirs: &mut Dirs, parent: FileId) -> Result<&mut BTreeMap<String, FileId>> {
        dirs.entries
            .get_mut(&parent)
            .ok_or_else(|| fail(ErrorCode::NOT_DIRECTORY))
    }

    fn lookup(dirs: &mut Dirs, parent: FileId, name: &str) -> Result<FileId> {
        Self::dir(dirs, parent)?
            .get(name)
            .copied()
            .ok_or_else(|| fail(ErrorCode::NOT_FOUND))
    }

    fn reply(&self, ino: FileId, parent: FileId) -> Result<NameReply> {
        Ok(NameReply {
            inode: self.store.read_inode(ino)?,
            parent: self.store.read_inode(parent)?,
        })
    }

    fn make(
        &self,
        dirs: &mut Dirs,
        parent: FileId,
        name: &str,
        mode: u32,
        size: u64,
    ) -> Result<NameReply> {
        if Self::dir(dirs, parent)?.contains_key(name) {
            return Err(fail(ErrorCode::EXISTS));
        }
        let mut inode = self.store.allocate(mode);
        inode.size = size;
        if is_dir(mode) {
            inode.nlink = 2;
            dirs.entries.insert(inode.ino, BTreeMap::new());
            self.store.update(parent, |p| p.nlink += 1)?;
        }
        self.store.insert(inode);
        Self::dir(dirs, parent)?.insert(name.to_string(), inode.ino);
        self.reply(inode.ino, parent)
    }

    /// Drop one link to `ino`, freeing the inode when none remain.
    fn unlink(&self, dirs: &mut Dirs, parent: FileId, ino: FileId) -> Result<InodeSnapshot> {
        let inode = self.store.read_inode(ino)?;
        if is_dir(inode.mode) {
            dirs.entries.remove(&ino);
            self.store.update(parent, |p| p.nlink = p.nlink.saturating_sub(1))?;
            self.store.remove(ino);
            dirs.acls.remove(&ino);
            return Ok(InodeSnapshot { nlink: 0, ..inode });
        }
        let after = self
            .store
            .update(ino, |i| i.nlink = i.nlink.saturating_sub(1))?;
        if after.nlink == 0 {
            self.store.remove(ino);
            dirs.acls.remove(&ino);
        }
        Ok(after)
    }

    fn remove(&self, dirs: &mut Dirs, parent: FileId, name: &str, want_dir: bool) -> Result<NameReply> {
        let ino = Self::lookup(dirs, parent, name)?;
        let inode = self.store.read_inode(ino)?;
        match (want_dir, is_dir(inode.mode)) {
            (true, false) => return Err(fail(ErrorCode::NOT_DIRECTORY)),
            (false, true) => return Err(fail(ErrorCode::NOT_PERMITTED)),
            (true, true) if dirs.entries.get(&ino).is_some_and(|d| !d.is_empty()) => {
                return Err(fail(ErrorCode::NOT_EMPTY));
            },
            _ => {},
        }
        Self::dir(dirs, parent)?.remove(name);
        let inode = self.unlink(dirs, parent, ino)?;
        Ok(NameReply {
            inode,
            parent: self.store.read_inode(parent)?,
        })
    }

    fn rename(
        &self,
        dirs: &mut Dirs,
        parent: FileId,
        name: &str,
        new_parent: FileId,
        new_name: &str,
    ) -> Result<NameReply> {
        let ino = Self::lookup(dirs, parent, name)?;
        Self::dir(dirs, new_parent)?;
        if let Some(&existing) = dirs.entries.get(&new_parent).and_then(|d| d.get(new_name)) {
            if existing == ino {
                return self.reply(ino, new_parent);
            }
            if dirs.entries.get(&existing).is_some_and(|d| !d.is_empty()) {
                return Err(fail(ErrorCode::NOT_EMPTY));
            }
            Self::dir(dirs, new_parent)?.remove(new_name);
            self.unlink(dirs, new_parent, existing)?;
        }
        Self::dir(dirs, parent)?.remove(name);
        Self::dir(dirs, new_parent)?.insert(new_name.to_string(), ino);
        if parent != new_parent && dirs.entries.contains_key(&ino) {
            self.store.update(parent, |p| p.nlink = p.nlink.saturating_sub(1))?;
            self.store.update(new_parent, |p| p.nlink += 1)?;
        }
        self.reply(ino, new_parent)
    }
}

impl Namespace for MemoryNamespace {
    fn root(&self) -> FileId {
        self.root
    }

    fn file_count(&self) -> u64 {
        self.store.inode_count() as u64
    }

    fn apply(&self, request: &NameRequest) -> Result<NameReply> {
        let mut dirs = self.lock();
        match request {
            NameRequest::Create { parent, name, mode } => {
                let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { *mode };
                self.make(&mut dirs, *parent, name, mode, 0)
            },
            NameRequest::Mkdir { parent, name, mode } => {
                self.make(&mut dirs, *parent, name, S_IFDIR | (mode & !S_IFMT), 0)
            },
            NameRequest::Symlink { parent, name, target } => {
                self.make(&mut dirs, *parent, name, SYMLINK_MODE, target.len() as u64)
            },
            NameRequest::Remove { parent, name } => self.remove(&mut dirs, *parent, name, false),
            NameRequest::Rmdir { parent, name } => self.remove(&mut dirs, *parent, name, true),
            NameRequest::Link { ino, parent, name } => {
                let inode = self.store.read_inode(*ino)?;
                if is_dir(inode.mode) {
                    return Err(fail(ErrorCode::NOT_PERMITTED));
                }
                let dir = Self::dir(&mut dirs, *parent)?;
                if dir.contains_key(name.as_str()) {
                    return Err(fail(ErrorCode::EXISTS));
                }
                dir.insert(name.clone(), *ino);
                self.store.update(*ino, |i| i.nlink += 1)?;
                self.reply(*ino, *parent)
            },
            NameRequest::Rename {
                parent,
                name,
                new_parent,
                new_name,
            } => self.rename(&mut dirs, *parent, name, *new_parent, new_name),
            NameRequest::Acl { ino, acl } => {
                let inode = self.store.read_inode(*ino)?;
                dirs.acls.insert(*ino, acl.clone());
                Ok(NameReply {
                    inode,
                    parent: inode,
                })
            },
            NameRequest::Lookup { parent, name } => {
                let ino = Self::lookup(&mut dirs, *parent, name)?;
                self.reply(ino, *parent)
            },
        }
    }
}
