use crate::lease::FileId;

/// Point-in-time view of an inode as supplied by the allocator layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeSnapshot {
    pub ino: FileId,
    pub generation: u32,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    /// Bytes of backing store allocated, including pre-allocation.
    pub allocated: u64,
    pub mtime: i64,
}

impl InodeSnapshot {
    #[must_use]
    pub fn new(ino: FileId) -> Self {
        Self {
            ino,
            nlink: 1,
            ..Self::default()
        }
    }
}

/// Filesystem-wide counters returned by `Block.statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub files: u64,
}
