//! Message bodies: one variant per command and operation.

use crate::codec::{WireReader, WireWriter};
use crate::protocol::{
    BlockOp, CalloutOp, Command, InodeOp, LeaseOp, MessageHeader, MountOp, NameOp, NotifyOp,
};
use bytes::Bytes;
use sfs_core::{
    ActionFlags, ErrorCode, FileId, FsStats, GenerationSet, InodeSnapshot, LeaseMask, LeaseType,
    MAX_LEASE_TYPES, MountFlags, MountStatus, OpenIntent, Result, ShareError, TruncateKind,
    WaitMode,
};

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Byte-range lock request carried by a `FileRecordLock` lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLock {
    pub start: u64,
    /// Zero means "to end of file".
    pub len: u64,
    pub kind: LockKind,
    /// Process or lock-owner identifier on the requesting client.
    pub owner: u64,
    /// Block until the lock can be taken.
    pub wait: bool,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared = 0,
    Exclusive = 1,
    Unlock = 2,
    /// Drop every lock and pending attempt of the client on this file.
    UnlockAll = 3,
}

impl LockKind {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Shared),
            1 => Some(Self::Exclusive),
            2 => Some(Self::Unlock),
            3 => Some(Self::UnlockAll),
            _ => None,
        }
    }
}

/// Arguments shared by every lease operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseArgs {
    pub ino: FileId,
    /// Type being requested or extended.
    pub ltype: LeaseType,
    /// Types affected by remove, reset and relinquish.
    pub mask: LeaseMask,
    /// Requested lease interval in seconds.
    pub interval_secs: u32,
    pub offset: u64,
    pub resid: u64,
    pub open: OpenIntent,
    pub truncate: TruncateKind,
    /// Generations the client believes it holds.
    pub gens: GenerationSet,
    pub lock: Option<RecordLock>,
}

impl LeaseArgs {
    #[must_use]
    pub fn new(ino: FileId, ltype: LeaseType) -> Self {
        Self {
            ino,
            ltype,
            mask: ltype.mask(),
            interval_secs: 30,
            offset: 0,
            resid: 0,
            open: OpenIntent::EMPTY,
            truncate: TruncateKind::Truncate,
            gens: GenerationSet::default(),
            lock: None,
        }
    }

    #[must_use]
    pub fn with_mask(mut self, mask: LeaseMask) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, secs: u32) -> Self {
        self.interval_secs = secs;
        self
    }

    #[must_use]
    pub fn with_range(mut self, offset: u64, resid: u64) -> Self {
        self.offset = offset;
        self.resid = resid;
        self
    }

    #[must_use]
    pub fn with_open(mut self, open: OpenIntent) -> Self {
        self.open = open;
        self
    }

    #[must_use]
    pub fn with_truncate(mut self, truncate: TruncateKind) -> Self {
        self.truncate = truncate;
        self
    }

    #[must_use]
    pub fn with_gens(mut self, gens: GenerationSet) -> Self {
        self.gens = gens;
        self
    }

    #[must_use]
    pub fn with_lock(mut self, lock: RecordLock) -> Self {
        self.lock = Some(lock);
        self
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.ino.0);
        w.put_u8(self.ltype.as_u8());
        w.put_u16(self.mask.bits());
        w.put_u32(self.interval_secs);
        w.put_u64(self.offset);
        w.put_u64(self.resid);
        w.put_u32(self.open.bits());
        w.put_u8(self.truncate.as_u8());
        encode_gens(w, &self.gens);
        match self.lock {
            Some(lock) => {
                w.put_bool(true);
                w.put_u64(lock.start);
                w.put_u64(lock.len);
                w.put_u8(lock.kind as u8);
                w.put_u64(lock.owner);
                w.put_bool(lock.wait);
            },
            None => w.put_bool(false),
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let ino = FileId(r.get_u64()?);
        let raw_type = r.get_u8()?;
        let ltype = LeaseType::from_u8(raw_type)
            .ok_or_else(|| ShareError::Protocol(format!("Unknown lease type {raw_type}")))?;
        let mask = LeaseMask::from_bits(r.get_u16()?);
        let interval_secs = r.get_u32()?;
        let offset = r.get_u64()?;
        let resid = r.get_u64()?;
        let open = OpenIntent::from_bits(r.get_u32()?);
        let raw_trunc = r.get_u8()?;
        let truncate = TruncateKind::from_u8(raw_trunc)
            .ok_or_else(|| ShareError::Protocol(format!("Unknown truncate kind {raw_trunc}")))?;
        let gens = decode_gens(r)?;
        let lock = if r.get_bool()? {
            let start = r.get_u64()?;
            let len = r.get_u64()?;
            let raw_kind = r.get_u8()?;
            let kind = LockKind::from_u8(raw_kind)
                .ok_or_else(|| ShareError::Protocol(format!("Unknown lock kind {raw_kind}")))?;
            Some(RecordLock {
                start,
                len,
                kind,
                owner: r.get_u64()?,
                wait: r.get_bool()?,
            })
        } else {
            None
        };
        Ok(Self {
            ino,
            ltype,
            mask,
            interval_secs,
            offset,
            resid,
            open,
            truncate,
            gens,
            lock,
        })
    }
}

fn encode_gens(w: &mut WireWriter, gens: &GenerationSet) {
    for generation in gens.as_array() {
        w.put_u32(generation);
    }
}

fn decode_gens(r: &mut WireReader<'_>) -> Result<GenerationSet> {
    let mut values = [0u32; MAX_LEASE_TYPES];
    for slot in &mut values {
        *slot = r.get_u32()?;
    }
    Ok(GenerationSet::from_array(values))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRequest {
    Get(LeaseArgs),
    Remove(LeaseArgs),
    /// Re-establish leases with a new server after failover.
    Reset(LeaseArgs),
    Relinquish(LeaseArgs),
    Extend(LeaseArgs),
}

impl LeaseRequest {
    #[must_use]
    pub fn op(&self) -> LeaseOp {
        match self {
            Self::Get(_) => LeaseOp::Get,
            Self::Remove(_) => LeaseOp::Remove,
            Self::Reset(_) => LeaseOp::Reset,
            Self::Relinquish(_) => LeaseOp::Relinquish,
            Self::Extend(_) => LeaseOp::Extend,
        }
    }

    #[must_use]
    pub fn args(&self) -> &LeaseArgs {
        match self {
            Self::Get(a) | Self::Remove(a) | Self::Reset(a) | Self::Relinquish(a) | Self::Extend(a) => a,
        }
    }
}

/// Server decision for a lease operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaseReply {
    /// Every lease the client now holds on the file.
    pub granted: LeaseMask,
    pub gens: GenerationSet,
    pub actions: ActionFlags,
    pub size: u64,
    /// Seconds until the server reclaims the granted leases.
    pub expire_secs: u32,
}

impl LeaseReply {
    /// The request conflicted and the client must wait for a notification.
    #[inline]
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.actions
            .intersects(ActionFlags::WAIT_LEASE.union(ActionFlags::WAIT_FRLOCK))
    }

    fn encode(&self, w: &mut WireWriter) {
        w.put_u16(self.granted.bits());
        encode_gens(w, &self.gens);
        w.put_u32(self.actions.bits());
        w.put_u64(self.size);
        w.put_u32(self.expire_secs);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            granted: LeaseMask::from_bits(r.get_u16()?),
            gens: decode_gens(r)?,
            actions: ActionFlags::from_bits(r.get_u32()?),
            size: r.get_u64()?,
            expire_secs: r.get_u32()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Mount
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountRequest {
    /// Introduce this client to the server.
    Init {
        host: String,
        fs_name: String,
        flags: MountFlags,
    },
    Status,
    FailInit,
    Resync,
    Failover,
    FailDone,
    Config,
}

impl MountRequest {
    #[must_use]
    pub fn op(&self) -> MountOp {
        match self {
            Self::Init { .. } => MountOp::Init,
            Self::Status => MountOp::Status,
            Self::FailInit => MountOp::FailInit,
            Self::Resync => MountOp::Resync,
            Self::Failover => MountOp::Failover,
            Self::FailDone => MountOp::FailDone,
            Self::Config => MountOp::Config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountReply {
    /// Ordinal the server assigned to the client.
    pub client_ord: u32,
    pub server_ord: u32,
    pub status: MountStatus,
    pub fsid: u32,
    pub fs_generation: u32,
    pub flags: MountFlags,
}

// ---------------------------------------------------------------------------
// Name
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameRequest {
    Create { parent: FileId, name: String, mode: u32 },
    Remove { parent: FileId, name: String },
    Mkdir { parent: FileId, name: String, mode: u32 },
    Rmdir { parent: FileId, name: String },
    Link { ino: FileId, parent: FileId, name: String },
    Rename {
        parent: FileId,
        name: String,
        new_parent: FileId,
        new_name: String,
    },
    Symlink {
        parent: FileId,
        name: String,
        target: String,
    },
    Acl { ino: FileId, acl: Bytes },
    Lookup { parent: FileId, name: String },
}

impl NameRequest {
    #[must_use]
    pub fn op(&self) -> NameOp {
        match self {
            Self::Create { .. } => NameOp::Create,
            Self::Remove { .. } => NameOp::Remove,
            Self::Mkdir { .. } => NameOp::Mkdir,
            Self::Rmdir { .. } => NameOp::Rmdir,
            Self::Link { .. } => NameOp::Link,
            Self::Rename { .. } => NameOp::Rename,
            Self::Symlink { .. } => NameOp::Symlink,
            Self::Acl { .. } => NameOp::Acl,
            Self::Lookup { .. } => NameOp::Lookup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NameReply {
    pub inode: InodeSnapshot,
    pub parent: InodeSnapshot,
}

// ---------------------------------------------------------------------------
// Inode & Block
// ---------------------------------------------------------------------------

/// Attribute changes carried by `Inode.setattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeRequest {
    GetIno { ino: FileId },
    FsyncWait { ino: FileId },
    FsyncNoWait { ino: FileId },
    SetAbr { ino: FileId },
    SetAttr { ino: FileId, attr: SetAttr },
    Stage { ino: FileId },
    CancelStage { ino: FileId },
}

impl InodeRequest {
    #[must_use]
    pub fn op(&self) -> InodeOp {
        match self {
            Self::GetIno { .. } => InodeOp::GetIno,
            Self::FsyncWait { .. } => InodeOp::FsyncWait,
            Self::FsyncNoWait { .. } => InodeOp::FsyncNoWait,
            Self::SetAbr { .. } => InodeOp::SetAbr,
            Self::SetAttr { .. } => InodeOp::SetAttr,
            Self::Stage { .. } => InodeOp::Stage,
            Self::CancelStage { .. } => InodeOp::CancelStage,
        }
    }

    #[must_use]
    pub fn ino(&self) -> FileId {
        match self {
            Self::GetIno { ino }
            | Self::FsyncWait { ino }
            | Self::FsyncNoWait { ino }
            | Self::SetAbr { ino }
            | Self::SetAttr { ino, .. }
            | Self::Stage { ino }
            | Self::CancelStage { ino } => *ino,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRequest {
    GetBuffer { ino: FileId, offset: u64, len: u32 },
    GetInode { ino: FileId },
    GetSuperblock,
    Statfs,
    Wakeup { ino: FileId },
    Panic,
    Quota { id: u32 },
}

impl BlockRequest {
    #[must_use]
    pub fn op(&self) -> BlockOp {
        match self {
            Self::GetBuffer { .. } => BlockOp::GetBuffer,
            Self::GetInode { .. } => BlockOp::GetInode,
            Self::GetSuperblock => BlockOp::GetSuperblock,
            Self::Statfs => BlockOp::Statfs,
            Self::Wakeup { .. } => BlockOp::Wakeup,
            Self::Panic => BlockOp::Panic,
            Self::Quota { .. } => BlockOp::Quota,
        }
    }

    /// The inode this request touches, if any.
    #[must_use]
    pub fn ino(&self) -> Option<FileId> {
        match self {
            Self::GetBuffer { ino, .. } | Self::GetInode { ino } | Self::Wakeup { ino } => {
                Some(*ino).filter(|i| i.0 != 0)
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReply {
    Buffer(Bytes),
    Inode(InodeSnapshot),
    Superblock { fsid: u32, fs_generation: u32 },
    Statfs(FsStats),
    Done,
}

// ---------------------------------------------------------------------------
// Callout & Notify
// ---------------------------------------------------------------------------

/// Server-initiated instruction to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callout {
    Action { ino: FileId, actions: ActionFlags },
    Stage { ino: FileId },
    /// Ask the holder to give up the listed leases.
    RelinquishLease { ino: FileId, mask: LeaseMask },
}

impl Callout {
    #[must_use]
    pub fn op(&self) -> CalloutOp {
        match self {
            Self::Action { .. } => CalloutOp::Action,
            Self::Stage { .. } => CalloutOp::Stage,
            Self::RelinquishLease { .. } => CalloutOp::RelinquishLease,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notify {
    /// A lease the client waited for may now be granted.
    Lease { ino: FileId, mask: LeaseMask },
    LeaseExpire { ino: FileId, mask: LeaseMask },
    /// Directory name cache entry is stale.
    Dnlc { parent: FileId, name: String },
    GetIno { ino: FileId },
    Panic { ord: u32 },
}

impl Notify {
    #[must_use]
    pub fn op(&self) -> NotifyOp {
        match self {
            Self::Lease { .. } => NotifyOp::Lease,
            Self::LeaseExpire { .. } => NotifyOp::LeaseExpire,
            Self::Dnlc { .. } => NotifyOp::Dnlc,
            Self::GetIno { .. } => NotifyOp::GetIno,
            Self::Panic { .. } => NotifyOp::Panic,
        }
    }
}

// ---------------------------------------------------------------------------
// Sum types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Mount(MountRequest),
    Lease(LeaseRequest),
    Name(NameRequest),
    Inode(InodeRequest),
    Block(BlockRequest),
    Callout(Callout),
    Notify(Notify),
}

impl Request {
    #[must_use]
    pub fn command(&self) -> Command {
        match self {
            Self::Mount(_) => Command::Mount,
            Self::Lease(_) => Command::Lease,
            Self::Name(_) => Command::Name,
            Self::Inode(_) => Command::Inode,
            Self::Block(_) => Command::Block,
            Self::Callout(_) => Command::Callout,
            Self::Notify(_) => Command::Notify,
        }
    }

    #[must_use]
    pub fn operation(&self) -> u16 {
        match self {
            Self::Mount(m) => m.op().as_u16(),
            Self::Lease(l) => l.op().as_u16(),
            Self::Name(n) => n.op().as_u16(),
            Self::Inode(i) => i.op().as_u16(),
            Self::Block(b) => b.op().as_u16(),
            Self::Callout(c) => c.op().as_u16(),
            Self::Notify(n) => n.op().as_u16(),
        }
    }

    /// Messages that must keep flowing while a failover is in progress,
    /// because completing the failover depends on them.
    #[must_use]
    pub fn is_freeze_exempt(&self) -> bool {
        matches!(
            self,
            Self::Mount(_) | Self::Block(_) | Self::Lease(LeaseRequest::Reset(_))
        )
    }

    /// Operations that give up immediately during failover so the caller
    /// can release the resources it is holding.
    #[must_use]
    pub fn fails_fast_in_failover(&self) -> bool {
        matches!(
            self,
            Self::Mount(MountRequest::Status)
                | Self::Block(
                    BlockRequest::GetBuffer { .. }
                        | BlockRequest::GetInode { .. }
                        | BlockRequest::GetSuperblock
                        | BlockRequest::Statfs
                )
        )
    }

    /// Accepted by a resyncing server.
    #[must_use]
    pub fn allowed_while_resyncing(&self) -> bool {
        match self {
            Self::Mount(_) | Self::Lease(LeaseRequest::Reset(_)) => true,
            Self::Block(b) => b.ino().is_none(),
            _ => false,
        }
    }

    /// Completed results are kept until acknowledged so a retransmission
    /// replays them instead of executing again.
    #[must_use]
    pub fn is_replay_cached(&self, wait_mode: WaitMode) -> bool {
        match self {
            Self::Lease(LeaseRequest::Get(_) | LeaseRequest::Relinquish(_)) => {
                wait_mode == WaitMode::Wait
            },
            Self::Name(n) => !n.op().is_idempotent(),
            _ => false,
        }
    }

    /// Expected reply payload size, advertised in `out_len`.
    #[must_use]
    pub fn reply_len(&self) -> u32 {
        match self {
            Self::Mount(_) => MOUNT_REPLY_LEN,
            Self::Lease(_) => LEASE_REPLY_LEN,
            Self::Name(_) => 2 * INODE_LEN,
            Self::Inode(_) => INODE_LEN,
            Self::Block(BlockRequest::GetBuffer { len, .. }) => len.saturating_add(5),
            Self::Block(_) => INODE_LEN + 1,
            Self::Callout(_) | Self::Notify(_) => 0,
        }
    }

    pub(crate) fn encode(&self, w: &mut WireWriter) {
        match self {
            Self::Mount(m) => {
                if let MountRequest::Init {
                    host,
                    fs_name,
                    flags,
                } = m
                {
                    w.put_str(host);
                    w.put_str(fs_name);
                    w.put_u32(flags.bits());
                }
            },
            Self::Lease(l) => l.args().encode(w),
            Self::Name(n) => encode_name(n, w),
            Self::Inode(i) => {
                w.put_u64(i.ino().0);
                if let InodeRequest::SetAttr { attr, .. } = i {
                    put_opt_u32(w, attr.mode);
                    put_opt_u64(w, attr.size);
                    match attr.mtime {
                        Some(t) => {
                            w.put_bool(true);
                            w.put_i64(t);
                        },
                        None => w.put_bool(false),
                    }
                }
            },
            Self::Block(b) => match b {
                BlockRequest::GetBuffer { ino, offset, len } => {
                    w.put_u64(ino.0);
                    w.put_u64(*offset);
                    w.put_u32(*len);
                },
                BlockRequest::GetInode { ino } | BlockRequest::Wakeup { ino } => w.put_u64(ino.0),
                BlockRequest::Quota { id } => w.put_u32(*id),
                BlockRequest::GetSuperblock | BlockRequest::Statfs | BlockRequest::Panic => {},
            },
            Self::Callout(c) => match c {
                Callout::Action { ino, actions } => {
                    w.put_u64(ino.0);
                    w.put_u32(actions.bits());
                },
                Callout::Stage { ino } => w.put_u64(ino.0),
                Callout::RelinquishLease { ino, mask } => {
                    w.put_u64(ino.0);
                    w.put_u16(mask.bits());
                },
            },
            Self::Notify(n) => match n {
                Notify::Lease { ino, mask } | Notify::LeaseExpire { ino, mask } => {
                    w.put_u64(ino.0);
                    w.put_u16(mask.bits());
                },
                Notify::Dnlc { parent, name } => {
                    w.put_u64(parent.0);
                    w.put_str(name);
                },
                Notify::GetIno { ino } => w.put_u64(ino.0),
                Notify::Panic { ord } => w.put_u32(*ord),
            },
        }
    }

    pub(crate) fn decode(header: &MessageHeader, r: &mut WireReader<'_>) -> Result<Self> {
        let op = header.operation;
        let bad_op = || {
            ShareError::Protocol(format!(
                "Unknown operation {op} for command {:?}",
                header.command
            ))
        };
        Ok(match header.command {
            Command::Mount => Self::Mount(match MountOp::from_u16(op).ok_or_else(bad_op)? {
                MountOp::Init => MountRequest::Init {
                    host: r.get_str()?,
                    fs_name: r.get_str()?,
                    flags: MountFlags::from_bits(r.get_u32()?),
                },
                MountOp::Status => MountRequest::Status,
                MountOp::FailInit => MountRequest::FailInit,
                MountOp::Resync => MountRequest::Resync,
                MountOp::Failover => MountRequest::Failover,
                MountOp::FailDone => MountRequest::FailDone,
                MountOp::Config => MountRequest::Config,
            }),
            Command::Lease => {
                let args = LeaseArgs::decode(r)?;
                Self::Lease(match LeaseOp::from_u16(op).ok_or_else(bad_op)? {
                    LeaseOp::Get => LeaseRequest::Get(args),
                    LeaseOp::Remove => LeaseRequest::Remove(args),
                    LeaseOp::Reset => LeaseRequest::Reset(args),
                    LeaseOp::Relinquish => LeaseRequest::Relinquish(args),
                    LeaseOp::Extend => LeaseRequest::Extend(args),
                })
            },
            Command::Name => Self::Name(decode_name(NameOp::from_u16(op).ok_or_else(bad_op)?, r)?),
            Command::Inode => {
                let iop = InodeOp::from_u16(op).ok_or_else(bad_op)?;
                let ino = FileId(r.get_u64()?);
                Self::Inode(match iop {
                    InodeOp::GetIno => InodeRequest::GetIno { ino },
                    InodeOp::FsyncWait => InodeRequest::FsyncWait { ino },
                    InodeOp::FsyncNoWait => InodeRequest::FsyncNoWait { ino },
                    InodeOp::SetAbr => InodeRequest::SetAbr { ino },
                    InodeOp::SetAttr => {
                        let mode = get_opt_u32(r)?;
                        let size = get_opt_u64(r)?;
                        let mtime = if r.get_bool()? { Some(r.get_i64()?) } else { None };
                        InodeRequest::SetAttr {
                            ino,
                            attr: SetAttr { mode, size, mtime },
                        }
                    },
                    InodeOp::Stage => InodeRequest::Stage { ino },
                    InodeOp::CancelStage => InodeRequest::CancelStage { ino },
                })
            },
            Command::Block => Self::Block(match BlockOp::from_u16(op).ok_or_else(bad_op)? {
                BlockOp::GetBuffer => BlockRequest::GetBuffer {
                    ino: FileId(r.get_u64()?),
                    offset: r.get_u64()?,
                    len: r.get_u32()?,
                },
                BlockOp::GetInode => BlockRequest::GetInode {
                    ino: FileId(r.get_u64()?),
                },
                BlockOp::GetSuperblock => BlockRequest::GetSuperblock,
                BlockOp::Statfs => BlockRequest::Statfs,
                BlockOp::Wakeup => BlockRequest::Wakeup {
                    ino: FileId(r.get_u64()?),
                },
                BlockOp::Panic => BlockRequest::Panic,
                BlockOp::Quota => BlockRequest::Quota { id: r.get_u32()? },
            }),
            Command::Callout => Self::Callout(match CalloutOp::from_u16(op).ok_or_else(bad_op)? {
                CalloutOp::Action => Callout::Action {
                    ino: FileId(r.get_u64()?),
                    actions: ActionFlags::from_bits(r.get_u32()?),
                },
                CalloutOp::Stage => Callout::Stage {
                    ino: FileId(r.get_u64()?),
                },
                CalloutOp::RelinquishLease => Callout::RelinquishLease {
                    ino: FileId(r.get_u64()?),
                    mask: LeaseMask::from_bits(r.get_u16()?),
                },
            }),
            Command::Notify => Self::Notify(match NotifyOp::from_u16(op).ok_or_else(bad_op)? {
                NotifyOp::Lease => Notify::Lease {
                    ino: FileId(r.get_u64()?),
                    mask: LeaseMask::from_bits(r.get_u16()?),
                },
                NotifyOp::LeaseExpire => Notify::LeaseExpire {
                    ino: FileId(r.get_u64()?),
                    mask: LeaseMask::from_bits(r.get_u16()?),
                },
                NotifyOp::Dnlc => Notify::Dnlc {
                    parent: FileId(r.get_u64()?),
                    name: r.get_str()?,
                },
                NotifyOp::GetIno => Notify::GetIno {
                    ino: FileId(r.get_u64()?),
                },
                NotifyOp::Panic => Notify::Panic { ord: r.get_u32()? },
            }),
        })
    }
}

const INODE_LEN: u32 = 8 + 4 + 4 + 4 + 8 + 8 + 8;
const LEASE_REPLY_LEN: u32 = 2 + 4 * MAX_LEASE_TYPES as u32 + 4 + 8 + 4;
const MOUNT_REPLY_LEN: u32 = 6 * 4;

fn put_opt_u32(w: &mut WireWriter, v: Option<u32>) {
    match v {
        Some(v) => {
            w.put_bool(true);
            w.put_u32(v);
        },
        None => w.put_bool(false),
    }
}

fn put_opt_u64(w: &mut WireWriter, v: Option<u64>) {
    match v {
        Some(v) => {
            w.put_bool(true);
            w.put_u64(v);
        },
        None => w.put_bool(false),
    }
}

fn get_opt_u32(r: &mut WireReader<'_>) -> Result<Option<u32>> {
    Ok(if r.get_bool()? { Some(r.get_u32()?) } else { None })
}

fn get_opt_u64(r: &mut WireReader<'_>) -> Result<Option<u64>> {
    Ok(if r.get_bool()? { Some(r.get_u64()?) } else { None })
}

fn encode_name(n: &NameRequest, w: &mut WireWriter) {
    match n {
        NameRequest::Create { parent, name, mode } | NameRequest::Mkdir { parent, name, mode } => {
            w.put_u64(parent.0);
            w.put_str(name);
            w.put_u32(*mode);
        },
        NameRequest::Remove { parent, name }
        | NameRequest::Rmdir { parent, name }
        | NameRequest::Lookup { parent, name } => {
            w.put_u64(parent.0);
            w.put_str(name);
        },
        NameRequest::Link { ino, parent, name } => {
            w.put_u64(ino.0);
            w.put_u64(parent.0);
            w.put_str(name);
        },
        NameRequest::Rename {
            parent,
            name,
            new_parent,
            new_name,
        } => {
            w.put_u64(parent.0);
            w.put_str(name);
            w.put_u64(new_parent.0);
            w.put_str(new_name);
        },
        NameRequest::Symlink {
            parent,
            name,
            target,
        } => {
            w.put_u64(parent.0);
            w.put_str(name);
            w.put_str(target);
        },
        NameRequest::Acl { ino, acl } => {
            w.put_u64(ino.0);
            w.put_bytes(acl);
        },
    }
}

fn decode_name(op: NameOp, r: &mut WireReader<'_>) -> Result<NameRequest> {
    Ok(match op {
        NameOp::Create => NameRequest::Create {
            parent: FileId(r.get_u64()?),
            name: r.get_str()?,
            mode: r.get_u32()?,
        },
        NameOp::Mkdir => NameRequest::Mkdir {
            parent: FileId(r.get_u64()?),
            name: r.get_str()?,
            mode: r.get_u32()?,
        },
        NameOp::Remove => NameRequest::Remove {
            parent: FileId(r.get_u64()?),
            name: r.get_str()?,
        },
        NameOp::Rmdir => NameRequest::Rmdir {
            parent: FileId(r.get_u64()?),
            name: r.get_str()?,
        },
        NameOp::Lookup => NameRequest::Lookup {
            parent: FileId(r.get_u64()?),
            name: r.get_str()?,
        },
        NameOp::Link => NameRequest::Link {
            ino: FileId(r.get_u64()?),
            parent: FileId(r.get_u64()?),
            name: r.get_str()?,
        },
        NameOp::Rename => NameRequest::Rename {
            parent: FileId(r.get_u64()?),
            name: r.get_str()?,
            new_parent: FileId(r.get_u64()?),
            new_name: r.get_str()?,
        },
        NameOp::Symlink => NameRequest::Symlink {
            parent: FileId(r.get_u64()?),
            name: r.get_str()?,
            target: r.get_str()?,
        },
        NameOp::Acl => NameRequest::Acl {
            ino: FileId(r.get_u64()?),
            acl: r.get_bytes()?,
        },
    })
}

fn encode_inode(w: &mut WireWriter, inode: &InodeSnapshot) {
    w.put_u64(inode.ino.0);
    w.put_u32(inode.generation);
    w.put_u32(inode.mode);
    w.put_u32(inode.nlink);
    w.put_u64(inode.size);
    w.put_u64(inode.allocated);
    w.put_i64(inode.mtime);
}

fn decode_inode(r: &mut WireReader<'_>) -> Result<InodeSnapshot> {
    Ok(InodeSnapshot {
        ino: FileId(r.get_u64()?),
        generation: r.get_u32()?,
        mode: r.get_u32()?,
        nlink: r.get_u32()?,
        size: r.get_u64()?,
        allocated: r.get_u64()?,
        mtime: r.get_i64()?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Mount(MountReply),
    Lease(LeaseReply),
    Name(NameReply),
    Inode(InodeSnapshot),
    Block(BlockReply),
    /// Error replies and acknowledgments carry no body.
    Empty,
}

impl Reply {
    pub(crate) fn encode(&self, w: &mut WireWriter) {
        match self {
            Self::Mount(m) => {
                w.put_u32(m.client_ord);
                w.put_u32(m.server_ord);
                w.put_u32(m.status.bits());
                w.put_u32(m.fsid);
                w.put_u32(m.fs_generation);
                w.put_u32(m.flags.bits());
            },
            Self::Lease(l) => l.encode(w),
            Self::Name(n) => {
                encode_inode(w, &n.inode);
                encode_inode(w, &n.parent);
            },
            Self::Inode(i) => encode_inode(w, i),
            Self::Block(b) => match b {
                BlockReply::Buffer(data) => {
                    w.put_u8(0);
                    w.put_bytes(data);
                },
                BlockReply::Inode(inode) => {
                    w.put_u8(1);
                    encode_inode(w, inode);
                },
                BlockReply::Superblock {
                    fsid,
                    fs_generation,
                } => {
                    w.put_u8(2);
                    w.put_u32(*fsid);
                    w.put_u32(*fs_generation);
                },
                BlockReply::Statfs(stats) => {
                    w.put_u8(3);
                    w.put_u32(stats.block_size);
                    w.put_u64(stats.total_blocks);
                    w.put_u64(stats.free_blocks);
                    w.put_u64(stats.files);
                },
                BlockReply::Done => w.put_u8(4),
            },
            Self::Empty => {},
        }
    }

    pub(crate) fn decode(header: &MessageHeader, r: &mut WireReader<'_>) -> Result<Self> {
        if header.payload_len == 0 {
            return Ok(Self::Empty);
        }
        Ok(match header.command {
            Command::Mount => Self::Mount(MountReply {
                client_ord: r.get_u32()?,
                server_ord: r.get_u32()?,
                status: MountStatus::from_bits(r.get_u32()?),
                fsid: r.get_u32()?,
                fs_generation: r.get_u32()?,
                flags: MountFlags::from_bits(r.get_u32()?),
            }),
            Command::Lease => Self::Lease(LeaseReply::decode(r)?),
            Command::Name => Self::Name(NameReply {
                inode: decode_inode(r)?,
                parent: decode_inode(r)?,
            }),
            Command::Inode => Self::Inode(decode_inode(r)?),
            Command::Block => Self::Block(match r.get_u8()? {
                0 => BlockReply::Buffer(r.get_bytes()?),
                1 => BlockReply::Inode(decode_inode(r)?),
                2 => BlockReply::Superblock {
                    fsid: r.get_u32()?,
                    fs_generation: r.get_u32()?,
                },
                3 => BlockReply::Statfs(FsStats {
                    block_size: r.get_u32()?,
                    total_blocks: r.get_u64()?,
                    free_blocks: r.get_u64()?,
                    files: r.get_u64()?,
                }),
                4 => BlockReply::Done,
                tag => {
                    return Err(ShareError::Protocol(format!("Unknown block reply tag {tag}")));
                },
            }),
            Command::Callout | Command::Notify => {
                return Err(ShareError::Protocol(format!(
                    "{:?} messages have no reply",
                    header.command
                )));
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Request(Request),
    Reply(Reply),
}

/// A header plus its decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Payload,
}

impl Message {
    /// New outgoing request; seqno, ack and ordinals are filled by the
    /// transport.
    #[must_use]
    pub fn request(request: Request, wait_mode: WaitMode) -> Self {
        let mut header = MessageHeader::new(request.command(), request.operation(), wait_mode);
        header.out_len = if wait_mode.expects_reply() {
            request.reply_len()
        } else {
            0
        };
        Self {
            header,
            payload: Payload::Request(request),
        }
    }

    /// Reply to the request described by `header`.
    #[must_use]
    pub fn reply(header: &MessageHeader, error: ErrorCode, reply: Reply) -> Self {
        Self {
            header: header.reply(error),
            payload: Payload::Reply(reply),
        }
    }

    #[must_use]
    pub fn as_request(&self) -> Option<&Request> {
        match &self.payload {
            Payload::Request(r) => Some(r),
            Payload::Reply(_) => None,
        }
    }

    #[must_use]
    pub fn as_reply(&self) -> Option<&Reply> {
        match &self.payload {
            Payload::Reply(r) => Some(r),
            Payload::Request(_) => None,
        }
    }

    pub(crate) fn encode_payload(&self, w: &mut WireWriter) {
        match &self.payload {
            Payload::Request(r) => r.encode(w),
            Payload::Reply(r) => r.encode(w),
        }
    }

    pub(crate) fn decode_payload(header: &MessageHeader, r: &mut WireReader<'_>) -> Result<Payload> {
        if header.is_reply {
            Ok(Payload::Reply(Reply::decode(header, r)?))
        } else {
            Ok(Payload::Request(Request::decode(header, r)?))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sfs_core::Generation;

    #[test]
    fn test_freeze_exemptions() {
        let ino = FileId(9);
        let reset = Request::Lease(LeaseRequest::Reset(LeaseArgs::new(ino, LeaseType::Read)));
        let get = Request::Lease(LeaseRequest::Get(LeaseArgs::new(ino, LeaseType::Read)));
        assert!(reset.is_freeze_exempt());
        assert!(!get.is_freeze_exempt());
        assert!(Request::Mount(MountRequest::Status).is_freeze_exempt());
        assert!(Request::Block(BlockRequest::Statfs).is_freeze_exempt());
    }

    #[test]
    fn test_fail_fast_set() {
        assert!(Request::Mount(MountRequest::Status).fails_fast_in_failover());
        assert!(
            Request::Block(BlockRequest::GetInode { ino: FileId(4) }).fails_fast_in_failover()
        );
        assert!(!Request::Mount(MountRequest::FailDone).fails_fast_in_failover());
        assert!(!Request::Block(BlockRequest::Wakeup { ino: FileId(4) }).fails_fast_in_failover());
    }

    #[test]
    fn test_resync_filter() {
        assert!(Request::Block(BlockRequest::Statfs).allowed_while_resyncing());
        assert!(!Request::Block(BlockRequest::GetInode { ino: FileId(2) }).allowed_while_resyncing());
        assert!(
            Request::Block(BlockRequest::GetInode { ino: FileId(0) }).allowed_while_resyncing()
        );
        let get = Request::Lease(LeaseRequest::Get(LeaseArgs::new(FileId(2), LeaseType::Write)));
        assert!(!get.allowed_while_resyncing());
    }

    #[test]
    fn test_replay_cache_selection() {
        let get = Request::Lease(LeaseRequest::Get(LeaseArgs::new(FileId(2), LeaseType::Write)));
        assert!(get.is_replay_cached(WaitMode::Wait));
        assert!(!get.is_replay_cached(WaitMode::WaitOnce));
        let create = Request::Name(NameRequest::Create {
            parent: FileId(1),
            name: "a".into(),
            mode: 0o644,
        });
        assert!(create.is_replay_cached(WaitMode::WaitOnce));
        let lookup = Request::Name(NameRequest::Lookup {
            parent: FileId(1),
            name: "a".into(),
        });
        assert!(!lookup.is_replay_cached(WaitMode::Wait));
    }

    #[test]
    fn test_lease_reply_waiting() {
        let mut reply = LeaseReply::default();
        assert!(!reply.is_waiting());
        reply.actions = ActionFlags::WAIT_LEASE;
        assert!(reply.is_waiting());
    }

    #[test]
    fn test_request_header_fields() {
        let mut gens = GenerationSet::default();
        gens.set(LeaseType::Write, Generation::new(3));
        let args = LeaseArgs::new(FileId(77), LeaseType::Write).with_gens(gens);
        let msg = Message::request(Request::Lease(LeaseRequest::Relinquish(args)), WaitMode::Wait);
        assert_eq!(msg.header.command, Command::Lease);
        assert_eq!(msg.header.operation, LeaseOp::Relinquish.as_u16());
        assert_eq!(msg.header.out_len, LEASE_REPLY_LEN);

        let nowait = Message::request(Request::Mount(MountRequest::Status), WaitMode::NoWait);
        assert_eq!(nowait.header.out_len, 0);
    }
}
