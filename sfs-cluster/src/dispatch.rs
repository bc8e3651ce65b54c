//! Metadata server request dispatch.
//!
//! Every inbound request passes the receive discipline in order:
//!
//! 1. Dropped when this node is not the server or is frozen.
//! 2. Non-mount requests to an unmounted filesystem fail with `EXDEV`;
//!    a foreign `fsid` is answered stale, except mount and inode-less
//!    block requests.
//! 3. While resyncing only mount, inode-less block and lease reset pass;
//!    everything else is told to try again.
//! 4. [`ClientTable::admit`] applies membership, acknowledgment and
//!    duplicate rules.
//! 5. The request runs, its entry completes (caching the reply when a
//!    replay must not re-execute) and blocking senders get the reply.

use crate::client_table::{Admission, ClientTable};
use crate::mount::MountState;
use crate::namespace::Namespace;
use crate::session::ClientRegistry;
use bytes::Bytes;
use sfs_core::{
    ClientOrd, ErrorCode, FileId, FsStats, LeaseType, MountFlags, MountStatus, Result, ShareError,
    WaitMode,
};
use sfs_lease::{InodeStore, LeaseConfig, LeaseEvents, LeaseManager};
use sfs_network::{
    BlockReply, BlockRequest, InodeRequest, LeaseArgs, LeaseRequest, MAX_BUFFER_LEN, Message,
    MessageHeader, MountReply, MountRequest, NameRequest, Notify, Payload, Reply, Request,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

const BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub fs_name: String,
    pub fsid: u32,
    pub server_ord: u32,
    pub lease: LeaseConfig,
    /// Reported by `Block.statfs`.
    pub capacity_blocks: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            fs_name: "sfs0".to_string(),
            fsid: 1,
            server_ord: 1,
            lease: LeaseConfig::default(),
            capacity_blocks: 1 << 20,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn with_fs_name(mut self, name: impl Into<String>) -> Self {
        self.fs_name = name.into();
        self
    }

    #[must_use]
    pub fn with_fsid(mut self, fsid: u32) -> Self {
        self.fsid = fsid;
        self
    }

    #[must_use]
    pub fn with_server_ord(mut self, ord: u32) -> Self {
        self.server_ord = ord;
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }
}

pub struct ServerDispatcher {
    config: ServerConfig,
    mount: Arc<MountState>,
    clients: ClientTable,
    registry: Arc<ClientRegistry>,
    leases: Arc<LeaseManager>,
    namespace: Arc<dyn Namespace>,
}

impl ServerDispatcher {
    /// Build a dispatcher for a mounted filesystem. The node does not serve
    /// until [`ServerDispatcher::take_over`] is called.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn InodeStore>,
        namespace: Arc<dyn Namespace>,
    ) -> Arc<Self> {
        let mount = Arc::new(MountState::new(config.fs_name.clone()));
        mount.set_fsid(config.fsid);
        mount.set_mounted();
        let registry = Arc::new(ClientRegistry::new(Arc::clone(&mount)));
        let events: Arc<dyn LeaseEvents> = Arc::clone(&registry) as Arc<dyn LeaseEvents>;
        let leases = LeaseManager::new(config.lease, store, events);
        Arc::new(Self {
            config,
            mount,
            clients: ClientTable::new(),
            registry,
            leases,
            namespace,
        })
    }

    #[inline]
    #[must_use]
    pub fn mount(&self) -> &Arc<MountState> {
        &self.mount
    }

    #[inline]
    #[must_use]
    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    #[inline]
    #[must_use]
    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    #[must_use]
    pub fn namespace(&self) -> &Arc<dyn Namespace> {
        &self.namespace
    }

    // -------------------------------------------------------------------------
    // Role changes
    // -------------------------------------------------------------------------

    /// Assume the server role. Known clients must resync before normal
    /// traffic resumes; with none the filesystem is ready at once.
    pub fn take_over(&self) {
        self.mount.thaw();
        self.mount.set_server_ord(self.config.server_ord);
        let generation = self.mount.bump_fs_generation();
        self.mount.set_server(true);
        self.clients.begin_resync();
        self.mount.begin_resync();
        info!(
            target: "sfs::server",
            fs = %self.config.fs_name,
            server = self.config.server_ord,
            fs_generation = generation,
            "Server role taken"
        );
        self.finish_resync_if_done();
    }

    /// Stop serving; requests are dropped until the next take over.
    pub fn step_down(&self) {
        self.mount.freeze();
        self.mount.set_server(false);
        info!(target: "sfs::server", fs = %self.config.fs_name, "Server role released");
    }

    /// Leave resync once every live client has re-established its leases.
    pub fn finish_resync_if_done(&self) -> bool {
        if self.mount.is_resyncing() && self.clients.all_resynced() {
            self.mount.finish_resync();
            return true;
        }
        false
    }

    /// End resync regardless of stragglers. Their leases were never
    /// re-established and are therefore not protected.
    pub fn force_resync_complete(&self) {
        if self.mount.is_resyncing() {
            warn!(target: "sfs::server", fs = %self.config.fs_name, "Resync forced complete");
            self.mount.finish_resync();
        }
    }

    /// Evict a client: its messages are dropped and its leases released.
    pub async fn evict_client(&self, ord: ClientOrd) {
        self.clients.mark_off(ord);
        self.registry.unregister(ord);
        self.leases.client_disconnected(ord).await;
        warn!(target: "sfs::server", client = ord, "Client evicted");
    }

    /// The client's connection went away. Blocked record lock attempts are
    /// interrupted; leases stay until they expire.
    pub fn connection_lost(&self, ord: ClientOrd) {
        self.leases.record_locks().cancel_client(ord);
        self.clients.set_responding(ord, false);
        debug!(target: "sfs::server", client = ord, "Client connection lost");
    }

    // -------------------------------------------------------------------------
    // Receive discipline
    // -------------------------------------------------------------------------

    /// Process one inbound message and return the reply to send, if any.
    pub async fn dispatch(&self, message: Message) -> Option<Message> {
        let Message { header, payload } = message;
        let Payload::Request(request) = payload else {
            debug!(target: "sfs::server", client = header.client_ord, "Unexpected reply dropped");
            return None;
        };

        let status = self.mount.status();
        if !status.contains(MountStatus::SERVER) || status.contains(MountStatus::FROZEN) {
            debug!(target: "sfs::server", client = header.client_ord, seqno = %header.seqno, "Not serving; dropped");
            return None;
        }

        match &request {
            Request::Notify(notify) => {
                self.registry.broadcast_notify(notify, Some(header.client_ord));
                return None;
            },
            Request::Callout(_) => {
                debug!(target: "sfs::server", client = header.client_ord, "Callout from client dropped");
                return None;
            },
            _ => {},
        }

        let is_mount = matches!(request, Request::Mount(_));
        if !is_mount && !status.contains(MountStatus::MOUNTED) {
            return self.respond(&header, ErrorCode::NOT_MOUNTED, Reply::Empty);
        }
        let fsid_exempt = is_mount || matches!(&request, Request::Block(b) if b.ino().is_none());
        if !fsid_exempt && header.fsid != 0 && header.fsid != self.config.fsid {
            return self.respond(&header, ErrorCode::STALE, Reply::Empty);
        }
        if status.contains(MountStatus::RESYNCING) && !request.allowed_while_resyncing() {
            return self.respond(&header, ErrorCode::TRY_AGAIN, Reply::Empty);
        }

        if let Request::Mount(MountRequest::Init { host, fs_name, flags }) = &request {
            return match self.mount_init(host, fs_name, *flags) {
                Ok(reply) => {
                    let mut header = header;
                    header.client_ord = reply.client_ord;
                    self.respond(&header, ErrorCode::OK, Reply::Mount(reply))
                },
                Err(e) => self.respond(&header, e.code(), Reply::Empty),
            };
        }

        match self.clients.admit(&header, self.mount.fs_generation()) {
            Admission::Process => {},
            Admission::Replay(reply) => {
                debug!(target: "sfs::server", client = header.client_ord, seqno = %header.seqno, "Replaying cached reply");
                return header.wait_mode.expects_reply().then_some(reply);
            },
            Admission::Drop(reason) => {
                debug!(target: "sfs::server", client = header.client_ord, seqno = %header.seqno, reason, "Message dropped");
                return None;
            },
            Admission::Reject(code) => {
                debug!(target: "sfs::server", client = header.client_ord, seqno = %header.seqno, error = %code, "Message rejected");
                return self.respond(&header, code, Reply::Empty);
            },
        }

        let (error, reply) = match self.handle(&header, &request).await {
            Ok(reply) => (ErrorCode::OK, reply),
            Err(e) => {
                debug!(target: "sfs::server", client = header.client_ord, seqno = %header.seqno, error = %e, "Request failed");
                (e.code(), Reply::Empty)
            },
        };
        let message = self.reply_message(&header, error, reply);
        let cached = request
            .is_replay_cached(header.wait_mode)
            .then(|| message.clone());
        self.clients.complete(header.client_ord, header.seqno, cached);
        header.wait_mode.expects_reply().then_some(message)
    }

    fn reply_message(&self, header: &MessageHeader, error: ErrorCode, reply: Reply) -> Message {
        let mut message = Message::reply(header, error, reply);
        message.header.server_ord = self.mount.server_ord();
        message.header.fsid = self.config.fsid;
        message.header.fs_generation = self.mount.fs_generation();
        message
    }

    fn respond(&self, header: &MessageHeader, error: ErrorCode, reply: Reply) -> Option<Message> {
        header
            .wait_mode
            .expects_reply()
            .then(|| self.reply_message(header, error, reply))
    }

    async fn handle(&self, header: &MessageHeader, request: &Request) -> Result<Reply> {
        let client = header.client_ord;
        match request {
            Request::Mount(m) => Ok(Reply::Mount(self.handle_mount(client, m))),
            Request::Lease(l) => self.handle_lease(client, l, header.wait_mode).await,
            Request::Name(n) => self.handle_name(client, n),
            Request::Inode(i) => self.handle_inode(client, i).await,
            Request::Block(b) => self.handle_block(client, b),
            Request::Callout(_) | Request::Notify(_) => Ok(Reply::Empty),
        }
    }

    // -------------------------------------------------------------------------
    // Mount
    // -------------------------------------------------------------------------

    fn mount_reply(&self, client_ord: ClientOrd) -> MountReply {
        let mut flags = MountFlags::EMPTY;
        if self.config.lease.multihost_write {
            flags.insert(MountFlags::MULTIHOST_WRITE);
        }
        MountReply {
            client_ord,
            server_ord: self.mount.server_ord(),
            status: self.mount.status(),
            fsid: self.config.fsid,
            fs_generation: self.mount.fs_generation(),
            flags,
        }
    }

    fn mount_init(&self, host: &str, fs_name: &str, flags: MountFlags) -> Result<MountReply> {
        if fs_name != self.config.fs_name {
            return Err(ShareError::Remote(ErrorCode::NOT_FOUND));
        }
        let ord = self.clients.register(host);
        info!(
            target: "sfs::server",
            client = ord,
            host,
            byte_swap = flags.contains(MountFlags::BYTE_SWAP),
            "Mount init"
        );
        Ok(self.mount_reply(ord))
    }

    fn handle_mount(&self, client: ClientOrd, request: &MountRequest) -> MountReply {
        match request {
            MountRequest::Failover | MountRequest::FailInit => {
                self.clients.set_resynced(client, false);
            },
            MountRequest::Resync | MountRequest::FailDone => {
                self.clients.set_resynced(client, true);
                info!(target: "sfs::failover", client, "Client resynced");
                self.finish_resync_if_done();
            },
            MountRequest::Init { .. } | MountRequest::Status | MountRequest::Config => {},
        }
        self.mount_reply(client)
    }

    // -------------------------------------------------------------------------
    // Lease
    // -------------------------------------------------------------------------

    async fn handle_lease(
        &self,
        client: ClientOrd,
        request: &LeaseRequest,
        wait: WaitMode,
    ) -> Result<Reply> {
        let reply = match request {
            LeaseRequest::Get(args) => self.leases.request_lease(client, args, wait).await?.into_reply(),
            LeaseRequest::Remove(args) => self.leases.remove(client, args).await?,
            LeaseRequest::Reset(args) => self.leases.reset(client, args).await?,
            LeaseRequest::Relinquish(args) => self.leases.relinquish(client, args).await?,
            LeaseRequest::Extend(args) => self.leases.extend(client, args).await?,
        };
        Ok(Reply::Lease(reply))
    }

    // -------------------------------------------------------------------------
    // Name
    // -------------------------------------------------------------------------

    fn handle_name(&self, client: ClientOrd, request: &NameRequest) -> Result<Reply> {
        let reply = self.namespace.apply(request)?;
        let stale = match request {
            NameRequest::Remove { parent, name } | NameRequest::Rmdir { parent, name } => {
                Some((*parent, name))
            },
            NameRequest::Rename { parent, name, .. } => Some((*parent, name)),
            _ => None,
        };
        if let Some((parent, name)) = stale {
            self.registry.broadcast_notify(
                &Notify::Dnlc {
                    parent,
                    name: name.clone(),
                },
                Some(client),
            );
        }
        Ok(Reply::Name(reply))
    }

    // -------------------------------------------------------------------------
    // Inode & Block
    // -------------------------------------------------------------------------

    async fn handle_inode(&self, client: ClientOrd, request: &InodeRequest) -> Result<Reply> {
        let store = self.leases.store();
        let ino = request.ino();
        match request {
            InodeRequest::GetIno { .. } | InodeRequest::SetAbr { .. } => {},
            InodeRequest::FsyncWait { .. } | InodeRequest::FsyncNoWait { .. } => {
                let inode = store.read_inode(ino)?;
                store.write_inode_back(&inode)?;
            },
            InodeRequest::SetAttr { attr, .. } => {
                if let Some(size) = attr.size {
                    store.truncate_to_size(ino, size)?;
                }
                let mut inode = store.read_inode(ino)?;
                if let Some(mode) = attr.mode {
                    inode.mode = (inode.mode & !0o7777) | (mode & 0o7777);
                }
                if let Some(mtime) = attr.mtime {
                    inode.mtime = mtime;
                }
                store.write_inode_back(&inode)?;
            },
            InodeRequest::Stage { .. } => {
                let args = LeaseArgs::new(ino, LeaseType::Stage);
                let outcome = self.leases.request_lease(client, &args, WaitMode::Wait).await?;
                if !outcome.is_granted() {
                    return Err(ShareError::Remote(ErrorCode::BUSY));
                }
            },
            InodeRequest::CancelStage { .. } => {
                self.leases
                    .remove(client, &LeaseArgs::new(ino, LeaseType::Stage))
                    .await?;
            },
        }
        Ok(Reply::Inode(store.read_inode(ino)?))
    }

    fn handle_block(&self, client: ClientOrd, request: &BlockRequest) -> Result<Reply> {
        let store = self.leases.store();
        let reply = match request {
            BlockRequest::GetBuffer { ino, offset, len } => {
                let inode = store.read_inode(*ino)?;
                // Blocks are not kept in memory; holes read as zeroes.
                let avail = inode
                    .size
                    .saturating_sub(*offset)
                    .min(u64::from(*len))
                    .min(MAX_BUFFER_LEN as u64);
                BlockReply::Buffer(Bytes::from(vec![0u8; usize::try_from(avail).unwrap_or(0)]))
            },
            BlockRequest::GetInode { ino } => BlockReply::Inode(store.read_inode(*ino)?),
            BlockRequest::GetSuperblock => BlockReply::Superblock {
                fsid: self.config.fsid,
                fs_generation: self.mount.fs_generation(),
            },
            BlockRequest::Statfs => {
                let files = self.namespace.file_count();
                BlockReply::Statfs(FsStats {
                    block_size: BLOCK_SIZE,
                    total_blocks: self.config.capacity_blocks,
                    free_blocks: self.config.capacity_blocks.saturating_sub(files),
                    files,
                })
            },
            BlockRequest::Wakeup { ino } => {
                debug!(target: "sfs::server", client, ino = %ino, "Wakeup");
                BlockReply::Done
            },
            BlockRequest::Panic => {
                warn!(target: "sfs::server", client, "Client reported panic");
                self.registry
                    .broadcast_notify(&Notify::Panic { ord: client }, Some(client));
                BlockReply::Done
            },
            BlockRequest::Quota { .. } => BlockReply::Done,
        };
        Ok(Reply::Block(reply))
    }

    /// Inode of `ino` as the server currently sees it.
    pub fn inode(&self, ino: FileId) -> Result<sfs_core::InodeSnapshot> {
        self.leases.store().read_inode(ino)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::namespace::MemoryNamespace;
    use sfs_core::{InodeSnapshot, Seqno};
    use sfs_lease::MemoryInodeStore;
    use sfs_network::{ByteOrder, encode_message, parse_message};
    use tokio::sync::mpsc;

    struct Harness {
        server: Arc<ServerDispatcher>,
        store: MemoryInodeStore,
        seqno: u32,
    }

    impl Harness {
        fn new() -> Self {
            let store = MemoryInodeStore::new();
            let namespace = Arc::new(MemoryNamespace::new(store.clone()));
            let server = ServerDispatcher::new(
                ServerConfig::default(),
                Arc::new(store.clone()),
                namespace,
            );
            server.take_over();
            Self {
                server,
                store,
                seqno: 0,
            }
        }

        fn message(&mut self, ord: ClientOrd, request: Request, wait: WaitMode) -> Message {
            self.seqno += 1;
            let mut message = Message::request(request, wait);
            message.header.client_ord = ord;
            if wait.blocks() {
                message.header.seqno = Seqno::new(self.seqno);
                message.header.ack = Seqno::new(self.seqno);
            }
            message
        }

        async fn mount(&mut self, host: &str) -> ClientOrd {
            let init = self.message(
                0,
                Request::Mount(MountRequest::Init {
                    host: host.to_string(),
                    fs_name: "sfs0".to_string(),
                    flags: MountFlags::EMPTY,
                }),
                WaitMode::Wait,
            );
            match self.server.dispatch(init).await.unwrap().as_reply() {
                Some(Reply::Mount(reply)) => reply.client_ord,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    fn lease_get(ino: u64) -> Request {
        Request::Lease(LeaseRequest::Get(LeaseArgs::new(FileId(ino), LeaseType::Read)))
    }

    #[tokio::test]
    async fn test_unknown_client_out_of_sync() {
        let mut h = Harness::new();
        let msg = h.message(42, lease_get(1), WaitMode::Wait);
        let reply = h.server.dispatch(msg).await.unwrap();
        assert_eq!(reply.header.error, ErrorCode::MOUNT_OUT_OF_SYNC);
    }

    #[tokio::test]
    async fn test_not_server_drops() {
        let mut h = Harness::new();
        let ord = h.mount("alpha").await;
        h.server.step_down();
        assert!(h.server.mount().status().contains(MountStatus::FROZEN));
        let msg = h.message(ord, lease_get(1), WaitMode::Wait);
        assert!(h.server.dispatch(msg).await.is_none());

        // Taking the role back thaws the node.
        h.server.take_over();
        assert!(!h.server.mount().status().contains(MountStatus::FROZEN));
        assert!(h.server.mount().is_server());
    }

    #[tokio::test]
    async fn test_resync_gates_requests() {
        let mut h = Harness::new();
        h.store.insert(InodeSnapshot::new(FileId(300)));
        let ord = h.mount("alpha").await;

        // A new server instance takes over with a known client.
        h.server.take_over();
        assert!(h.server.mount().is_resyncing());

        let get = h.message(ord, lease_get(300), WaitMode::Wait);
        let reply = h.server.dispatch(get).await.unwrap();
        assert_eq!(reply.header.error, ErrorCode::TRY_AGAIN);

        let reset = h.message(
            ord,
            Request::Lease(LeaseRequest::Reset(LeaseArgs::new(FileId(300), LeaseType::Read))),
            WaitMode::Wait,
        );
        let reply = h.server.dispatch(reset).await.unwrap();
        assert!(reply.header.error.is_ok());

        let status = h.message(ord, Request::Mount(MountRequest::Status), WaitMode::Wait);
        assert!(h.server.dispatch(status).await.unwrap().header.error.is_ok());

        let done = h.message(ord, Request::Mount(MountRequest::Resync), WaitMode::Wait);
        h.server.dispatch(done).await.unwrap();
        assert!(!h.server.mount().is_resyncing());

        let get = h.message(ord, lease_get(300), WaitMode::Wait);
        assert!(h.server.dispatch(get).await.unwrap().header.error.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_fsid_stale_except_superblock() {
        let mut h = Harness::new();
        let ord = h.mount("alpha").await;

        let mut get = h.message(ord, lease_get(1), WaitMode::Wait);
        get.header.fsid = 99;
        assert_eq!(
            h.server.dispatch(get).await.unwrap().header.error,
            ErrorCode::STALE
        );

        let mut superblock = h.message(
            ord,
            Request::Block(BlockRequest::GetSuperblock),
            WaitMode::Wait,
        );
        superblock.header.fsid = 99;
        let reply = h.server.dispatch(superblock).await.unwrap();
        assert!(matches!(
            reply.as_reply(),
            Some(Reply::Block(BlockReply::Superblock { fsid: 1, .. }))
        ));
    }

    #[tokio::test]
    async fn test_oversized_buffer_read_is_capped() {
        let mut h = Harness::new();
        let mut inode = InodeSnapshot::new(FileId(9));
        inode.size = 8 << 30;
        h.store.insert(inode);
        let ord = h.mount("alpha").await;

        let read = Request::Block(BlockRequest::GetBuffer {
            ino: FileId(9),
            offset: 0,
            len: u32::MAX,
        });
        let msg = h.message(ord, read, WaitMode::Wait);
        let reply = h.server.dispatch(msg).await.unwrap();
        let Some(Reply::Block(BlockReply::Buffer(data))) = reply.as_reply() else {
            panic!("expected buffer reply");
        };
        assert_eq!(data.len(), MAX_BUFFER_LEN);

        let encoded = encode_message(&reply, ByteOrder::native());
        let (decoded, _, used) = parse_message(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert!(matches!(
            decoded.as_reply(),
            Some(Reply::Block(BlockReply::Buffer(d))) if d.len() == MAX_BUFFER_LEN
        ));
    }

    #[tokio::test]
    async fn test_create_replayed_not_reexecuted() {
        let mut h = Harness::new();
        let ord = h.mount("alpha").await;
        let root = h.server.namespace().root();
        let create = h.message(
            ord,
            Request::Name(NameRequest::Create {
                parent: root,
                name: "f".to_string(),
                mode: 0o644,
            }),
            WaitMode::Wait,
        );

        let first = h.server.dispatch(create.clone()).await.unwrap();
        assert!(first.header.error.is_ok());
        let files = h.store.inode_count();

        // The retransmission gets the same answer instead of EEXIST.
        let second = h.server.dispatch(create).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.store.inode_count(), files);
    }

    #[tokio::test]
    async fn test_no_wait_gets_no_reply() {
        let mut h = Harness::new();
        h.store.insert(InodeSnapshot::new(FileId(5)));
        let ord = h.mount("alpha").await;
        let msg = h.message(ord, lease_get(5), WaitMode::NoWait);
        assert!(h.server.dispatch(msg).await.is_none());
        assert_eq!(h.server.leases().holders(FileId(5)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_broadcasts_stale_name() {
        let mut h = Harness::new();
        let alpha = h.mount("alpha").await;
        let beta = h.mount("beta").await;
        let (tx, mut rx) = mpsc::channel(8);
        h.server.registry().register(beta, tx);
        let root = h.server.namespace().root();

        for request in [
            NameRequest::Create {
                parent: root,
                name: "gone".to_string(),
                mode: 0o644,
            },
            NameRequest::Remove {
                parent: root,
                name: "gone".to_string(),
            },
        ] {
            let msg = h.message(alpha, Request::Name(request), WaitMode::Wait);
            assert!(h.server.dispatch(msg).await.unwrap().header.error.is_ok());
        }

        let notify = rx.recv().await.unwrap();
        assert_eq!(
            notify.as_request(),
            Some(&Request::Notify(Notify::Dnlc {
                parent: root,
                name: "gone".to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn test_evicted_client_leases_dropped() {
        let mut h = Harness::new();
        h.store.insert(InodeSnapshot::new(FileId(9)));
        let ord = h.mount("alpha").await;
        let msg = h.message(ord, lease_get(9), WaitMode::Wait);
        h.server.dispatch(msg).await.unwrap();
        assert_eq!(h.server.leases().holders(FileId(9)).await.len(), 1);

        h.server.evict_client(ord).await;
        assert!(h.server.leases().holders(FileId(9)).await.is_empty());
        let msg = h.message(ord, lease_get(9), WaitMode::Wait);
        assert!(h.server.dispatch(msg).await.is_none());
    }

    #[tokio::test]
    async fn test_stage_lease_tracked() {
        let mut h = Harness::new();
        h.store.insert(InodeSnapshot::new(FileId(11)));
        let ord = h.mount("alpha").await;
        let msg = h.message(
            ord,
            Request::Inode(InodeRequest::Stage { ino: FileId(11) }),
            WaitMode::Wait,
        );
        assert!(h.server.dispatch(msg).await.unwrap().header.error.is_ok());
        assert!(h.server.leases().is_stage_in_progress(FileId(11)).await);

        let msg = h.message(
            ord,
            Request::Inode(InodeRequest::CancelStage { ino: FileId(11) }),
            WaitMode::Wait,
        );
        h.server.dispatch(msg).await.unwrap();
        assert!(!h.server.leases().is_stage_in_progress(FileId(11)).await);
    }
}
