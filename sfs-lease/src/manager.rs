//! Server-side lease manager.
//!
//! Owns every file's [`LeaseTable`]. Locks are always taken in the same
//! order: the table map first, then the file's table. The map lock is never
//! requested while a file lock is held.

use crate::conflict::{ConflictInput, Decision, evaluate};
use crate::frlock::{FrlockOutcome, RecordLocks};
use crate::reclaim::Reclaimer;
use crate::record::LeaseState;
use crate::store::{ArchiveEvent, ArchiveHook, InodeStore, LeaseEvents, NoArchive};
use crate::table::LeaseTable;
use sfs_core::{
    ActionFlags, ClientOrd, ErrorCode, FileId, LeaseMask, LeasePolicy, LeaseType, OpenIntent,
    Result, ShareError, TruncateKind, WaitMode,
};
use sfs_metrics::{
    decrement_tables, increment_callouts, increment_lease_expirations, increment_lease_waits,
    increment_leases_granted, increment_leases_removed, increment_tables,
};
use sfs_network::{Callout, LeaseArgs, LeaseReply, LockKind, Notify, RecordLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type SharedTable = Arc<Mutex<LeaseTable>>;
type TableGuard = OwnedMutexGuard<LeaseTable>;

#[derive(Debug, Clone, Copy, Default)]
pub struct LeaseConfig {
    pub policy: LeasePolicy,
    /// Several clients may write one file concurrently using direct I/O.
    pub multihost_write: bool,
}

impl LeaseConfig {
    #[must_use]
    pub fn with_policy(mut self, policy: LeasePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_multihost_write(mut self, enabled: bool) -> Self {
        self.multihost_write = enabled;
        self
    }
}

/// Result of a lease get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Granted(LeaseReply),
    /// Conflicting holders exist; the client waits for `Notify::Lease`.
    Waiting(LeaseReply),
}

impl LeaseOutcome {
    #[inline]
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    #[must_use]
    pub fn reply(&self) -> &LeaseReply {
        match self {
            Self::Granted(r) | Self::Waiting(r) => r,
        }
    }

    #[must_use]
    pub fn into_reply(self) -> LeaseReply {
        match self {
            Self::Granted(r) | Self::Waiting(r) => r,
        }
    }
}

/// What a removal dropped and what the client must do about it.
#[derive(Debug, Clone, Copy, Default)]
struct Removal {
    actions: ActionFlags,
}

pub struct LeaseManager {
    config: LeaseConfig,
    tables: RwLock<HashMap<FileId, SharedTable>>,
    store: Arc<dyn InodeStore>,
    events: Arc<dyn LeaseEvents>,
    hook: Arc<dyn ArchiveHook>,
    reclaimer: Reclaimer,
    frlocks: RecordLocks,
    me: Weak<LeaseManager>,
}

impl LeaseManager {
    pub fn new(
        config: LeaseConfig,
        store: Arc<dyn InodeStore>,
        events: Arc<dyn LeaseEvents>,
    ) -> Arc<Self> {
        Self::with_archive_hook(config, store, events, Arc::new(NoArchive))
    }

    pub fn with_archive_hook(
        config: LeaseConfig,
        store: Arc<dyn InodeStore>,
        events: Arc<dyn LeaseEvents>,
        hook: Arc<dyn ArchiveHook>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            tables: RwLock::new(HashMap::new()),
            store,
            events,
            hook,
            reclaimer: Reclaimer::default(),
            frlocks: RecordLocks::new(),
            me: me.clone(),
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn InodeStore> {
        &self.store
    }

    pub(crate) fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    // -------------------------------------------------------------------------
    // Table access
    // -------------------------------------------------------------------------

    async fn lock_table(&self, ino: FileId, create: bool) -> Result<Option<TableGuard>> {
        loop {
            let existing = self.tables.read().await.get(&ino).cloned();
            let table = match existing {
                Some(table) => table,
                None if !create => return Ok(None),
                None => {
                    let mut tables = self.tables.write().await;
                    if let Some(table) = tables.get(&ino) {
                        Arc::clone(table)
                    } else {
                        let pin = Arc::new(self.store.pin(ino)?);
                        let table = Arc::new(Mutex::new(LeaseTable::new(ino, pin)));
                        tables.insert(ino, Arc::clone(&table));
                        increment_tables();
                        table
                    }
                },
            };
            let guard = table.lock_owned().await;
            if !guard.is_retired() {
                return Ok(Some(guard));
            }
        }
    }

    async fn open_table(&self, ino: FileId) -> Result<TableGuard> {
        self.lock_table(ino, true)
            .await?
            .ok_or_else(|| ShareError::Internal(format!("lease table {ino} vanished")))
    }

    async fn find_table(&self, ino: FileId) -> Option<TableGuard> {
        self.lock_table(ino, false).await.ok().flatten()
    }

    /// Unlock the file and unlink its table if nothing is left in it. The
    /// pin goes with the last reference to the table.
    async fn release_table(&self, mut guard: TableGuard) {
        guard.prune();
        self.schedule_reclaim(&guard);
        let ino = guard.ino();
        let empty = guard.is_empty();
        drop(guard);
        if !empty {
            return;
        }

        let mut tables = self.tables.write().await;
        let Some(table) = tables.get(&ino).cloned() else {
            return;
        };
        let mut guard = table.lock().await;
        if guard.is_empty() && !guard.is_retired() {
            guard.retire();
            tables.remove(&ino);
            self.reclaimer.cancel(ino);
            decrement_tables();
            self.hook.lease_transition(ino, ArchiveEvent::Archivable);
            debug!(target: "sfs::lease", ino = %ino, "Lease table released");
        }
    }

    fn schedule_reclaim(&self, table: &LeaseTable) {
        match table.earliest_expiry() {
            Some(at) => self.reclaimer.schedule(table.ino(), at, self.me.clone()),
            None => self.reclaimer.cancel(table.ino()),
        }
    }

    fn reply_for(table: &LeaseTable, client: ClientOrd, actions: ActionFlags) -> LeaseReply {
        let (granted, gens) = table
            .record(client)
            .map(|r| (r.held, r.gens))
            .unwrap_or_default();
        LeaseReply {
            granted,
            gens,
            actions,
            ..LeaseReply::default()
        }
    }

    // -------------------------------------------------------------------------
    // Get
    // -------------------------------------------------------------------------

    /// Grant `args.ltype` to `client` or record it as waiting.
    pub async fn request_lease(
        &self,
        client: ClientOrd,
        args: &LeaseArgs,
        wait: WaitMode,
    ) -> Result<LeaseOutcome> {
        if args.ltype == LeaseType::FileRecordLock {
            return self.request_frlock(client, args).await;
        }
        let mut table = self.open_table(args.ino).await?;
        let result = self.grant_or_wait(&mut table, client, args, wait);
        self.release_table(table).await;
        result
    }

    fn grant_or_wait(
        &self,
        table: &mut LeaseTable,
        client: ClientOrd,
        args: &LeaseArgs,
        wait: WaitMode,
    ) -> Result<LeaseOutcome> {
        let inode = self.store.read_inode(args.ino)?;
        let (other, other_mmap) = table.other_masks(client);
        let own = table.record(client).map_or(LeaseMask::EMPTY, |r| r.held);
        let decision = evaluate(&ConflictInput {
            ltype: args.ltype,
            other,
            other_mmap,
            own,
            multihost: self.config.multihost_write,
            truncate: args.truncate,
            growing: args.ltype == LeaseType::Truncate && args.resid >= inode.size,
        });

        match decision {
            Decision::Wait { relinquish } => {
                let mut reply = self.defer(table, client, args.ltype, relinquish);
                reply.size = inode.size;
                Ok(LeaseOutcome::Waiting(reply))
            },
            Decision::Grant { actions } => {
                let mut reply = self.grant(table, client, args, wait, actions)?;
                if !reply.actions.contains(ActionFlags::SET_SIZE) {
                    reply.size = inode.size;
                }
                Ok(LeaseOutcome::Granted(reply))
            },
        }
    }

    fn defer(
        &self,
        table: &mut LeaseTable,
        client: ClientOrd,
        ltype: LeaseType,
        relinquish: LeaseMask,
    ) -> LeaseReply {
        let ino = table.ino();
        table.record_or_insert(client).waiting.insert(ltype);
        increment_lease_waits();
        debug!(
            target: "sfs::lease",
            ino = %ino,
            client,
            ltype = %ltype,
            "Lease conflict, client waits"
        );

        if self.config.policy.callouts_enabled() && !relinquish.is_empty() {
            for (holder, mask) in table.holders_of(relinquish, client) {
                self.events
                    .callout(holder, Callout::RelinquishLease { ino, mask });
                increment_callouts();
                debug!(
                    target: "sfs::lease",
                    ino = %ino,
                    client = holder,
                    mask = %mask,
                    "Relinquish callout sent"
                );
            }
        }
        Self::reply_for(table, client, ActionFlags::WAIT_LEASE)
    }

    fn grant(
        &self,
        table: &mut LeaseTable,
        client: ClientOrd,
        args: &LeaseArgs,
        wait: WaitMode,
        mut actions: ActionFlags,
    ) -> Result<LeaseReply> {
        let ino = table.ino();
        let ltype = args.ltype;
        let policy = self.config.policy;
        let interval = policy.clamp_interval(args.interval_secs);
        let expire = Instant::now() + policy.server_timeout(interval);

        let sole = table
            .records()
            .iter()
            .all(|r| r.client == client || r.held.is_empty());
        let mut types = LeaseMask::from(ltype);
        match ltype {
            LeaseType::Open
                if sole
                    && !args.open.intersects(
                        OpenIntent::WRITE | OpenIntent::CREATE | OpenIntent::TRUNCATE,
                    ) =>
            {
                types |= LeaseMask::READ;
            },
            LeaseType::ReadMap => types |= LeaseMask::READ,
            LeaseType::WriteMap | LeaseType::Append => types |= LeaseMask::WRITE,
            _ => {},
        }

        let observed_seq = table.write_seq;
        let new_seq = if types.intersects(LeaseMask::DATA_MODIFYING) {
            observed_seq + 1
        } else {
            observed_seq
        };

        let rec = table.record_or_insert(client);
        for t in types.iter() {
            rec.grant(t, (!t.is_non_expiring()).then_some(expire));
            if wait.blocks() {
                rec.gens.bump(t);
            }
        }
        rec.direct_io = actions.contains(ActionFlags::DIRECTIO_ON);
        if types.intersects(LeaseMask::DATA_READING) && rec.last_write_seq != observed_seq {
            actions |= ActionFlags::STALE_INDIRECT | ActionFlags::INVAL_PAGES;
        }
        rec.last_write_seq = new_seq;
        table.write_seq = new_seq;

        if types.contains(LeaseType::Write) && !self.config.multihost_write {
            table.write_owner = Some(client);
        }
        if ltype == LeaseType::Append && table.size_owner != Some(client) {
            table.size_owner = Some(client);
            actions |= ActionFlags::FORCE_SIZE;
        }

        increment_leases_granted();
        debug!(
            target: "sfs::lease",
            ino = %ino,
            client,
            granted = %types,
            actions = %actions,
            "Lease granted"
        );

        if ltype == LeaseType::Truncate {
            let truncated = self.store.truncate_to_size(ino, args.resid);
            let removed = self.remove_inner(table, client, LeaseMask::TRUNCATE);
            truncated?;
            actions |= removed?.actions | ActionFlags::SET_SIZE;
            let mut reply = Self::reply_for(table, client, actions);
            reply.size = args.resid;
            reply.expire_secs = interval;
            return Ok(reply);
        }

        // Waiters beyond the one notified per removal become eligible here.
        self.notify_waiters(table);
        let mut reply = Self::reply_for(table, client, actions);
        reply.expire_secs = interval;
        Ok(reply)
    }

    // -------------------------------------------------------------------------
    // Remove / relinquish / extend / reset
    // -------------------------------------------------------------------------

    /// Forcibly drop `args.mask` from the client's leases.
    pub async fn remove(&self, client: ClientOrd, args: &LeaseArgs) -> Result<LeaseReply> {
        let Some(mut table) = self.find_table(args.ino).await else {
            return Ok(LeaseReply::default());
        };
        let result = self
            .remove_inner(&mut table, client, args.mask)
            .map(|removal| Self::reply_for(&table, client, removal.actions));
        self.release_table(table).await;
        result
    }

    /// Voluntary release. Bits whose generation does not match the
    /// current grant are left alone.
    pub async fn relinquish(&self, client: ClientOrd, args: &LeaseArgs) -> Result<LeaseReply> {
        let Some(mut table) = self.find_table(args.ino).await else {
            return Ok(LeaseReply::default());
        };
        let mut mask = LeaseMask::EMPTY;
        if let Some(rec) = table.record(client) {
            for ltype in args.mask.iter() {
                let current = rec.gens.get(ltype);
                if rec.holds(ltype) && args.gens.get(ltype) != current {
                    debug!(
                        target: "sfs::lease",
                        ino = %args.ino,
                        client,
                        ltype = %ltype,
                        attempted = %args.gens.get(ltype),
                        current = %current,
                        "Stale relinquish ignored"
                    );
                    continue;
                }
                mask.insert(ltype);
            }
        }
        let result = self
            .remove_inner(&mut table, client, mask)
            .map(|removal| Self::reply_for(&table, client, removal.actions));
        self.release_table(table).await;
        result
    }

    /// Refresh the expiry of one held lease.
    pub async fn extend(&self, client: ClientOrd, args: &LeaseArgs) -> Result<LeaseReply> {
        let ltype = args
            .mask
            .single()
            .ok_or(ShareError::Remote(ErrorCode::INVALID))?;
        let Some(mut table) = self.find_table(args.ino).await else {
            return Err(ShareError::Remote(ErrorCode::CANCELED));
        };
        let result = self.extend_inner(&mut table, client, ltype, args);
        self.release_table(table).await;
        result
    }

    fn extend_inner(
        &self,
        table: &mut LeaseTable,
        client: ClientOrd,
        ltype: LeaseType,
        args: &LeaseArgs,
    ) -> Result<LeaseReply> {
        let others_waiting = table.any_other_waiting(client);
        let interval = self.config.policy.clamp_interval(args.interval_secs);
        let expire = Instant::now() + self.config.policy.server_timeout(interval);
        let Some(rec) = table.record_mut(client) else {
            return Err(ShareError::Remote(ErrorCode::CANCELED));
        };
        if !rec.holds(ltype) || others_waiting || args.gens.get(ltype).is_behind(rec.gens.get(ltype))
        {
            debug!(
                target: "sfs::lease",
                ino = %args.ino,
                client,
                ltype = %ltype,
                others_waiting,
                "Lease extension refused"
            );
            return Err(ShareError::Remote(ErrorCode::CANCELED));
        }
        if !ltype.is_non_expiring() {
            rec.expire_at[ltype.index()] = Some(expire);
        }
        let mut reply = Self::reply_for(table, client, ActionFlags::EMPTY);
        reply.expire_secs = interval;
        Ok(reply)
    }

    /// Re-establish leases a client held before failover, keeping the
    /// client's generations.
    pub async fn reset(&self, client: ClientOrd, args: &LeaseArgs) -> Result<LeaseReply> {
        let mut table = self.open_table(args.ino).await?;
        let result = self.reset_inner(&mut table, client, args);
        self.release_table(table).await;
        result
    }

    fn reset_inner(
        &self,
        table: &mut LeaseTable,
        client: ClientOrd,
        args: &LeaseArgs,
    ) -> Result<LeaseReply> {
        let policy = self.config.policy;
        let interval = policy.clamp_interval(args.interval_secs);
        let expire = Instant::now() + policy.server_timeout(interval);
        let write_seq = table.write_seq;

        let rec = table.record_or_insert(client);
        for ltype in args.mask.iter() {
            let attempted = args.gens.get(ltype);
            let current = rec.gens.get(ltype);
            if attempted.is_behind(current) {
                return Err(ShareError::StaleGeneration {
                    ltype,
                    attempted: attempted.get(),
                    current: current.get(),
                });
            }
        }
        for ltype in args.mask.iter() {
            rec.grant(ltype, (!ltype.is_non_expiring()).then_some(expire));
            rec.gens.set(ltype, args.gens.get(ltype));
        }
        rec.last_write_seq = write_seq;

        if args.mask.contains(LeaseType::Append) {
            table.size_owner = Some(client);
        }
        if args.mask.contains(LeaseType::Write) && !self.config.multihost_write {
            table.write_owner = Some(client);
        }
        info!(
            target: "sfs::lease",
            ino = %args.ino,
            client,
            mask = %args.mask,
            "Lease reset"
        );
        let mut reply = Self::reply_for(table, client, ActionFlags::EMPTY);
        reply.expire_secs = interval;
        Ok(reply)
    }

    /// Drop `mask` from `client` and run the cleanup tied to each class of
    /// lease. Bookkeeping always completes; the first collaborator failure
    /// is returned afterwards.
    fn remove_inner(
        &self,
        table: &mut LeaseTable,
        client: ClientOrd,
        mask: LeaseMask,
    ) -> Result<Removal> {
        let ino = table.ino();
        let Some(rec) = table.record_mut(client) else {
            return Ok(Removal::default());
        };
        let dropped = rec.release(mask);
        if dropped.is_empty() {
            return Ok(Removal::default());
        }

        let remaining = table.held_union();
        let mut actions = ActionFlags::EMPTY;
        let mut first_err = None;

        if dropped.contains(LeaseType::Write) {
            actions |= ActionFlags::INVAL_PAGES;
            self.store.invalidate_cached_pages(ino, 0, u64::MAX);
            if table.write_owner == Some(client) {
                table.write_owner = None;
            }
        }
        if dropped.contains(LeaseType::FileRecordLock) {
            actions |= ActionFlags::NOTIFY_FRLOCK;
            self.frlocks.unlock_all(ino, client);
        }
        if dropped.contains(LeaseType::Append) {
            if table.size_owner == Some(client) {
                table.size_owner = None;
            }
            if !remaining.contains(LeaseType::Append) {
                if let Err(e) = self.trim_preallocation(ino) {
                    first_err.get_or_insert(e);
                }
            }
        }
        if dropped.intersects(LeaseMask::SIZE_CHANGING) {
            let flushed = self
                .store
                .read_inode(ino)
                .and_then(|inode| self.store.write_inode_back(&inode));
            if let Err(e) = flushed {
                first_err.get_or_insert(e);
            }
        }
        let stage_blockers = LeaseMask::TRUNCATE | LeaseMask::EXCLUSIVE;
        if dropped.intersects(stage_blockers) && !remaining.intersects(stage_blockers) {
            self.hook.lease_transition(ino, ArchiveEvent::Stageable);
        }

        increment_leases_removed();
        debug!(
            target: "sfs::lease",
            ino = %ino,
            client,
            dropped = %dropped,
            actions = %actions,
            "Lease removed"
        );
        table.prune();
        self.notify_waiters(table);

        match first_err {
            Some(e) => {
                warn!(target: "sfs::lease", ino = %ino, client, error = %e, "Lease cleanup failed");
                Err(e)
            },
            None => Ok(Removal { actions }),
        }
    }

    fn trim_preallocation(&self, ino: FileId) -> Result<()> {
        let inode = self.store.read_inode(ino)?;
        if inode.allocated > inode.size {
            self.store.truncate_to_size(ino, inode.size)?;
        }
        Ok(())
    }

    /// Tell one waiter, round-robin, that its awaited leases can now be
    /// granted.
    fn notify_waiters(&self, table: &mut LeaseTable) {
        let ino = table.ino();
        let multihost = self.config.multihost_write;
        let found = table.next_waiter(|t, client, waiting| {
            let waiting = waiting.difference(LeaseMask::FRLOCK);
            if waiting.is_empty() {
                return false;
            }
            let (other, other_mmap) = t.other_masks(client);
            let own = t.record(client).map_or(LeaseMask::EMPTY, |r| r.held);
            waiting.iter().all(|ltype| {
                evaluate(&ConflictInput {
                    ltype,
                    other,
                    other_mmap,
                    own,
                    multihost,
                    truncate: TruncateKind::default(),
                    growing: false,
                })
                .is_grant()
            })
        });

        if let Some((client, waiting)) = found {
            let mask = waiting.difference(LeaseMask::FRLOCK);
            if let Some(rec) = table.record_mut(client) {
                rec.waiting = rec.waiting.difference(mask);
            }
            self.events.notify(client, Notify::Lease { ino, mask });
            debug!(target: "sfs::lease", ino = %ino, client, mask = %mask, "Waiter notified");
        }
    }

    // -------------------------------------------------------------------------
    // Expiry and disconnect
    // -------------------------------------------------------------------------

    /// Drop every lease on `ino` whose deadline has passed.
    pub async fn reclaim_expired(&self, ino: FileId) {
        let Some(mut table) = self.find_table(ino).await else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<(ClientOrd, LeaseMask)> = table
            .records()
            .iter()
            .map(|r| (r.client, r.expired(now)))
            .filter(|(_, mask)| !mask.is_empty())
            .collect();

        for (client, mask) in expired {
            if let Err(e) = self.remove_inner(&mut table, client, mask) {
                warn!(target: "sfs::lease", ino = %ino, client, error = %e, "Expiry cleanup failed");
            }
            self.events.notify(client, Notify::LeaseExpire { ino, mask });
            increment_lease_expirations();
            info!(target: "sfs::lease", ino = %ino, client, mask = %mask, "Lease expired");
        }
        self.release_table(table).await;
    }

    /// Drop every lease and pending attempt of a client that went away.
    pub async fn client_disconnected(&self, client: ClientOrd) {
        self.frlocks.cancel_client(client);
        let inos: Vec<FileId> = self.tables.read().await.keys().copied().collect();
        for ino in inos {
            let Some(mut table) = self.find_table(ino).await else {
                continue;
            };
            if table.record(client).is_some() {
                if let Err(e) = self.remove_inner(&mut table, client, LeaseMask::ALL) {
                    warn!(target: "sfs::lease", ino = %ino, client, error = %e, "Disconnect cleanup failed");
                }
                if let Some(rec) = table.record_mut(client) {
                    rec.waiting = LeaseMask::EMPTY;
                }
            }
            self.release_table(table).await;
        }
        info!(target: "sfs::lease", client, "Client leases dropped");
    }

    // -------------------------------------------------------------------------
    // Record locks
    // -------------------------------------------------------------------------

    async fn request_frlock(&self, client: ClientOrd, args: &LeaseArgs) -> Result<LeaseOutcome> {
        let lock = args.lock.ok_or(ShareError::Remote(ErrorCode::INVALID))?;
        let ino = args.ino;
        let mut table = self.open_table(ino).await?;

        let outcome = match lock.kind {
            LockKind::Unlock => {
                self.frlocks.unlock(ino, client, &lock);
                Ok(LeaseOutcome::Granted(Self::reply_for(
                    &table,
                    client,
                    ActionFlags::EMPTY,
                )))
            },
            LockKind::UnlockAll => {
                self.frlocks.cancel_client(client);
                self.remove_inner(&mut table, client, LeaseMask::FRLOCK)
                    .map(|removal| {
                        LeaseOutcome::Granted(Self::reply_for(&table, client, removal.actions))
                    })
            },
            LockKind::Shared | LockKind::Exclusive => {
                if self.frlocks.try_lock(ino, client, &lock) {
                    table
                        .record_or_insert(client)
                        .grant(LeaseType::FileRecordLock, None);
                    increment_leases_granted();
                    Ok(LeaseOutcome::Granted(Self::reply_for(
                        &table,
                        client,
                        ActionFlags::EMPTY,
                    )))
                } else if !lock.wait {
                    Err(ShareError::Remote(ErrorCode::ACCESS))
                } else {
                    table
                        .record_or_insert(client)
                        .waiting
                        .insert(LeaseType::FileRecordLock);
                    increment_lease_waits();
                    self.spawn_frlock_wait(client, ino, lock);
                    Ok(LeaseOutcome::Waiting(Self::reply_for(
                        &table,
                        client,
                        ActionFlags::WAIT_FRLOCK,
                    )))
                }
            },
        };
        self.release_table(table).await;
        outcome
    }

    fn spawn_frlock_wait(&self, client: ClientOrd, ino: FileId, lock: RecordLock) {
        let frlocks = self.frlocks.clone();
        let timeout = self.config.policy.frlock_timeout();
        let me = self.me.clone();
        tokio::spawn(async move {
            let outcome = frlocks.lock_blocking(ino, client, lock, timeout).await;
            if let Some(manager) = me.upgrade() {
                manager.finish_frlock_wait(client, ino, outcome).await;
            } else if outcome == FrlockOutcome::Granted {
                frlocks.unlock(ino, client, &lock);
            }
        });
    }

    async fn finish_frlock_wait(&self, client: ClientOrd, ino: FileId, outcome: FrlockOutcome) {
        let table = self.find_table(ino).await;
        let waiting = table.as_ref().is_some_and(|t| {
            t.record(client)
                .is_some_and(|r| r.waiting.contains(LeaseType::FileRecordLock))
        });
        let Some(mut table) = table else {
            self.frlocks.unlock_all(ino, client);
            return;
        };

        match outcome {
            FrlockOutcome::Granted if waiting => {
                table
                    .record_or_insert(client)
                    .grant(LeaseType::FileRecordLock, None);
                increment_leases_granted();
                self.events.notify(client, Notify::Lease {
                    ino,
                    mask: LeaseMask::FRLOCK,
                });
                debug!(target: "sfs::lease", ino = %ino, client, "Record lock granted");
            },
            FrlockOutcome::Granted => {
                self.frlocks.unlock_all(ino, client);
            },
            FrlockOutcome::TimedOut | FrlockOutcome::Interrupted => {
                if let Some(rec) = table.record_mut(client) {
                    rec.waiting.remove(LeaseType::FileRecordLock);
                }
                debug!(target: "sfs::lease", ino = %ino, client, ?outcome, "Record lock attempt ended");
            },
        }
        self.release_table(table).await;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// A stage lease is held on `ino`.
    pub async fn is_stage_in_progress(&self, ino: FileId) -> bool {
        match self.find_table(ino).await {
            Some(table) => table.held_union().contains(LeaseType::Stage),
            None => false,
        }
    }

    /// `(client, held)` for every record on `ino`.
    pub async fn holders(&self, ino: FileId) -> Vec<(ClientOrd, LeaseMask)> {
        match self.find_table(ino).await {
            Some(table) => table
                .records()
                .iter()
                .filter(|r| !r.held.is_empty())
                .map(|r| (r.client, r.held))
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn lease_state(&self, ino: FileId, client: ClientOrd) -> LeaseState {
        match self.find_table(ino).await {
            Some(table) => table
                .record(client)
                .map_or(LeaseState::Unheld, |r| r.state()),
            None => LeaseState::Unheld,
        }
    }

    pub async fn table_count(&self) -> usize {
        self.tables.read().await.len()
    }

    #[must_use]
    pub fn record_locks(&self) -> &RecordLocks {
        &self.frlocks
    }

    #[must_use]
    pub fn next_reclaim(&self, ino: FileId) -> Option<Instant> {
        self.reclaimer.scheduled_at(ino)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryInodeStore;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        callouts: StdMutex<Vec<(ClientOrd, Callout)>>,
        notifies: StdMutex<Vec<(ClientOrd, Notify)>>,
    }

    impl Recorder {
        fn callouts(&self) -> Vec<(ClientOrd, Callout)> {
            self.callouts.lock().unwrap().clone()
        }

        fn notifies(&self) -> Vec<(ClientOrd, Notify)> {
            self.notifies.lock().unwrap().clone()
        }
    }

    impl LeaseEvents for Recorder {
        fn callout(&self, client: ClientOrd, callout: Callout) {
            self.callouts.lock().unwrap().push((client, callout));
        }

        fn notify(&self, client: ClientOrd, notify: Notify) {
            self.notifies.lock().unwrap().push((client, notify));
        }
    }

    struct Fixture {
        manager: Arc<LeaseManager>,
        store: MemoryInodeStore,
        events: Arc<Recorder>,
        ino: FileId,
    }

    fn fixture(config: LeaseConfig) -> Fixture {
        let store = MemoryInodeStore::new();
        let ino = store.allocate(0o100_644).ino;
        let events = Arc::new(Recorder::default());
        let manager = LeaseManager::new(config, Arc::new(store.clone()), events.clone());
        Fixture {
            manager,
            store,
            events,
            ino,
        }
    }

    async fn get(f: &Fixture, client: ClientOrd, ltype: LeaseType) -> LeaseOutcome {
        f.manager
            .request_lease(client, &LeaseArgs::new(f.ino, ltype), WaitMode::Wait)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_readers_share() {
        let f = fixture(LeaseConfig::default());
        assert!(get(&f, 1, LeaseType::Read).await.is_granted());
        assert!(get(&f, 2, LeaseType::Read).await.is_granted());
        assert_eq!(f.manager.holders(f.ino).await.len(), 2);
        assert_eq!(f.store.pin_count(f.ino), 1);
    }

    #[tokio::test]
    async fn test_write_conflict_waits_and_calls_out() {
        let f = fixture(LeaseConfig::default());
        let read = get(&f, 1, LeaseType::Read).await.into_reply();
        let outcome = get(&f, 2, LeaseType::Write).await;
        assert!(!outcome.is_granted());
        assert!(outcome.reply().is_waiting());
        assert_eq!(f.manager.lease_state(f.ino, 2).await, LeaseState::Waiting);
        assert_eq!(f.events.callouts(), vec![(1, Callout::RelinquishLease {
            ino: f.ino,
            mask: LeaseMask::READ
        })]);

        let args = LeaseArgs::new(f.ino, LeaseType::Read).with_gens(read.gens);
        f.manager.relinquish(1, &args).await.unwrap();
        assert_eq!(f.events.notifies(), vec![(2, Notify::Lease {
            ino: f.ino,
            mask: LeaseMask::WRITE
        })]);
        assert!(get(&f, 2, LeaseType::Write).await.is_granted());
    }

    #[tokio::test]
    async fn test_callouts_disabled_by_negative_lease_timeout() {
        let config =
            LeaseConfig::default().with_policy(LeasePolicy::default().with_lease_timeout(-1));
        let f = fixture(config);
        get(&f, 1, LeaseType::Write).await;
        assert!(!get(&f, 2, LeaseType::Read).await.is_granted());
        assert!(f.events.callouts().is_empty());
    }

    #[tokio::test]
    async fn test_read_behind_write_does_not_deadlock() {
        let f = fixture(LeaseConfig::default());
        let r1 = get(&f, 1, LeaseType::Read).await.into_reply();
        assert!(!get(&f, 2, LeaseType::Write).await.is_granted());
        let r3 = get(&f, 3, LeaseType::Read).await;
        assert!(r3.is_granted());

        f.manager
            .relinquish(1, &LeaseArgs::new(f.ino, LeaseType::Read).with_gens(r1.gens))
            .await
            .unwrap();
        assert!(f.events.notifies().is_empty());

        f.manager
            .relinquish(
                3,
                &LeaseArgs::new(f.ino, LeaseType::Read).with_gens(r3.reply().gens),
            )
            .await
            .unwrap();
        assert_eq!(f.events.notifies().len(), 1);
        assert_eq!(f.events.notifies()[0].0, 2);
        assert!(get(&f, 2, LeaseType::Write).await.is_granted());
    }

    #[tokio::test]
    async fn test_one_waiter_notified_per_pass() {
        let f = fixture(LeaseConfig::default());
        let w = get(&f, 1, LeaseType::Write).await.into_reply();
        assert!(!get(&f, 2, LeaseType::Read).await.is_granted());
        assert!(!get(&f, 3, LeaseType::Read).await.is_granted());

        f.manager
            .relinquish(1, &LeaseArgs::new(f.ino, LeaseType::Write).with_gens(w.gens))
            .await
            .unwrap();
        let notified = f.events.notifies();
        assert_eq!(notified.len(), 1);

        // The notified reader's grant lets the next one through.
        assert!(get(&f, notified[0].0, LeaseType::Read).await.is_granted());
        assert_eq!(f.events.notifies().len(), 2);
    }

    #[tokio::test]
    async fn test_open_implies_read_only_for_sole_client() {
        let f = fixture(LeaseConfig::default());
        let first = get(&f, 1, LeaseType::Open).await.into_reply();
        assert_eq!(first.granted, LeaseMask::OPEN | LeaseMask::READ);

        let second = get(&f, 2, LeaseType::Open).await.into_reply();
        assert_eq!(second.granted, LeaseMask::OPEN);

        let args = LeaseArgs::new(f.ino, LeaseType::Open).with_open(OpenIntent::WRITE);
        let writer = f
            .manager
            .request_lease(3, &args, WaitMode::Wait)
            .await
            .unwrap()
            .into_reply();
        assert_eq!(writer.granted, LeaseMask::OPEN);
    }

    #[tokio::test]
    async fn test_append_implies_write_and_size_owner() {
        let f = fixture(LeaseConfig::default());
        let first = get(&f, 1, LeaseType::Append).await.into_reply();
        assert_eq!(first.granted, LeaseMask::APPEND | LeaseMask::WRITE);
        assert!(first.actions.contains(ActionFlags::FORCE_SIZE));

        let again = get(&f, 1, LeaseType::Append).await.into_reply();
        assert!(!again.actions.contains(ActionFlags::FORCE_SIZE));
    }

    #[tokio::test]
    async fn test_last_append_trims_preallocation() {
        let f = fixture(LeaseConfig::default());
        f.store
            .update(f.ino, |i| {
                i.size = 100;
                i.allocated = 8192;
            })
            .unwrap();
        get(&f, 1, LeaseType::Append).await;
        let args = LeaseArgs::new(f.ino, LeaseType::Append).with_mask(LeaseMask::APPEND);
        f.manager.remove(1, &args).await.unwrap();
        let inode = f.store.read_inode(f.ino).unwrap();
        assert_eq!(inode.allocated, 100);
        assert_eq!(f.store.flush_count(f.ino), 1);
    }

    #[tokio::test]
    async fn test_truncate_executes_and_is_removed() {
        let f = fixture(LeaseConfig::default());
        f.store.update(f.ino, |i| i.size = 4096).unwrap();
        let args = LeaseArgs::new(f.ino, LeaseType::Truncate).with_range(0, 10);
        let reply = f
            .manager
            .request_lease(1, &args, WaitMode::Wait)
            .await
            .unwrap()
            .into_reply();
        assert!(reply.actions.contains(ActionFlags::SET_SIZE));
        assert_eq!(reply.size, 10);
        assert!(!reply.granted.contains(LeaseType::Truncate));
        assert_eq!(f.store.read_inode(f.ino).unwrap().size, 10);
        assert_eq!(f.store.flush_count(f.ino), 1);
        assert_eq!(f.manager.table_count().await, 0);
    }

    #[tokio::test]
    async fn test_truncate_to_current_size_counts_as_growing() {
        let f = fixture(LeaseConfig::default().with_multihost_write(true));
        f.store.update(f.ino, |i| i.size = 4096).unwrap();
        assert!(get(&f, 2, LeaseType::Write).await.is_granted());

        let args = LeaseArgs::new(f.ino, LeaseType::Truncate).with_range(0, 4096);
        let outcome = f.manager.request_lease(1, &args, WaitMode::Wait).await.unwrap();
        assert!(outcome.is_granted());

        let shrink = LeaseArgs::new(f.ino, LeaseType::Truncate).with_range(0, 4095);
        let outcome = f.manager.request_lease(3, &shrink, WaitMode::Wait).await.unwrap();
        assert!(!outcome.is_granted());
    }

    #[tokio::test]
    async fn test_removing_write_invalidates_pages() {
        let f = fixture(LeaseConfig::default());
        get(&f, 1, LeaseType::Write).await;
        let args = LeaseArgs::new(f.ino, LeaseType::Write);
        let reply = f.manager.remove(1, &args).await.unwrap();
        assert!(reply.actions.contains(ActionFlags::INVAL_PAGES));
        assert_eq!(f.store.invalidation_count(f.ino), 1);
    }

    #[tokio::test]
    async fn test_multihost_reader_sees_stale_cache() {
        let f = fixture(LeaseConfig::default().with_multihost_write(true));
        let first = get(&f, 1, LeaseType::Read).await.into_reply();
        assert!(!first.actions.contains(ActionFlags::INVAL_PAGES));

        let write = get(&f, 2, LeaseType::Write).await.into_reply();
        assert!(write.actions.contains(ActionFlags::DIRECTIO_ON));

        let again = get(&f, 1, LeaseType::Read).await.into_reply();
        assert!(again.actions.contains(ActionFlags::INVAL_PAGES));
        assert!(again.actions.contains(ActionFlags::DIRECTIO_ON));
    }

    #[tokio::test]
    async fn test_stale_relinquish_ignored() {
        let f = fixture(LeaseConfig::default());
        get(&f, 1, LeaseType::Read).await;
        let reply = f
            .manager
            .relinquish(1, &LeaseArgs::new(f.ino, LeaseType::Read))
            .await
            .unwrap();
        assert_eq!(reply.granted, LeaseMask::READ);
    }

    #[tokio::test]
    async fn test_extend_rules() {
        let f = fixture(LeaseConfig::default());
        let args = LeaseArgs::new(f.ino, LeaseType::Read);
        assert!(matches!(
            f.manager.extend(1, &args).await,
            Err(ShareError::Remote(ErrorCode::CANCELED))
        ));

        let read = get(&f, 1, LeaseType::Read).await.into_reply();
        let args = args.with_gens(read.gens);
        assert!(f.manager.extend(1, &args).await.is_ok());

        assert!(!get(&f, 2, LeaseType::Write).await.is_granted());
        assert!(matches!(
            f.manager.extend(1, &args).await,
            Err(ShareError::Remote(ErrorCode::CANCELED))
        ));

        let two = args.with_mask(LeaseMask::READ | LeaseMask::OPEN);
        assert!(matches!(
            f.manager.extend(1, &two).await,
            Err(ShareError::Remote(ErrorCode::INVALID))
        ));
    }

    #[tokio::test]
    async fn test_reset_keeps_generations() {
        let f = fixture(LeaseConfig::default());
        let mut gens = sfs_core::GenerationSet::default();
        gens.set(LeaseType::Write, sfs_core::Generation::new(7));
        let args = LeaseArgs::new(f.ino, LeaseType::Write)
            .with_mask(LeaseMask::WRITE | LeaseMask::OPEN)
            .with_gens(gens);
        let reply = f.manager.reset(4, &args).await.unwrap();
        assert_eq!(reply.granted, LeaseMask::WRITE | LeaseMask::OPEN);
        assert_eq!(reply.gens.get(LeaseType::Write).get(), 7);
        assert!(reply.actions.is_empty());

        gens.set(LeaseType::Write, sfs_core::Generation::new(3));
        let stale = args.with_gens(gens);
        assert!(matches!(
            f.manager.reset(4, &stale).await,
            Err(ShareError::StaleGeneration { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_reclaimed() {
        let policy = LeasePolicy::default()
            .with_scaling(1, 0)
            .with_bounds(1, 1);
        let f = fixture(LeaseConfig::default().with_policy(policy));
        let args = LeaseArgs::new(f.ino, LeaseType::Read).with_interval(1);
        f.manager
            .request_lease(1, &args, WaitMode::Wait)
            .await
            .unwrap();
        let open = LeaseArgs::new(f.ino, LeaseType::Open).with_open(OpenIntent::WRITE);
        f.manager
            .request_lease(1, &open, WaitMode::Wait)
            .await
            .unwrap();
        assert!(f.manager.next_reclaim(f.ino).is_some());

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(f.events.notifies(), vec![(1, Notify::LeaseExpire {
            ino: f.ino,
            mask: LeaseMask::READ
        })]);
        assert_eq!(f.manager.holders(f.ino).await, vec![(1, LeaseMask::OPEN)]);
    }

    #[tokio::test]
    async fn test_table_released_unpins_file() {
        let f = fixture(LeaseConfig::default());
        get(&f, 1, LeaseType::Stage).await;
        assert!(f.manager.is_stage_in_progress(f.ino).await);
        assert_eq!(f.store.pin_count(f.ino), 1);
        let args = LeaseArgs::new(f.ino, LeaseType::Stage);
        f.manager.remove(1, &args).await.unwrap();
        assert!(!f.manager.is_stage_in_progress(f.ino).await);
        assert_eq!(f.manager.table_count().await, 0);
        assert_eq!(f.store.pin_count(f.ino), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_drops_leases() {
        let f = fixture(LeaseConfig::default());
        get(&f, 1, LeaseType::Write).await;
        assert!(!get(&f, 2, LeaseType::Read).await.is_granted());
        f.manager.client_disconnected(1).await;
        assert_eq!(f.manager.lease_state(f.ino, 1).await, LeaseState::Unheld);
        assert_eq!(f.events.notifies(), vec![(2, Notify::Lease {
            ino: f.ino,
            mask: LeaseMask::READ
        })]);
    }

    fn frlock_args(ino: FileId, kind: LockKind, wait: bool) -> LeaseArgs {
        LeaseArgs::new(ino, LeaseType::FileRecordLock).with_lock(RecordLock {
            start: 0,
            len: 100,
            kind,
            owner: 1,
            wait,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_record_lock_granted_by_notification() {
        let f = fixture(LeaseConfig::default());
        let m = &f.manager;
        let first = m
            .request_lease(1, &frlock_args(f.ino, LockKind::Exclusive, true), WaitMode::Wait)
            .await
            .unwrap();
        assert!(first.is_granted());

        let nowait = m
            .request_lease(2, &frlock_args(f.ino, LockKind::Shared, false), WaitMode::Wait)
            .await;
        assert!(matches!(nowait, Err(ShareError::Remote(ErrorCode::ACCESS))));

        let blocked = m
            .request_lease(2, &frlock_args(f.ino, LockKind::Shared, true), WaitMode::Wait)
            .await
            .unwrap();
        assert!(blocked.reply().actions.contains(ActionFlags::WAIT_FRLOCK));

        let unlock_all = m
            .request_lease(1, &frlock_args(f.ino, LockKind::UnlockAll, false), WaitMode::Wait)
            .await
            .unwrap();
        assert!(unlock_all.reply().actions.contains(ActionFlags::NOTIFY_FRLOCK));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.events.notifies(), vec![(2, Notify::Lease {
            ino: f.ino,
            mask: LeaseMask::FRLOCK
        })]);
        assert_eq!(f.manager.holders(f.ino).await, vec![(2, LeaseMask::FRLOCK)]);
    }
}
