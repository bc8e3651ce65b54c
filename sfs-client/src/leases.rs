//! Client lease cache.
//!
//! Tracks the leases this mount holds per file, serializes lease traffic
//! for one file behind a per-file lock, answers relinquish callouts and
//! re-establishes every held lease on a new server after failover.

use crate::error::{ClientError, Result};
use crate::transport::{ClientTransport, Connector};
use sfs_core::{
    ActionFlags, ErrorCode, FileId, GenerationSet, LeaseMask, LeaseType, MAX_LEASE_TYPES, WaitMode,
};
use sfs_metrics::{LATENCY_LEASE_WAIT, LatencyTimer};
use sfs_network::{
    Callout, LeaseArgs, LeaseReply, LeaseRequest, MountRequest, Notify, RecordLock, Reply, Request,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What this client believes it holds on one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeldLeases {
    pub mask: LeaseMask,
    pub gens: GenerationSet,
    /// File size reported with the last grant.
    pub size: u64,
    expires: [Option<Instant>; MAX_LEASE_TYPES],
    /// Count of blocked record locks the server has since granted.
    frlock_grants: u64,
}

impl HeldLeases {
    #[inline]
    #[must_use]
    pub fn holds(&self, ltype: LeaseType) -> bool {
        self.mask.contains(ltype)
    }

    /// Local expiry of one held lease. Non-expiring types return `None`.
    #[must_use]
    pub fn expires_at(&self, ltype: LeaseType) -> Option<Instant> {
        self.expires[ltype.index()]
    }

    fn adopt(&mut self, reply: &LeaseReply, now: Instant) {
        self.mask = reply.granted;
        self.gens = reply.gens;
        self.size = reply.size;
        for ltype in LeaseType::ALL {
            let slot = &mut self.expires[ltype.index()];
            if !reply.granted.contains(ltype) {
                *slot = None;
            } else if !ltype.is_non_expiring() && reply.expire_secs > 0 {
                *slot = Some(now + Duration::from_secs(u64::from(reply.expire_secs)));
            }
        }
    }

    fn forget(&mut self, mask: LeaseMask) {
        self.mask = self.mask.difference(mask);
        for ltype in mask.iter() {
            self.expires[ltype.index()] = None;
        }
    }
}

struct FileLeases {
    /// Held across one lease round trip for the file.
    lock: tokio::sync::Mutex<()>,
    held: Mutex<HeldLeases>,
    /// Bumped on every lease notification for the file.
    wakeups: watch::Sender<u64>,
}

impl FileLeases {
    fn new() -> Self {
        let (wakeups, _) = watch::channel(0);
        Self {
            lock: tokio::sync::Mutex::new(()),
            held: Mutex::new(HeldLeases::default()),
            wakeups,
        }
    }

    fn held(&self) -> MutexGuard<'_, HeldLeases> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.wakeups.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Lease cache for one mount.
pub struct ClientLeases {
    transport: Arc<ClientTransport>,
    files: Mutex<HashMap<FileId, Arc<FileLeases>>>,
    events: Mutex<Option<JoinHandle<()>>>,
    renewal: CancellationToken,
}

impl std::fmt::Debug for ClientLeases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLeases")
            .field("files", &self.lock_files().len())
            .finish_non_exhaustive()
    }
}

impl ClientLeases {
    /// Create the cache, start listening for server callouts and, unless
    /// the renew period is zero, start renewing held leases.
    pub fn new(transport: Arc<ClientTransport>) -> Arc<Self> {
        let rx = transport.subscribe();
        let config = transport.config();
        let period = config.renew_interval;
        let window = config.renew_window();
        let leases = Arc::new(Self {
            transport,
            files: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
            renewal: CancellationToken::new(),
        });
        let handle = tokio::spawn(event_loop(Arc::downgrade(&leases), rx));
        *leases
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        if !period.is_zero() {
            tokio::spawn(renew_loop(
                Arc::downgrade(&leases),
                period,
                window,
                leases.renewal.clone(),
            ));
        }
        leases
    }

    #[inline]
    #[must_use]
    pub fn transport(&self) -> &Arc<ClientTransport> {
        &self.transport
    }

    fn lock_files(&self) -> MutexGuard<'_, HashMap<FileId, Arc<FileLeases>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn file(&self, ino: FileId) -> Arc<FileLeases> {
        Arc::clone(
            self.lock_files()
                .entry(ino)
                .or_insert_with(|| Arc::new(FileLeases::new())),
        )
    }

    /// Snapshot of the leases held on `ino`.
    #[must_use]
    pub fn held(&self, ino: FileId) -> HeldLeases {
        self.lock_files()
            .get(&ino)
            .map(|f| *f.held())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn holds(&self, ino: FileId, ltype: LeaseType) -> bool {
        self.held(ino).holds(ltype)
    }

    /// Lease arguments with this mount's configured interval.
    #[must_use]
    pub fn lease_args(&self, ino: FileId, ltype: LeaseType) -> LeaseArgs {
        LeaseArgs::new(ino, ltype).with_interval(self.transport.config().lease_interval_secs)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Run `op` holding the per-file lock. If the mount freezes for
    /// failover while `op` runs, the lock is dropped, the freeze waited out
    /// and `op` started again.
    pub async fn with_file_locked<T, F, Fut>(&self, ino: FileId, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let file = self.file(ino);
        loop {
            self.transport.wait_unfrozen().await?;
            let guard = file.lock.lock().await;
            match op().await {
                Err(ClientError::Frozen) => {
                    drop(guard);
                    debug!(target: "sfs::client", ino = %ino, "Frozen under file lock, retrying after thaw");
                },
                other => return other,
            }
        }
    }

    async fn lease_call(&self, request: LeaseRequest) -> Result<LeaseReply> {
        let reply = self.transport.send_unfrozen(Request::Lease(request)).await?;
        match reply.as_reply() {
            Some(Reply::Lease(lease)) => Ok(*lease),
            other => Err(ClientError::ProtocolError(format!(
                "lease request answered with {other:?}"
            ))),
        }
    }

    /// Obtain a lease, waiting for conflicting holders to let go.
    ///
    /// A conflicting request is re-issued whenever the server notifies this
    /// client about the file, and at least every reply timeout in case a
    /// notification was lost. Gives up with [`ClientError::LeaseTimeout`]
    /// after the configured lease wait timeout.
    pub async fn acquire_lease(&self, args: LeaseArgs) -> Result<LeaseReply> {
        let file = self.file(args.ino);
        let config = self.transport.config();
        let deadline = Instant::now() + config.lease_wait_timeout;
        let mut timer = None;

        loop {
            let mut wakeups = file.wakeups.subscribe();
            wakeups.borrow_and_update();
            let (gens, frlock_grants) = {
                let held = file.held();
                (held.gens, held.frlock_grants)
            };
            let request = args.with_gens(gens);
            let reply = self
                .with_file_locked(args.ino, || self.lease_call(LeaseRequest::Get(request)))
                .await?;

            if reply.actions.contains(ActionFlags::WAIT_FRLOCK) {
                timer.get_or_insert_with(|| LatencyTimer::new(&LATENCY_LEASE_WAIT));
                return self
                    .await_record_lock(&file, args.ino, reply, frlock_grants, deadline)
                    .await;
            }
            if !reply.actions.contains(ActionFlags::WAIT_LEASE) {
                file.held().adopt(&reply, Instant::now());
                return Ok(reply);
            }

            timer.get_or_insert_with(|| LatencyTimer::new(&LATENCY_LEASE_WAIT));
            let now = Instant::now();
            if now >= deadline {
                return Err(self.withdraw(&file, args.ino, args.ltype).await);
            }
            debug!(target: "sfs::client", ino = %args.ino, ltype = %args.ltype, "Waiting for lease");
            let recheck = deadline.min(now + config.transport.reply_timeout);
            let _ = tokio::time::timeout_at(recheck, wakeups.changed()).await;
        }
    }

    async fn await_record_lock(
        &self,
        file: &FileLeases,
        ino: FileId,
        mut reply: LeaseReply,
        grants_before: u64,
        deadline: Instant,
    ) -> Result<LeaseReply> {
        let mut wakeups = file.wakeups.subscribe();
        loop {
            if file.held().frlock_grants != grants_before {
                reply.actions = reply.actions.difference(ActionFlags::WAIT_FRLOCK);
                reply.granted |= LeaseMask::FRLOCK;
                return Ok(reply);
            }
            if tokio::time::timeout_at(deadline, wakeups.changed())
                .await
                .is_err()
            {
                return Err(self.withdraw(file, ino, LeaseType::FileRecordLock).await);
            }
        }
    }

    /// Take back a request that waited too long so the server stops
    /// counting this client as a waiter on `ino`. Bits already held are
    /// left alone.
    async fn withdraw(&self, file: &FileLeases, ino: FileId, ltype: LeaseType) -> ClientError {
        let mask = ltype.mask().difference(file.held().mask);
        if !mask.is_empty() {
            let args = self.lease_args(ino, ltype).with_mask(mask);
            let withdrawn = self
                .with_file_locked(ino, || self.lease_call(LeaseRequest::Remove(args)))
                .await;
            if let Err(e) = withdrawn {
                warn!(target: "sfs::client", ino = %ino, ltype = %ltype, error = %e, "Failed to withdraw lease request");
            }
        }
        debug!(target: "sfs::client", ino = %ino, ltype = %ltype, "Lease wait timed out");
        ClientError::LeaseTimeout(ino)
    }

    /// Take or drop a byte-range lock. A blocking lock returns once the
    /// server reports it granted.
    pub async fn lock_record(&self, ino: FileId, lock: RecordLock) -> Result<LeaseReply> {
        self.acquire_lease(self.lease_args(ino, LeaseType::FileRecordLock).with_lock(lock))
            .await
    }

    /// Give up leases voluntarily.
    pub async fn release_lease(&self, ino: FileId, mask: LeaseMask) -> Result<LeaseReply> {
        let Some(ltype) = mask.iter().next() else {
            return Ok(LeaseReply::default());
        };
        let file = self.file(ino);
        let args = self.lease_args(ino, ltype).with_mask(mask);
        let reply = self
            .with_file_locked(ino, || {
                let args = args.with_gens(file.held().gens);
                self.lease_call(LeaseRequest::Remove(args))
            })
            .await?;
        file.held().forget(mask);
        Ok(reply)
    }

    /// Refresh one held lease. A refused extension drops the lease so
    /// waiters on other clients can proceed.
    pub async fn extend_lease(&self, ino: FileId, ltype: LeaseType) -> Result<LeaseReply> {
        let file = self.file(ino);
        let args = self.lease_args(ino, ltype);
        let result = self
            .with_file_locked(ino, || {
                let args = args.with_gens(file.held().gens);
                self.lease_call(LeaseRequest::Extend(args))
            })
            .await;
        match result {
            Ok(reply) => {
                file.held().adopt(&reply, Instant::now());
                Ok(reply)
            },
            Err(ClientError::Remote(ErrorCode::CANCELED)) => {
                debug!(target: "sfs::client", ino = %ino, ltype = %ltype, "Extension refused, releasing");
                self.release_lease(ino, ltype.mask()).await?;
                Err(ClientError::Remote(ErrorCode::CANCELED))
            },
            Err(e) => Err(e),
        }
    }

    /// Extend every held lease that expires within `window`. Returns how
    /// many were extended.
    pub async fn renew_expiring(&self, window: Duration) -> usize {
        let horizon = Instant::now() + window;
        let due: Vec<(FileId, LeaseType)> = self
            .lock_files()
            .iter()
            .flat_map(|(ino, file)| {
                let held = *file.held();
                held.mask
                    .iter()
                    .filter(move |t| held.expires_at(*t).is_some_and(|at| at <= horizon))
                    .map(move |t| (*ino, t))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut renewed = 0;
        for (ino, ltype) in due {
            match self.extend_lease(ino, ltype).await {
                Ok(_) => renewed += 1,
                Err(e) => debug!(target: "sfs::client", ino = %ino, ltype = %ltype, error = %e, "Lease not renewed"),
            }
        }
        renewed
    }

    /// Answer a relinquish callout with the generations this client holds.
    async fn relinquish(&self, ino: FileId, mask: LeaseMask) -> Result<()> {
        let file = self.file(ino);
        let reply = self
            .with_file_locked(ino, || {
                let held = *file.held();
                let mask = mask & held.mask;
                async move {
                    let Some(ltype) = mask.iter().next() else {
                        return Ok(None);
                    };
                    let args = self
                        .lease_args(ino, ltype)
                        .with_mask(mask)
                        .with_gens(held.gens);
                    self.lease_call(LeaseRequest::Relinquish(args)).await.map(Some)
                }
            })
            .await?;
        if let Some(reply) = reply {
            let mut held = file.held();
            held.forget(mask.difference(reply.granted));
            debug!(target: "sfs::client", ino = %ino, mask = %mask, remaining = %held.mask, "Leases relinquished");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Failover
    // -----------------------------------------------------------------------

    /// Move this mount to a new server: freeze, reconnect through
    /// `connector` and re-establish every held lease.
    pub async fn fail_over(&self, connector: Connector) -> Result<()> {
        self.transport.begin_failover(connector).await;
        self.resync().await
    }

    /// Re-introduce this client and replay its leases with their
    /// generations. Record locks are not carried over; they are dropped
    /// locally.
    pub async fn resync(&self) -> Result<()> {
        let mount = Arc::clone(self.transport.mount_state());
        self.transport.introduce().await?;
        mount.begin_resync();

        let files: Vec<(FileId, Arc<FileLeases>)> = self
            .lock_files()
            .iter()
            .map(|(ino, file)| (*ino, Arc::clone(file)))
            .collect();
        let mut restored = 0usize;
        for (ino, file) in files {
            let held = {
                let mut held = file.held();
                held.forget(LeaseMask::FRLOCK);
                *held
            };
            let Some(ltype) = held.mask.iter().next() else {
                continue;
            };
            let args = self
                .lease_args(ino, ltype)
                .with_mask(held.mask)
                .with_gens(held.gens);
            match self.lease_call(LeaseRequest::Reset(args)).await {
                Ok(reply) => {
                    file.held().adopt(&reply, Instant::now());
                    restored += 1;
                },
                Err(ClientError::Remote(ErrorCode::STALE)) => {
                    warn!(target: "sfs::client", ino = %ino, mask = %held.mask, "Lease superseded during failover");
                    file.held().forget(held.mask);
                },
                Err(e) => return Err(e),
            }
        }

        self.transport
            .send(Request::Mount(MountRequest::Resync), WaitMode::Wait)
            .await?;
        mount.finish_resync();
        info!(target: "sfs::client", files = restored, "Leases re-established");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Server messages
    // -----------------------------------------------------------------------

    fn on_server_request(self: &Arc<Self>, request: Request) {
        match request {
            Request::Callout(Callout::RelinquishLease { ino, mask }) => {
                let leases = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = leases.relinquish(ino, mask).await {
                        warn!(target: "sfs::client", ino = %ino, mask = %mask, error = %e, "Relinquish failed");
                    }
                });
            },
            Request::Callout(Callout::Action { ino, actions }) => {
                debug!(target: "sfs::client", ino = %ino, actions = %actions, "Cache action");
            },
            Request::Callout(Callout::Stage { ino }) => {
                debug!(target: "sfs::client", ino = %ino, "Stage requested");
            },
            Request::Notify(Notify::Lease { ino, mask }) => {
                let file = self.file(ino);
                if mask.contains(LeaseType::FileRecordLock) {
                    let mut held = file.held();
                    held.mask |= LeaseMask::FRLOCK;
                    held.frlock_grants = held.frlock_grants.wrapping_add(1);
                }
                file.wake();
            },
            Request::Notify(Notify::LeaseExpire { ino, mask }) => {
                let file = self.file(ino);
                file.held().forget(mask);
                file.wake();
                info!(target: "sfs::client", ino = %ino, mask = %mask, "Lease expired on server");
            },
            Request::Notify(Notify::Dnlc { parent, name }) => {
                debug!(target: "sfs::client", parent = %parent, name = %name, "Name cache entry stale");
            },
            Request::Notify(Notify::GetIno { ino }) => {
                debug!(target: "sfs::client", ino = %ino, "Inode refresh requested");
            },
            Request::Notify(Notify::Panic { ord }) => {
                warn!(target: "sfs::client", ord, "Peer reported a filesystem panic");
            },
            other => {
                debug!(target: "sfs::client", request = ?other, "Unhandled server request");
            },
        }
    }
}

impl Drop for ClientLeases {
    fn drop(&mut self) {
        self.renewal.cancel();
        if let Some(handle) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn event_loop(leases: Weak<ClientLeases>, mut rx: broadcast::Receiver<Request>) {
    loop {
        let request = match rx.recv().await {
            Ok(request) => request,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(target: "sfs::client", missed, "Server messages dropped");
                continue;
            },
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(leases) = leases.upgrade() else {
            return;
        };
        leases.on_server_request(request);
    }
}

/// Extend leases nearing expiry every `period` until cancelled or the
/// cache is gone.
async fn renew_loop(
    leases: Weak<ClientLeases>,
    period: Duration,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }
        let Some(leases) = leases.upgrade() else {
            return;
        };
        let renewed = leases.renew_expiring(window).await;
        if renewed > 0 {
            debug!(target: "sfs::client", renewed, "Leases renewed");
        }
    }
}
