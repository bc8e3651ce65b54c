//! Per-mount status and the failover/resync coordinator.
//!
//! One [`MountState`] exists per mounted filesystem instance and is shared
//! by reference between the transport, the lease code and the server role.
//!
//! Phases:
//! ```text
//! Normal ──► Failover ──► Resyncing ──► Normal
//!   │           │             │
//!   └───────────┴─────────────┴──► ServerDown ──(server responding)──► previous phase
//! ```
//!
//! While `FAILOVER` or `FROZEN` is set, client requests wait in
//! [`MountState::wait_for_failover`]. A `HARD_LOCK` outage alone does not
//! hold them. Clearing the flags wakes every waiter at once. On the server
//! side `FROZEN` marks a node handing off the server role; it drops
//! everything it receives until it takes the role again.

use sfs_core::{MountStatus, NO_SERVER, Result, ShareError};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

/// Flags that only a completed failover clears.
const FAILOVER_FLAGS: MountStatus = MountStatus::FAILOVER.union(MountStatus::FROZEN);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverPhase {
    Normal,
    Failover,
    Resyncing,
    ServerDown,
}

impl fmt::Display for FailoverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Failover => write!(f, "FAILOVER"),
            Self::Resyncing => write!(f, "RESYNCING"),
            Self::ServerDown => write!(f, "SERVER_DOWN"),
        }
    }
}

pub struct MountState {
    fs_name: String,
    status: watch::Sender<MountStatus>,
    server_ord: AtomicU32,
    client_ord: AtomicU32,
    fsid: AtomicU32,
    fs_generation: AtomicU32,
}

impl MountState {
    #[must_use]
    pub fn new(fs_name: impl Into<String>) -> Self {
        let (status, _) = watch::channel(MountStatus::EMPTY);
        Self {
            fs_name: fs_name.into(),
            status,
            server_ord: AtomicU32::new(NO_SERVER),
            client_ord: AtomicU32::new(0),
            fsid: AtomicU32::new(0),
            fs_generation: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn fs_name(&self) -> &str {
        &self.fs_name
    }

    #[must_use]
    pub fn status(&self) -> MountStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn phase(&self) -> FailoverPhase {
        let status = self.status();
        if status.contains(MountStatus::SERVER_DOWN) {
            FailoverPhase::ServerDown
        } else if status.contains(MountStatus::FAILOVER) {
            FailoverPhase::Failover
        } else if status.contains(MountStatus::RESYNCING) {
            FailoverPhase::Resyncing
        } else {
            FailoverPhase::Normal
        }
    }

    fn update(&self, set: MountStatus, clear: MountStatus) -> MountStatus {
        let mut after = MountStatus::EMPTY;
        self.status.send_modify(|status| {
            status.remove(clear);
            status.insert(set);
            after = *status;
        });
        after
    }

    pub fn set_mounted(&self) {
        self.update(MountStatus::MOUNTED, MountStatus::EMPTY);
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.status().contains(MountStatus::MOUNTED)
    }

    /// Take or give up the server role for this filesystem.
    pub fn set_server(&self, server: bool) {
        if server {
            self.update(MountStatus::SERVER, MountStatus::EMPTY);
        } else {
            self.update(MountStatus::EMPTY, MountStatus::SERVER);
        }
    }

    #[must_use]
    pub fn is_server(&self) -> bool {
        self.status().contains(MountStatus::SERVER)
    }

    /// Frozen for failover, as opposed to a plain server outage.
    #[must_use]
    pub fn in_failover(&self) -> bool {
        self.status().intersects(FAILOVER_FLAGS)
    }

    #[must_use]
    pub fn is_resyncing(&self) -> bool {
        self.status().contains(MountStatus::RESYNCING)
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// The server was lost or is being taken over.
    pub fn begin_failover(&self) {
        let status = self.update(MountStatus::FAILOVER, MountStatus::EMPTY);
        sfs_metrics::increment_failovers();
        warn!(target: "sfs::failover", fs = %self.fs_name, status = %status, "Failover started");
    }

    /// A new server is active; leases are being re-established.
    pub fn begin_resync(&self) {
        let status = self.update(
            MountStatus::RESYNCING,
            MountStatus::FAILOVER | MountStatus::FROZEN,
        );
        info!(target: "sfs::failover", fs = %self.fs_name, status = %status, "Resync started");
    }

    pub fn finish_resync(&self) {
        let status = self.update(MountStatus::EMPTY, MountStatus::RESYNCING);
        sfs_metrics::increment_resyncs();
        info!(target: "sfs::failover", fs = %self.fs_name, status = %status, "Resync complete");
    }

    /// Server-side hold: incoming messages are dropped until thawed.
    pub fn freeze(&self) {
        let status = self.update(MountStatus::FROZEN, MountStatus::EMPTY);
        info!(target: "sfs::failover", fs = %self.fs_name, status = %status, "Frozen");
    }

    pub fn thaw(&self) {
        if self.status().contains(MountStatus::FROZEN) {
            let status = self.update(MountStatus::EMPTY, MountStatus::FROZEN);
            info!(target: "sfs::failover", fs = %self.fs_name, status = %status, "Thawed");
        }
    }

    /// The server stopped answering. Ignored while a failover or resync is
    /// already in progress.
    pub fn server_down(&self) {
        if self
            .status()
            .intersects(MountStatus::FAILOVER | MountStatus::RESYNCING)
        {
            return;
        }
        let before = self.status();
        let status = self.update(
            MountStatus::SERVER_DOWN | MountStatus::HARD_LOCK,
            MountStatus::EMPTY,
        );
        if !before.contains(MountStatus::SERVER_DOWN) {
            warn!(target: "sfs::failover", fs = %self.fs_name, status = %status, phase = %self.phase(), "Server not responding");
        }
    }

    /// The server answered; clears the outage and wakes frozen waiters.
    pub fn server_responding(&self) {
        if !self
            .status()
            .intersects(MountStatus::SERVER_DOWN | MountStatus::HARD_LOCK)
        {
            return;
        }
        let status = self.update(
            MountStatus::EMPTY,
            MountStatus::SERVER_DOWN | MountStatus::HARD_LOCK,
        );
        info!(target: "sfs::failover", fs = %self.fs_name, status = %status, phase = %self.phase(), "Server responding");
    }

    /// Return once the failover freeze is lifted, ignoring a server outage.
    pub async fn wait_for_failover(&self, deadline: Instant) -> Result<()> {
        let mut rx = self.status.subscribe();
        match timeout_at(deadline, rx.wait_for(|s| !s.intersects(FAILOVER_FLAGS))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ShareError::Interrupted),
            Err(_) => Err(ShareError::Timeout("failover to complete")),
        }
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn server_ord(&self) -> u32 {
        self.server_ord.load(Ordering::Acquire)
    }

    pub fn set_server_ord(&self, ord: u32) {
        self.server_ord.store(ord, Ordering::Release);
    }

    #[must_use]
    pub fn client_ord(&self) -> u32 {
        self.client_ord.load(Ordering::Acquire)
    }

    pub fn set_client_ord(&self, ord: u32) {
        self.client_ord.store(ord, Ordering::Release);
    }

    #[must_use]
    pub fn fsid(&self) -> u32 {
        self.fsid.load(Ordering::Acquire)
    }

    pub fn set_fsid(&self, fsid: u32) {
        self.fsid.store(fsid, Ordering::Release);
    }

    #[must_use]
    pub fn fs_generation(&self) -> u32 {
        self.fs_generation.load(Ordering::Acquire)
    }

    pub fn set_fs_generation(&self, generation: u32) {
        self.fs_generation.store(generation, Ordering::Release);
    }

    /// Advance the filesystem generation; returns the new value.
    pub fn bump_fs_generation(&self) -> u32 {
        self.fs_generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

impl fmt::Debug for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountState")
            .field("fs_name", &self.fs_name)
            .field("status", &self.status())
            .field("server_ord", &self.server_ord())
            .field("client_ord", &self.client_ord())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_phase_transitions() {
        let mount = MountState::new("sfs0");
        mount.set_mounted();
        assert_eq!(mount.phase(), FailoverPhase::Normal);
        mount.begin_failover();
        assert_eq!(mount.phase(), FailoverPhase::Failover);
        assert!(mount.in_failover());
        mount.begin_resync();
        assert_eq!(mount.phase(), FailoverPhase::Resyncing);
        assert!(!mount.in_failover());
        mount.finish_resync();
        assert_eq!(mount.phase(), FailoverPhase::Normal);
        assert!(mount.is_mounted());
    }

    #[test]
    fn test_server_down_ignored_during_failover() {
        let mount = MountState::new("sfs0");
        mount.begin_failover();
        mount.server_down();
        assert!(!mount.status().contains(MountStatus::SERVER_DOWN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_wakes_failover_waiters() {
        let mount = Arc::new(MountState::new("sfs0"));
        mount.begin_failover();

        let waiter = {
            let mount = Arc::clone(&mount);
            tokio::spawn(async move {
                mount
                    .wait_for_failover(Instant::now() + Duration::from_secs(60))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        mount.begin_resync();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn test_server_responding_ends_outage() {
        let mount = MountState::new("sfs0");
        mount.server_down();
        assert_eq!(mount.phase(), FailoverPhase::ServerDown);
        mount.server_responding();
        assert_eq!(mount.phase(), FailoverPhase::Normal);
        assert!(!mount.status().intersects(MountStatus::SERVER_DOWN | MountStatus::HARD_LOCK));
    }

    #[test]
    fn test_thaw_only_clears_frozen() {
        let mount = MountState::new("sfs0");
        mount.set_server(true);
        mount.freeze();
        assert!(mount.in_failover());
        mount.thaw();
        assert!(!mount.in_failover());
        assert!(mount.is_server());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_is_not_a_failover() {
        let mount = MountState::new("sfs0");
        mount.server_down();
        assert!(mount.status().contains(MountStatus::HARD_LOCK));
        assert!(!mount.in_failover());
        mount
            .wait_for_failover(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_wait_times_out() {
        let mount = MountState::new("sfs0");
        mount.begin_failover();
        let result = mount
            .wait_for_failover(Instant::now() + Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ShareError::Timeout(_))));
    }

    #[test]
    fn test_fs_generation_bump() {
        let mount = MountState::new("sfs0");
        mount.set_fs_generation(4);
        assert_eq!(mount.bump_fs_generation(), 5);
        assert_eq!(mount.fs_generation(), 5);
    }
}
