#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod latency;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

pub use latency::{
    LATENCY_LEASE_WAIT, LATENCY_REQUEST, LatencyHistogram, LatencySnapshot, LatencyTimer,
};

// Transport
pub static MESSAGES_SENT: AtomicU64 = AtomicU64::new(0);
pub static MESSAGES_RECEIVED: AtomicU64 = AtomicU64::new(0);
pub static RETRANSMITS: AtomicU64 = AtomicU64::new(0);
pub static DUPLICATE_REPLAYS: AtomicU64 = AtomicU64::new(0);
pub static STALE_DROPS: AtomicU64 = AtomicU64::new(0);
pub static CRC_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static CONNECTIONS_ACTIVE: AtomicU64 = AtomicU64::new(0);

// Leases
pub static LEASES_GRANTED: AtomicU64 = AtomicU64::new(0);
pub static LEASE_WAITS: AtomicU64 = AtomicU64::new(0);
pub static LEASES_REMOVED: AtomicU64 = AtomicU64::new(0);
pub static LEASE_EXPIRATIONS: AtomicU64 = AtomicU64::new(0);
pub static CALLOUTS_SENT: AtomicU64 = AtomicU64::new(0);
pub static TABLES_ACTIVE: AtomicU64 = AtomicU64::new(0);

// Failover
pub static FAILOVERS: AtomicU64 = AtomicU64::new(0);
pub static RESYNCS: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn increment_messages_sent() {
    MESSAGES_SENT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_messages_received() {
    MESSAGES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_retransmits() {
    RETRANSMITS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_duplicate_replays() {
    DUPLICATE_REPLAYS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_stale_drops() {
    STALE_DROPS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_crc_failures() {
    CRC_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_connections() {
    CONNECTIONS_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn decrement_connections() {
    CONNECTIONS_ACTIVE.fetch_sub(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_leases_granted() {
    LEASES_GRANTED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_lease_waits() {
    LEASE_WAITS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_leases_removed() {
    LEASES_REMOVED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_lease_expirations() {
    LEASE_EXPIRATIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_callouts() {
    CALLOUTS_SENT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_tables() {
    TABLES_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn decrement_tables() {
    TABLES_ACTIVE.fetch_sub(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_failovers() {
    FAILOVERS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_resyncs() {
    RESYNCS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub retransmits: u64,
    pub duplicate_replays: u64,
    pub stale_drops: u64,
    pub crc_failures: u64,
    pub connections_active: u64,
    pub leases_granted: u64,
    pub lease_waits: u64,
    pub leases_removed: u64,
    pub lease_expirations: u64,
    pub callouts_sent: u64,
    pub tables_active: u64,
    pub failovers: u64,
    pub resyncs: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            messages_sent: MESSAGES_SENT.load(Ordering::Relaxed),
            messages_received: MESSAGES_RECEIVED.load(Ordering::Relaxed),
            retransmits: RETRANSMITS.load(Ordering::Relaxed),
            duplicate_replays: DUPLICATE_REPLAYS.load(Ordering::Relaxed),
            stale_drops: STALE_DROPS.load(Ordering::Relaxed),
            crc_failures: CRC_FAILURES.load(Ordering::Relaxed),
            connections_active: CONNECTIONS_ACTIVE.load(Ordering::Relaxed),
            leases_granted: LEASES_GRANTED.load(Ordering::Relaxed),
            lease_waits: LEASE_WAITS.load(Ordering::Relaxed),
            leases_removed: LEASES_REMOVED.load(Ordering::Relaxed),
            lease_expirations: LEASE_EXPIRATIONS.load(Ordering::Relaxed),
            callouts_sent: CALLOUTS_SENT.load(Ordering::Relaxed),
            tables_active: TABLES_ACTIVE.load(Ordering::Relaxed),
            failovers: FAILOVERS.load(Ordering::Relaxed),
            resyncs: RESYNCS.load(Ordering::Relaxed),
        }
    }
}

pub fn init_prometheus_exporter(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    metrics::describe_counter!("sfs_messages_sent_total", "Protocol messages sent");
    metrics::describe_counter!("sfs_messages_received_total", "Protocol messages received");
    metrics::describe_counter!("sfs_retransmits_total", "Client retransmissions");
    metrics::describe_counter!(
        "sfs_duplicate_replays_total",
        "Duplicate requests answered from the reply cache"
    );
    metrics::describe_counter!(
        "sfs_stale_drops_total",
        "Retransmissions dropped behind the acknowledged floor"
    );
    metrics::describe_counter!("sfs_crc_failures_total", "Payload CRC mismatches");
    metrics::describe_gauge!("sfs_connections_active", "Open client connections");
    metrics::describe_counter!("sfs_leases_granted_total", "Lease grants");
    metrics::describe_counter!("sfs_lease_waits_total", "Lease requests told to wait");
    metrics::describe_counter!("sfs_leases_removed_total", "Lease removals");
    metrics::describe_counter!("sfs_lease_expirations_total", "Leases reclaimed on expiry");
    metrics::describe_counter!("sfs_callouts_total", "Relinquish callouts sent");
    metrics::describe_gauge!("sfs_lease_tables_active", "Files with a live lease table");
    metrics::describe_counter!("sfs_failovers_total", "Failovers observed");
    metrics::describe_counter!("sfs_resyncs_total", "Lease resyncs completed");

    Ok(())
}

#[allow(clippy::cast_precision_loss)]
pub fn export_to_prometheus() {
    let s = MetricsSnapshot::capture();

    metrics::counter!("sfs_messages_sent_total").absolute(s.messages_sent);
    metrics::counter!("sfs_messages_received_total").absolute(s.messages_received);
    metrics::counter!("sfs_retransmits_total").absolute(s.retransmits);
    metrics::counter!("sfs_duplicate_replays_total").absolute(s.duplicate_replays);
    metrics::counter!("sfs_stale_drops_total").absolute(s.stale_drops);
    metrics::counter!("sfs_crc_failures_total").absolute(s.crc_failures);
    metrics::gauge!("sfs_connections_active").set(s.connections_active as f64);
    metrics::counter!("sfs_leases_granted_total").absolute(s.leases_granted);
    metrics::counter!("sfs_lease_waits_total").absolute(s.lease_waits);
    metrics::counter!("sfs_leases_removed_total").absolute(s.leases_removed);
    metrics::counter!("sfs_lease_expirations_total").absolute(s.lease_expirations);
    metrics::counter!("sfs_callouts_total").absolute(s.callouts_sent);
    metrics::gauge!("sfs_lease_tables_active").set(s.tables_active as f64);
    metrics::counter!("sfs_failovers_total").absolute(s.failovers);
    metrics::counter!("sfs_resyncs_total").absolute(s.resyncs);

    export_latency("sfs_request_latency", &LATENCY_REQUEST.snapshot());
    export_latency("sfs_lease_wait_latency", &LATENCY_LEASE_WAIT.snapshot());
}

#[allow(clippy::cast_precision_loss)]
fn export_latency(prefix: &str, snap: &LatencySnapshot) {
    metrics::gauge!(format!("{prefix}_p50_seconds")).set(snap.percentile(50) as f64 / 1e6);
    metrics::gauge!(format!("{prefix}_p99_seconds")).set(snap.percentile(99) as f64 / 1e6);
    metrics::gauge!(format!("{prefix}_avg_seconds")).set(snap.avg_us() / 1e6);
    metrics::gauge!(format!("{prefix}_count")).set(snap.count as f64);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let before = MetricsSnapshot::capture();
        increment_leases_granted();
        increment_retransmits();
        let after = MetricsSnapshot::capture();
        assert!(after.leases_granted > before.leases_granted);
        assert!(after.retransmits > before.retransmits);
    }
}
