//! Server-side per-client state: registration, liveness and the outstanding
//! message queue that gives at-most-once execution.

use sfs_core::{ClientOrd, ErrorCode, Seqno};
use sfs_network::{Command, Message, MessageHeader};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Processing,
    /// Done; the cached reply is kept until the client acknowledges it.
    WaitingForAck,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing => write!(f, "PROCESSING"),
            Self::WaitingForAck => write!(f, "WAITING_FOR_ACK"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutstandingEntry {
    pub seqno: Seqno,
    pub command: Command,
    pub operation: u16,
    pub state: EntryState,
    pub cached: Option<Message>,
}

/// Messages from one client that are executing or awaiting acknowledgment.
#[derive(Debug, Default)]
pub struct OutstandingQueue {
    entries: Vec<OutstandingEntry>,
}

impl OutstandingQueue {
    #[must_use]
    pub fn find(&self, seqno: Seqno) -> Option<&OutstandingEntry> {
        self.entries.iter().find(|e| e.seqno == seqno)
    }

    pub fn begin(&mut self, header: &MessageHeader) {
        self.entries.push(OutstandingEntry {
            seqno: header.seqno,
            command: header.command,
            operation: header.operation,
            state: EntryState::Processing,
            cached: None,
        });
    }

    /// Finish `seqno`. With a reply to cache the entry moves to
    /// `WaitingForAck`, otherwise it is freed.
    pub fn complete(&mut self, seqno: Seqno, cached: Option<Message>) {
        let Some(pos) = self.entries.iter().position(|e| e.seqno == seqno) else {
            return;
        };
        match cached {
            Some(reply) => {
                let entry = &mut self.entries[pos];
                entry.state = EntryState::WaitingForAck;
                entry.cached = Some(reply);
            },
            None => {
                self.entries.swap_remove(pos);
            },
        }
    }

    /// Free acknowledged entries older than `floor`. Returns how many.
    pub fn prune_below(&mut self, floor: Seqno) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.state == EntryState::Processing || !e.seqno.is_earlier_than(floor));
        before - self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct ClientEntry {
    pub ord: ClientOrd,
    pub host: String,
    pub responding: bool,
    /// Evicted; everything it sends is dropped.
    pub off: bool,
    /// Acknowledged floor. Blocking messages behind it are stale.
    pub min_acked: Seqno,
    /// Re-established its leases after the last failover.
    pub resynced: bool,
    pub queue: OutstandingQueue,
}

impl ClientEntry {
    fn new(ord: ClientOrd, host: String) -> Self {
        Self {
            ord,
            host,
            responding: true,
            off: false,
            min_acked: Seqno::NONE,
            resynced: true,
            queue: OutstandingQueue::default(),
        }
    }
}

/// What to do with an incoming request.
#[derive(Debug)]
pub enum Admission {
    Process,
    /// Completed earlier; send this reply again without re-executing.
    Replay(Message),
    Drop(&'static str),
    Reject(ErrorCode),
}

#[derive(Debug, Default)]
struct Inner {
    clients: HashMap<ClientOrd, ClientEntry>,
    last_ord: ClientOrd,
}

/// Every client known to this server.
#[derive(Debug, Default)]
pub struct ClientTable {
    inner: Mutex<Inner>,
}

impl ClientTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a mounting client. A host that mounted before keeps its
    /// ordinal but starts over with an empty outstanding queue and ack
    /// floor.
    pub fn register(&self, host: &str) -> ClientOrd {
        let mut inner = self.lock();
        if let Some(entry) = inner.clients.values_mut().find(|e| e.host == host) {
            // A re-introduced client starts a new sequence space.
            entry.responding = true;
            entry.off = false;
            entry.min_acked = Seqno::NONE;
            entry.queue = OutstandingQueue::default();
            info!(target: "sfs::server", client = entry.ord, host, "Client re-registered");
            return entry.ord;
        }
        inner.last_ord += 1;
        let ord = inner.last_ord;
        inner.clients.insert(ord, ClientEntry::new(ord, host.to_string()));
        info!(target: "sfs::server", client = ord, host, "Client registered");
        ord
    }

    /// Decide whether a request from `header.client_ord` is executed,
    /// replayed, dropped or rejected. Admitted requests are recorded as
    /// `Processing` and must be finished with [`ClientTable::complete`].
    pub fn admit(&self, header: &MessageHeader, fs_generation: u32) -> Admission {
        let mut inner = self.lock();
        let Some(entry) = inner.clients.get_mut(&header.client_ord) else {
            return Admission::Reject(ErrorCode::MOUNT_OUT_OF_SYNC);
        };
        if entry.off {
            return Admission::Drop("client marked off");
        }
        if !entry.responding {
            if header.fs_generation != fs_generation {
                return Admission::Reject(ErrorCode::STALE);
            }
            entry.responding = true;
        }

        if header.reset_seqno {
            entry.min_acked = header.ack;
            let freed = entry.queue.prune_below(header.ack);
            debug!(target: "sfs::server", client = entry.ord, ack = %header.ack, freed, "Seqno reset");
        } else if header.ack.is_later_than(entry.min_acked) {
            entry.min_acked = header.ack;
            entry.queue.prune_below(header.ack);
        }

        if header.seqno.is_none() {
            return Admission::Process;
        }

        if header.wait_mode.blocks()
            && !entry.min_acked.is_none()
            && header.seqno.is_earlier_than(entry.min_acked)
        {
            sfs_metrics::increment_stale_drops();
            return Admission::Drop("stale retransmission");
        }

        if let Some(existing) = entry.queue.find(header.seqno) {
            return match (existing.state, &existing.cached) {
                (EntryState::WaitingForAck, Some(reply)) => {
                    sfs_metrics::increment_duplicate_replays();
                    Admission::Replay(reply.clone())
                },
                _ => Admission::Drop("duplicate in progress"),
            };
        }

        entry.queue.begin(header);
        Admission::Process
    }

    pub fn complete(&self, ord: ClientOrd, seqno: Seqno, cached: Option<Message>) {
        if seqno.is_none() {
            return;
        }
        if let Some(entry) = self.lock().clients.get_mut(&ord) {
            entry.queue.complete(seqno, cached);
        }
    }

    pub fn contains(&self, ord: ClientOrd) -> bool {
        self.lock().clients.contains_key(&ord)
    }

    pub fn mark_off(&self, ord: ClientOrd) {
        if let Some(entry) = self.lock().clients.get_mut(&ord) {
            entry.off = true;
            entry.queue = OutstandingQueue::default();
        }
    }

    pub fn set_responding(&self, ord: ClientOrd, responding: bool) {
        if let Some(entry) = self.lock().clients.get_mut(&ord) {
            entry.responding = responding;
        }
    }

    #[must_use]
    pub fn is_responding(&self, ord: ClientOrd) -> bool {
        self.lock().clients.get(&ord).is_some_and(|e| e.responding)
    }

    /// Start a failover round: every live client must resync again.
    pub fn begin_resync(&self) {
        for entry in self.lock().clients.values_mut().filter(|e| !e.off) {
            entry.resynced = false;
        }
    }

    pub fn set_resynced(&self, ord: ClientOrd, resynced: bool) {
        if let Some(entry) = self.lock().clients.get_mut(&ord) {
            entry.resynced = resynced;
        }
    }

    /// Every live, responding client has re-established its leases.
    #[must_use]
    pub fn all_resynced(&self) -> bool {
        self.lock()
            .clients
            .values()
            .filter(|e| !e.off && e.responding)
            .all(|e| e.resynced)
    }

    #[must_use]
    pub fn queue_len(&self, ord: ClientOrd) -> usize {
        self.lock().clients.get(&ord).map_or(0, |e| e.queue.len())
    }

    #[must_use]
    pub fn min_acked(&self, ord: ClientOrd) -> Option<Seqno> {
        self.lock().clients.get(&ord).map(|e| e.min_acked)
    }

    #[must_use]
    pub fn ords(&self) -> Vec<ClientOrd> {
        let mut ords: Vec<_> = self.lock().clients.keys().copied().collect();
        ords.sort_unstable();
        ords
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().clients.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sfs_core::{FileId, LeaseType, WaitMode};
    use sfs_network::{LeaseArgs, LeaseReply, LeaseRequest, Reply, Request};

    fn get_header(ord: ClientOrd, seqno: u32, ack: u32) -> MessageHeader {
        let request = Request::Lease(LeaseRequest::Get(LeaseArgs::new(FileId(7), LeaseType::Read)));
        let mut header = Message::request(request, WaitMode::Wait).header;
        header.client_ord = ord;
        header.seqno = Seqno::new(seqno);
        header.ack = Seqno::new(ack);
        header
    }

    fn lease_reply(header: &MessageHeader) -> Message {
        Message::reply(header, ErrorCode::OK, Reply::Lease(LeaseReply::default()))
    }

    #[test]
    fn test_unknown_client_out_of_sync() {
        let table = ClientTable::new();
        let admission = table.admit(&get_header(9, 1, 1), 0);
        assert!(matches!(admission, Admission::Reject(ErrorCode::MOUNT_OUT_OF_SYNC)));
    }

    #[test]
    fn test_register_reuses_ordinal_for_host() {
        let table = ClientTable::new();
        let a = table.register("alpha");
        let b = table.register("beta");
        assert_ne!(a, b);
        assert_eq!(table.register("alpha"), a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_completed_get_replayed_not_reexecuted() {
        let table = ClientTable::new();
        let ord = table.register("alpha");
        let header = get_header(ord, 5, 5);

        assert!(matches!(table.admit(&header, 0), Admission::Process));
        // Retransmitted while still executing.
        assert!(matches!(table.admit(&header, 0), Admission::Drop(_)));

        let reply = lease_reply(&header);
        table.complete(ord, header.seqno, Some(reply.clone()));
        match table.admit(&header, 0) {
            Admission::Replay(cached) => assert_eq!(cached, reply),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn test_uncached_entry_freed() {
        let table = ClientTable::new();
        let ord = table.register("alpha");
        let header = get_header(ord, 3, 3);
        assert!(matches!(table.admit(&header, 0), Admission::Process));
        assert_eq!(table.queue_len(ord), 1);
        table.complete(ord, header.seqno, None);
        assert_eq!(table.queue_len(ord), 0);
    }

    #[test]
    fn test_ack_prunes_and_stale_dropped() {
        let table = ClientTable::new();
        let ord = table.register("alpha");
        for seqno in 1..=3 {
            let header = get_header(ord, seqno, 1);
            assert!(matches!(table.admit(&header, 0), Admission::Process));
            table.complete(ord, header.seqno, Some(lease_reply(&header)));
        }
        assert_eq!(table.queue_len(ord), 3);

        // Client's lowest outstanding is now 4.
        let header = get_header(ord, 4, 4);
        assert!(matches!(table.admit(&header, 0), Admission::Process));
        assert_eq!(table.queue_len(ord), 1);
        assert_eq!(table.min_acked(ord), Some(Seqno::new(4)));

        let stale = get_header(ord, 2, 4);
        assert!(matches!(table.admit(&stale, 0), Admission::Drop("stale retransmission")));
    }

    #[test]
    fn test_reintroduction_starts_new_sequence() {
        let table = ClientTable::new();
        let ord = table.register("alpha");
        let header = get_header(ord, 100, 100);
        assert!(matches!(table.admit(&header, 0), Admission::Process));
        table.complete(ord, header.seqno, Some(lease_reply(&header)));

        assert_eq!(table.register("alpha"), ord);
        assert_eq!(table.queue_len(ord), 0);
        assert_eq!(table.min_acked(ord), Some(Seqno::NONE));

        let mut reset = get_header(ord, 1, 1);
        reset.reset_seqno = true;
        assert!(matches!(table.admit(&reset, 0), Admission::Process));
        assert_eq!(table.min_acked(ord), Some(Seqno::new(1)));
        assert_eq!(table.queue_len(ord), 1);
    }

    #[test]
    fn test_reset_moves_floor_back_and_keeps_own_reply() {
        let table = ClientTable::new();
        let ord = table.register("alpha");
        for seqno in [40, 41] {
            let header = get_header(ord, seqno, seqno);
            assert!(matches!(table.admit(&header, 0), Admission::Process));
            table.complete(ord, header.seqno, Some(lease_reply(&header)));
        }

        // Retransmission of an executed request that still carries the reset.
        let mut reset = get_header(ord, 7, 7);
        reset.reset_seqno = true;
        assert!(matches!(table.admit(&reset, 0), Admission::Process));
        table.complete(ord, reset.seqno, Some(lease_reply(&reset)));
        assert_eq!(table.min_acked(ord), Some(Seqno::new(7)));
        assert!(matches!(table.admit(&reset, 0), Admission::Replay(_)));
    }

    #[test]
    fn test_non_responding_generation_mismatch_stale() {
        let table = ClientTable::new();
        let ord = table.register("alpha");
        table.set_responding(ord, false);

        let mut header = get_header(ord, 1, 1);
        header.fs_generation = 1;
        assert!(matches!(table.admit(&header, 2), Admission::Reject(ErrorCode::STALE)));

        header.fs_generation = 2;
        assert!(matches!(table.admit(&header, 2), Admission::Process));
        assert!(table.is_responding(ord));
    }

    #[test]
    fn test_marked_off_dropped() {
        let table = ClientTable::new();
        let ord = table.register("alpha");
        table.mark_off(ord);
        assert!(matches!(table.admit(&get_header(ord, 1, 1), 0), Admission::Drop(_)));
    }

    #[test]
    fn test_resync_tracking() {
        let table = ClientTable::new();
        let a = table.register("alpha");
        let b = table.register("beta");
        table.begin_resync();
        assert!(!table.all_resynced());
        table.set_resynced(a, true);
        assert!(!table.all_resynced());
        table.set_resynced(b, true);
        assert!(table.all_resynced());
    }
}
