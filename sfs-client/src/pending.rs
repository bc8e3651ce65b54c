//! Client-side bookkeeping of requests awaiting a reply.

use sfs_core::{Seqno, WaitMode};
use sfs_network::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// One outstanding request. Lives from registration until the caller
/// receives its reply or gives up.
#[derive(Debug)]
pub struct PendingRequest {
    seqno: Seqno,
    wait_mode: WaitMode,
    reply: Mutex<Option<Message>>,
    /// Connection lost while outstanding; the caller should retransmit.
    interrupted: AtomicBool,
    wake: Notify,
}

/// What a single polling slice observed.
#[derive(Debug)]
pub enum SliceOutcome {
    Reply(Message),
    Interrupted,
    Idle,
}

impl PendingRequest {
    #[inline]
    #[must_use]
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    #[inline]
    #[must_use]
    pub fn wait_mode(&self) -> WaitMode {
        self.wait_mode
    }

    fn slot(&self) -> MutexGuard<'_, Option<Message>> {
        self.reply.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, message: Message) {
        *self.slot() = Some(message);
        self.wake.notify_one();
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Clear the interrupted flag before a retransmission.
    pub fn rearm(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    /// Wait up to `slice` for the reply. A reply that raced in wins over an
    /// interruption.
    pub async fn wait_slice(&self, slice: Duration) -> SliceOutcome {
        if let Some(outcome) = self.poll() {
            return outcome;
        }
        let _ = tokio::time::timeout(slice, self.wake.notified()).await;
        self.poll().unwrap_or(SliceOutcome::Idle)
    }

    fn poll(&self) -> Option<SliceOutcome> {
        if let Some(reply) = self.slot().take() {
            return Some(SliceOutcome::Reply(reply));
        }
        self.interrupted
            .load(Ordering::Acquire)
            .then_some(SliceOutcome::Interrupted)
    }
}

#[derive(Debug)]
struct Inner {
    last: Seqno,
    outstanding: HashMap<Seqno, Arc<PendingRequest>>,
}

/// Every request of one mount still waiting for its reply.
#[derive(Debug)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last: Seqno::NONE,
                outstanding: HashMap::new(),
            }),
        }
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next sequence number and track the request before any
    /// byte of it is written.
    pub fn register(&self, wait_mode: WaitMode) -> Arc<PendingRequest> {
        let mut inner = self.lock();
        inner.last = inner.last.next();
        let pending = Arc::new(PendingRequest {
            seqno: inner.last,
            wait_mode,
            reply: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            wake: Notify::new(),
        });
        inner.outstanding.insert(pending.seqno, Arc::clone(&pending));
        pending
    }

    /// Hand a reply to its waiter. Returns false for replies nobody waits
    /// for any more.
    pub fn complete(&self, message: Message) -> bool {
        let pending = self.lock().outstanding.get(&message.header.seqno).cloned();
        match pending {
            Some(pending) => {
                pending.complete(message);
                true
            },
            None => false,
        }
    }

    pub fn remove(&self, seqno: Seqno) {
        self.lock().outstanding.remove(&seqno);
    }

    /// Lowest outstanding sequence number; the next one to be issued when
    /// nothing is outstanding.
    #[must_use]
    pub fn ack(&self) -> Seqno {
        let inner = self.lock();
        inner
            .outstanding
            .keys()
            .copied()
            .reduce(|low, s| if s.is_earlier_than(low) { s } else { low })
            .unwrap_or_else(|| inner.last.next())
    }

    /// Wake every waiter so it retransmits on the next connection.
    pub fn interrupt_all(&self) {
        for pending in self.lock().outstanding.values() {
            pending.interrupt();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().outstanding.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().outstanding.is_empty()
    }
}

/// Removes its request from the table when dropped.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingRequests,
    pub(crate) request: Arc<PendingRequest>,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingRequests, wait_mode: WaitMode) -> Self {
        let request = table.register(wait_mode);
        Self { table, request }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.request.seqno());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sfs_core::ErrorCode;
    use sfs_network::{MountRequest, Reply, Request};

    fn reply_to(seqno: Seqno) -> Message {
        let mut request = Message::request(Request::Mount(MountRequest::Status), WaitMode::Wait);
        request.header.seqno = seqno;
        Message::reply(&request.header, ErrorCode::OK, Reply::Empty)
    }

    #[test]
    fn test_seqnos_increase() {
        let table = PendingRequests::new();
        let a = table.register(WaitMode::Wait);
        let b = table.register(WaitMode::Wait);
        assert_eq!(a.seqno(), Seqno::new(1));
        assert!(b.seqno().is_later_than(a.seqno()));
    }

    #[test]
    fn test_ack_is_lowest_outstanding() {
        let table = PendingRequests::new();
        assert_eq!(table.ack(), Seqno::new(1));
        let a = table.register(WaitMode::Wait);
        let b = table.register(WaitMode::Wait);
        assert_eq!(table.ack(), a.seqno());
        table.remove(a.seqno());
        assert_eq!(table.ack(), b.seqno());
        table.remove(b.seqno());
        assert_eq!(table.ack(), Seqno::new(3));
    }

    #[tokio::test]
    async fn test_reply_wins_over_interrupt() {
        let table = PendingRequests::new();
        let pending = table.register(WaitMode::Wait);
        assert!(table.complete(reply_to(pending.seqno())));
        table.interrupt_all();
        assert!(matches!(
            pending.wait_slice(Duration::from_millis(10)).await,
            SliceOutcome::Reply(_)
        ));
        assert!(matches!(
            pending.wait_slice(Duration::from_millis(10)).await,
            SliceOutcome::Interrupted
        ));
        pending.rearm();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_slice() {
        let table = PendingRequests::new();
        let pending = table.register(WaitMode::Wait);
        assert!(matches!(
            pending.wait_slice(Duration::from_secs(1)).await,
            SliceOutcome::Idle
        ));
        assert!(!table.complete(reply_to(Seqno::new(99))));
    }

    #[test]
    fn test_guard_removes() {
        let table = PendingRequests::new();
        {
            let _guard = PendingGuard::new(&table, WaitMode::Wait);
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());
    }
}
