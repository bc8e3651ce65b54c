//! Stopping sfsd: wait for a termination signal, then give live client
//! sessions a bounded time to finish their replies.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Longest the daemon waits for sessions after the listener closes.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(25);

/// Count of live client sessions, shared by the listener and `main`.
#[derive(Clone)]
pub struct Sessions {
    live: Arc<watch::Sender<usize>>,
}

impl Default for Sessions {
    fn default() -> Self {
        let (live, _) = watch::channel(0);
        Self { live: Arc::new(live) }
    }
}

impl Sessions {
    /// Count one session until the returned guard drops.
    #[must_use]
    pub fn begin(&self) -> SessionGuard {
        self.live.send_modify(|n| *n += 1);
        SessionGuard {
            live: Arc::clone(&self.live),
        }
    }

    #[must_use]
    pub fn live(&self) -> usize {
        *self.live.borrow()
    }

    /// Wait until every session has ended. Returns false if `timeout`
    /// passed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.live.subscribe();
        let start = tokio::time::Instant::now();
        info!(target: "sfsd", live = *rx.borrow(), timeout_secs = timeout.as_secs(), "Draining sessions");
        match tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await {
            Ok(_) => {
                info!(target: "sfsd", elapsed_ms = start.elapsed().as_millis() as u64, "Sessions drained");
                true
            },
            Err(_) => {
                warn!(target: "sfsd", live = self.live(), "Drain timed out");
                false
            },
        }
    }
}

pub struct SessionGuard {
    live: Arc<watch::Sender<usize>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.live.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Resolve with the name of the first termination signal received.
pub async fn signalled() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = term.recv() => Ok("SIGTERM"),
            _ = int.recv() => Ok("SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_counts_session() {
        let sessions = Sessions::default();
        let a = sessions.begin();
        let b = sessions.begin();
        assert_eq!(sessions.live(), 2);
        drop(a);
        assert_eq!(sessions.live(), 1);
        drop(b);
        assert_eq!(sessions.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_with_stuck_session() {
        let sessions = Sessions::default();
        let _stuck = sessions.begin();
        assert!(!sessions.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_when_last_session_ends() {
        let sessions = Sessions::default();
        let guard = sessions.begin();
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(guard);
        });
        assert!(sessions.drain(DRAIN_TIMEOUT).await);
        closer.await.unwrap();
    }
}
