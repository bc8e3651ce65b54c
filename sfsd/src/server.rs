//! Listener and role management for the metadata server.

use crate::config::Config;
use crate::shutdown::Sessions;
use sfs_cluster::{MemoryNamespace, ServerDispatcher, SessionConfig, serve_connection_with};
use sfs_core::Result;
use sfs_lease::MemoryInodeStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the resync watchdog checks whether every client is back.
const RESYNC_POLL: Duration = Duration::from_millis(250);

/// Build the dispatcher for the configured filesystem over `store` and take
/// the server role.
pub fn start_dispatcher(config: &Config, store: MemoryInodeStore) -> Arc<ServerDispatcher> {
    let namespace = Arc::new(MemoryNamespace::new(store.clone()));
    let dispatcher = ServerDispatcher::new(config.server_config(), Arc::new(store), namespace);
    dispatcher.take_over();
    dispatcher
}

/// Bind, take over and serve until `shutdown` fires.
pub async fn run(
    config: Config,
    sessions: Sessions,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(
        target: "sfsd",
        addr = %config.listen_addr,
        fs = %config.filesystem.name,
        node_id = config.node_id,
        "Listening for clients"
    );

    let dispatcher = start_dispatcher(&config, MemoryInodeStore::new());
    serve(
        listener,
        dispatcher,
        config.session_config(),
        config.resync_timeout(),
        sessions,
        shutdown,
    )
    .await
}

/// Accept connections on `listener` until `shutdown` fires, then cancel
/// every session and release the server role. Each session is counted in
/// `sessions` until its connection closes.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<ServerDispatcher>,
    session: SessionConfig,
    resync_timeout: Duration,
    sessions: Sessions,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(resync_watchdog(
        Arc::clone(&dispatcher),
        resync_timeout,
        cancel.clone(),
    ));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(target: "sfsd", "Shutdown signal received, closing listener");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(target: "sfsd", error = %e, "Accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(target: "sfsd", peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                }
                debug!(target: "sfsd", peer = %peer, "Client connected");

                let guard = sessions.begin();
                let dispatcher = Arc::clone(&dispatcher);
                let session = session.clone();
                let token = cancel.child_token();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = serve_connection_with(stream, dispatcher, session, token).await {
                        warn!(target: "sfsd", peer = %peer, error = %e, "Session ended with error");
                    }
                });
            }
        }
    }

    cancel.cancel();
    watchdog.abort();
    dispatcher.step_down();
    Ok(())
}

/// End the resync phase once every known client has resynced, or force it
/// after `timeout` so stragglers cannot hold the filesystem.
async fn resync_watchdog(
    dispatcher: Arc<ServerDispatcher>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    while dispatcher.mount().is_resyncing() {
        if dispatcher.finish_resync_if_done() {
            info!(target: "sfsd", "All clients resynced");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            error!(
                target: "sfsd",
                timeout_ms = timeout.as_millis(),
                "Resync timed out; resuming without remaining clients"
            );
            dispatcher.force_resync_complete();
            return;
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(RESYNC_POLL) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sfs_client::{ClientConfig, ClientTransport, Connector, TransportConfig};
    use sfs_core::{FileId, InodeSnapshot, LeaseType, MountFlags, Seqno, WaitMode};
    use sfs_network::{LeaseArgs, LeaseRequest, Message, MountRequest, Request};

    fn client_config(host: &str) -> ClientConfig {
        ClientConfig::new(host, "sfs0").with_transport(
            TransportConfig::default()
                .with_delays(Duration::from_millis(20), Duration::from_millis(100))
                .with_reply_timeout(Duration::from_millis(500)),
        )
    }

    async fn listen() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_client_mounts_over_tcp() {
        let (listener, addr) = listen().await;
        let dispatcher = start_dispatcher(&Config::default(), MemoryInodeStore::new());
        let sessions = Sessions::default();
        let (tx, rx) = broadcast::channel(1);
        let server = tokio::spawn(serve(
            listener,
            Arc::clone(&dispatcher),
            SessionConfig::default(),
            Duration::from_secs(5),
            sessions.clone(),
            rx,
        ));

        let transport = ClientTransport::new(client_config("alpha"), Connector::tcp(addr));
        let reply = tokio::time::timeout(Duration::from_secs(10), transport.mount())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(reply.client_ord, 0);
        assert_eq!(reply.server_ord, 1);
        assert!(dispatcher.clients().contains(reply.client_ord));
        assert_eq!(sessions.live(), 1);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!dispatcher.mount().is_server());
        assert!(sessions.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_lease_granted_over_tcp() {
        let (listener, addr) = listen().await;
        let store = MemoryInodeStore::new();
        store.insert(InodeSnapshot::new(FileId(42)));
        let dispatcher = start_dispatcher(&Config::default(), store);
        let (tx, rx) = broadcast::channel(1);
        let server = tokio::spawn(serve(
            listener,
            dispatcher,
            SessionConfig::default(),
            Duration::from_secs(5),
            Sessions::default(),
            rx,
        ));

        let transport = ClientTransport::new(client_config("beta"), Connector::tcp(addr));
        transport.mount().await.unwrap();
        let reply = transport
            .send(
                Request::Lease(LeaseRequest::Get(LeaseArgs::new(FileId(42), LeaseType::Read))),
                WaitMode::Wait,
            )
            .await
            .unwrap()
            .unwrap();
        assert!(reply.header.error.is_ok());

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resync_forced_after_timeout() {
        let dispatcher = start_dispatcher(&Config::default(), MemoryInodeStore::new());
        // A client known before the take over that never comes back.
        let init = Request::Mount(MountRequest::Init {
            host: "ghost".to_string(),
            fs_name: "sfs0".to_string(),
            flags: MountFlags::EMPTY,
        });
        let mut message = Message::request(init, WaitMode::Wait);
        message.header.fsid = dispatcher.mount().fsid();
        message.header.seqno = Seqno::new(1);
        message.header.ack = Seqno::new(1);
        dispatcher.dispatch(message).await;
        dispatcher.take_over();
        assert!(dispatcher.mount().is_resyncing());

        resync_watchdog(
            Arc::clone(&dispatcher),
            Duration::from_millis(300),
            CancellationToken::new(),
        )
        .await;
        assert!(!dispatcher.mount().is_resyncing());
    }

    #[tokio::test]
    async fn test_resync_ends_at_once_without_clients() {
        let dispatcher = start_dispatcher(&Config::default(), MemoryInodeStore::new());
        assert!(!dispatcher.mount().is_resyncing());
        resync_watchdog(dispatcher, Duration::from_secs(60), CancellationToken::new()).await;
    }
}
