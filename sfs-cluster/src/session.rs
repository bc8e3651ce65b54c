//! Server sessions: one per client connection, plus the registry that
//! routes callouts and notifications to connected clients.

use crate::dispatch::ServerDispatcher;
use crate::mount::MountState;
use sfs_core::{ClientOrd, Result, ShareError, WaitMode};
use sfs_lease::LeaseEvents;
use sfs_network::{
    ByteOrder, Callout, ConnectionBuffer, Message, Notify, Reply, Request, encode_message,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound messages queued per connection.
pub const SESSION_QUEUE: usize = 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Per-connection buffer sizing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_depth: usize,
    pub read_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_depth: SESSION_QUEUE,
            read_chunk: READ_CHUNK,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    #[must_use]
    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(512);
        self
    }
}

/// Connected clients and the queues feeding their connections.
pub struct ClientRegistry {
    mount: Arc<MountState>,
    senders: Mutex<HashMap<ClientOrd, mpsc::Sender<Message>>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(mount: Arc<MountState>) -> Self {
        Self {
            mount,
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientOrd, mpsc::Sender<Message>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, ord: ClientOrd, tx: mpsc::Sender<Message>) {
        self.lock().insert(ord, tx);
    }

    pub fn unregister(&self, ord: ClientOrd) {
        self.lock().remove(&ord);
    }

    /// Remove `ord` only if it is still bound to `tx`; a reconnect may have
    /// replaced it.
    pub fn unregister_if(&self, ord: ClientOrd, tx: &mpsc::Sender<Message>) {
        let mut senders = self.lock();
        if senders.get(&ord).is_some_and(|s| s.same_channel(tx)) {
            senders.remove(&ord);
        }
    }

    #[must_use]
    pub fn is_connected(&self, ord: ClientOrd) -> bool {
        self.lock().contains_key(&ord)
    }

    fn outgoing(&self, request: Request, client: ClientOrd) -> Message {
        let mut message = Message::request(request, WaitMode::NoWait);
        message.header.client_ord = client;
        message.header.server_ord = self.mount.server_ord();
        message.header.fsid = self.mount.fsid();
        message.header.fs_generation = self.mount.fs_generation();
        message
    }

    fn send(&self, client: ClientOrd, message: Message) {
        let Some(tx) = self.lock().get(&client).cloned() else {
            debug!(target: "sfs::server", client, "Client not connected; message discarded");
            return;
        };
        if let Err(e) = tx.try_send(message) {
            warn!(target: "sfs::server", client, error = %e, "Client queue full; message discarded");
        }
    }

    /// Send `notify` to every connected client except `except`.
    pub fn broadcast_notify(&self, notify: &Notify, except: Option<ClientOrd>) {
        let targets: Vec<ClientOrd> = self
            .lock()
            .keys()
            .copied()
            .filter(|ord| Some(*ord) != except)
            .collect();
        for client in targets {
            let message = self.outgoing(Request::Notify(notify.clone()), client);
            self.send(client, message);
        }
    }
}

impl LeaseEvents for ClientRegistry {
    fn callout(&self, client: ClientOrd, callout: Callout) {
        let message = self.outgoing(Request::Callout(callout), client);
        self.send(client, message);
    }

    fn notify(&self, client: ClientOrd, notify: Notify) {
        let message = self.outgoing(Request::Notify(notify), client);
        self.send(client, message);
    }
}

/// Client ordinal a connection speaks for, learned from its traffic.
struct Binding {
    ord: AtomicU32,
    tx: mpsc::Sender<Message>,
}

impl Binding {
    fn bind(&self, ord: ClientOrd, registry: &ClientRegistry) {
        if ord == 0 {
            return;
        }
        let previous = self.ord.swap(ord, Ordering::AcqRel);
        if previous != ord {
            registry.register(ord, self.tx.clone());
            debug!(target: "sfs::server", client = ord, "Connection bound");
        }
    }

    fn ord(&self) -> ClientOrd {
        self.ord.load(Ordering::Acquire)
    }
}

/// Serve one client connection until it closes or `shutdown` fires.
///
/// Requests on one connection are handled one at a time in arrival
/// order; conflicting lease requests answer `Waiting` rather than block.
/// Replies are written in this node's byte order.
pub async fn serve_connection<S>(
    stream: S,
    dispatcher: Arc<ServerDispatcher>,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    serve_connection_with(stream, dispatcher, SessionConfig::default(), shutdown).await
}

/// [`serve_connection`] with explicit buffer sizing.
pub async fn serve_connection_with<S>(
    stream: S,
    dispatcher: Arc<ServerDispatcher>,
    config: SessionConfig,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Message>(config.queue_depth);
    sfs_metrics::increment_connections();

    let writer_task = tokio::spawn(async move {
        let order = ByteOrder::native();
        while let Some(message) = rx.recv().await {
            let frame = encode_message(&message, order);
            if let Err(e) = writer.write_all(&frame).await {
                debug!(target: "sfs::server", error = %e, "Connection write failed");
                break;
            }
            sfs_metrics::increment_messages_sent();
        }
        let _ = writer.shutdown().await;
    });

    let binding = Binding {
        ord: AtomicU32::new(0),
        tx: tx.clone(),
    };
    let mut buffer = ConnectionBuffer::new();
    let mut chunk = vec![0u8; config.read_chunk];

    let result = loop {
        let n = tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(ShareError::Io(e)),
            },
        };
        buffer.extend(&chunk[..n]);

        match drain(&mut buffer, &dispatcher, &binding, &tx).await {
            Ok(()) => {},
            Err(e) => break Err(e),
        }
    };

    let ord = binding.ord();
    if ord != 0 {
        dispatcher.registry().unregister_if(ord, &tx);
        dispatcher.connection_lost(ord);
    }
    drop(tx);
    writer_task.abort();
    sfs_metrics::decrement_connections();
    info!(target: "sfs::server", client = ord, "Connection closed");
    result
}

/// Dispatch every complete message in `buffer`, one at a time and in
/// arrival order. Only an unreadable byte order tag ends the connection;
/// other decode failures drop the frame.
async fn drain(
    buffer: &mut ConnectionBuffer,
    dispatcher: &Arc<ServerDispatcher>,
    binding: &Binding,
    tx: &mpsc::Sender<Message>,
) -> Result<()> {
    loop {
        let message = match buffer.next_message() {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(e @ ShareError::InvalidMagic(_)) => {
                warn!(target: "sfs::server", error = %e, "Bad magic; closing connection");
                return Err(e);
            },
            Err(e) => {
                if matches!(e, ShareError::CrcMismatch { .. }) {
                    sfs_metrics::increment_crc_failures();
                }
                warn!(target: "sfs::server", error = %e, "Undecodable message dropped");
                continue;
            },
        };
        sfs_metrics::increment_messages_received();

        let known = message.header.client_ord;
        if known != 0 && dispatcher.clients().contains(known) {
            binding.bind(known, dispatcher.registry());
        }

        let Some(reply) = dispatcher.dispatch(message).await else {
            continue;
        };
        if let Some(Reply::Mount(mount)) = reply.as_reply() {
            if reply.header.error.is_ok() {
                binding.bind(mount.client_ord, dispatcher.registry());
            }
        }
        if tx.send(reply).await.is_err() {
            debug!(target: "sfs::server", "Connection gone before reply");
        }
    }
}
