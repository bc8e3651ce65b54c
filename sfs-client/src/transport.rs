//! Client Transport
//!
//! Carries requests from one mount to its current server and hands back the
//! replies. The transport owns everything that makes a request survive a
//! lost connection or a server failover:
//!
//! - **Sequencing**: every blocking request gets a sequence number before a
//!   byte of it is written, and every outgoing message acknowledges the lowest
//!   one still outstanding.
//! - **Retransmission**: a request whose reply does not arrive within the
//!   reply timeout is sent again with the same sequence number.
//! - **Backoff**: connection failures are retried with an additive delay,
//!   capped at the configured maximum.
//! - **Freeze**: while the mount is frozen for failover, only exempt
//!   requests are transmitted. Everything else waits for the thaw.
//! - **Re-introduction**: a server that answers `MOUNT_OUT_OF_SYNC` gets a
//!   fresh `Mount.init` before the original request is retried.
//!
//! # Example
//!
//! ```rust,no_run
//! use sfs_client::{ClientConfig, ClientTransport, Connector};
//! use sfs_core::WaitMode;
//! use sfs_network::{MountRequest, Request};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = ClientTransport::new(
//!         ClientConfig::new("node-a", "sfs0"),
//!         Connector::tcp("127.0.0.1:7070".parse()?),
//!     );
//!     transport.mount().await?;
//!
//!     let status = transport
//!         .send(Request::Mount(MountRequest::Status), WaitMode::Wait)
//!         .await?;
//!     println!("{:?}", status);
//!     Ok(())
//! }
//! ```

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::pending::{PendingGuard, PendingRequest, PendingRequests, SliceOutcome};
use bytes::Bytes;
use sfs_cluster::MountState;
use sfs_core::{ErrorCode, MountFlags, MountStatus, Seqno, WaitMode};
use sfs_metrics::{LATENCY_REQUEST, LatencyTimer};
use sfs_network::{
    ByteOrder, ConnectionBuffer, Message, MountReply, MountRequest, Payload, Reply, Request,
    encode_message,
};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const WRITE_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Byte stream the transport can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxStream>> + Send>>;

/// Opens a new stream to the current server.
#[derive(Clone)]
pub struct Connector(Arc<dyn Fn() -> ConnectFuture + Send + Sync>);

impl Connector {
    /// Plain TCP with `TCP_NODELAY`.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::from_fn(move || async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }

    pub fn from_fn<F, Fut, S>(connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<S>> + Send + 'static,
        S: AsyncStream + 'static,
    {
        Self(Arc::new(move || {
            let fut = connect();
            Box::pin(async move { fut.await.map(|s| Box::new(s) as BoxStream) })
        }))
    }

    async fn connect(&self) -> io::Result<BoxStream> {
        (self.0)().await
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Connector")
    }
}

struct Connection {
    epoch: u64,
    tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// How a wait for one reply ended.
enum Waited {
    Reply(Message),
    Interrupted,
    TimedOut,
}

/// Reliable request transport for one mount.
pub struct ClientTransport {
    config: ClientConfig,
    mount: Arc<MountState>,
    pending: PendingRequests,
    connector: Mutex<Connector>,
    conn: tokio::sync::Mutex<Option<Connection>>,
    epoch: AtomicU64,
    /// Ask the server to forget acknowledged state; cleared by the first
    /// reply to a message that carried it.
    reset_seqno: AtomicBool,
    server_order: Mutex<Option<ByteOrder>>,
    events: broadcast::Sender<Request>,
    me: Weak<Self>,
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransport")
            .field("host", &self.config.host)
            .field("mount", &self.mount)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ClientTransport {
    pub fn new(config: ClientConfig, connector: Connector) -> Arc<Self> {
        let mount = Arc::new(MountState::new(config.fs_name.clone()));
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        Arc::new_cyclic(|me| Self {
            config,
            mount,
            pending: PendingRequests::new(),
            connector: Mutex::new(connector),
            conn: tokio::sync::Mutex::new(None),
            epoch: AtomicU64::new(0),
            reset_seqno: AtomicBool::new(true),
            server_order: Mutex::new(None),
            events,
            me: me.clone(),
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Mount state shared with the lease cache.
    #[inline]
    #[must_use]
    pub fn mount_state(&self) -> &Arc<MountState> {
        &self.mount
    }

    #[inline]
    #[must_use]
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Callouts and notifications pushed by the server.
    pub fn subscribe(&self) -> broadcast::Receiver<Request> {
        self.events.subscribe()
    }

    /// Byte order the server was last seen writing in.
    #[must_use]
    pub fn server_order(&self) -> Option<ByteOrder> {
        *self
            .server_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Point the transport at another server. Takes effect on the next
    /// connection.
    pub fn set_connector(&self, connector: Connector) {
        *self.connector.lock().unwrap_or_else(PoisonError::into_inner) = connector;
    }

    // -----------------------------------------------------------------------
    // Mount lifecycle
    // -----------------------------------------------------------------------

    /// Introduce this client to the server and mark the mount live.
    pub async fn mount(&self) -> Result<MountReply> {
        let reply = self.introduce().await?;
        self.mount.set_mounted();
        Ok(reply)
    }

    /// Freeze the mount and drop the connection to the failed server. The
    /// next connection goes through `connector`.
    pub async fn begin_failover(&self, connector: Connector) {
        self.mount.begin_failover();
        self.set_connector(connector);
        self.disconnect().await;
        info!(
            target: "sfs::client",
            fs = %self.mount.fs_name(),
            pending = self.pending.len(),
            "Failover started"
        );
    }

    /// Close the current connection. Outstanding requests retransmit on the
    /// next one.
    pub async fn disconnect(&self) {
        let closed = self.conn.lock().await.take();
        if let Some(conn) = closed {
            conn.close();
            self.pending.interrupt_all();
        }
    }

    /// Send `Mount.init` and adopt the ordinals and identity the server
    /// hands back. Never waits for the freeze.
    pub async fn introduce(&self) -> Result<MountReply> {
        let mut flags = MountFlags::EMPTY;
        if self.server_order().is_some_and(|o| o != ByteOrder::native()) {
            flags.insert(MountFlags::BYTE_SWAP);
        }
        if self.config.multihost_write {
            flags.insert(MountFlags::MULTIHOST_WRITE);
        }
        let request = Request::Mount(MountRequest::Init {
            host: self.config.host.clone(),
            fs_name: self.config.fs_name.clone(),
            flags,
        });
        let mut message = Message::request(request, WaitMode::Wait);
        let guard = PendingGuard::new(&self.pending, WaitMode::Wait);
        message.header.seqno = guard.request.seqno();
        let mut delay = self.config.transport.min_delay;

        loop {
            guard.request.rearm();
            if let Err(e) = self.transmit(&mut message).await {
                debug!(target: "sfs::client", error = %e, "Mount init not sent");
                tokio::time::sleep(delay).await;
                delay = self.config.transport.next_delay(delay);
                continue;
            }
            match self.await_reply(&guard.request, true).await {
                Waited::Reply(reply) if reply.header.error.is_ok() => {
                    let Some(Reply::Mount(mount)) = reply.as_reply() else {
                        return Err(ClientError::ProtocolError(
                            "mount init answered without mount reply".into(),
                        ));
                    };
                    self.adopt(mount);
                    return Ok(*mount);
                },
                Waited::Reply(reply) if reply.header.error == ErrorCode::NOT_MOUNTED => {
                    tokio::time::sleep(self.config.transport.min_delay).await;
                },
                Waited::Reply(reply) => return Err(ClientError::Remote(reply.header.error)),
                Waited::Interrupted => {
                    tokio::time::sleep(delay).await;
                    delay = self.config.transport.next_delay(delay);
                },
                Waited::TimedOut => sfs_metrics::increment_retransmits(),
            }
        }
    }

    fn adopt(&self, reply: &MountReply) {
        self.mount.set_client_ord(reply.client_ord);
        self.mount.set_server_ord(reply.server_ord);
        self.mount.set_fsid(reply.fsid);
        self.mount.set_fs_generation(reply.fs_generation);
        info!(
            target: "sfs::client",
            client_ord = reply.client_ord,
            server_ord = reply.server_ord,
            fsid = reply.fsid,
            generation = reply.fs_generation,
            "Mounted"
        );
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send a request and, for blocking wait modes, return its reply.
    ///
    /// `NoWait` and `NoThread` messages carry no sequence number and return
    /// `None` once written. A `NoWait` that cannot be written is a timeout;
    /// a `NoThread` that cannot be written is silently dropped.
    pub async fn send(&self, request: Request, wait: WaitMode) -> Result<Option<Message>> {
        if wait.blocks() {
            self.send_blocking(request, wait, false).await.map(Some)
        } else {
            self.send_oneway(request, wait).await.map(|()| None)
        }
    }

    /// Like a blocking [`send`](Self::send), but a frozen mount yields
    /// [`ClientError::Frozen`] instead of waiting. Callers that hold a
    /// per-file lock use this so the lock can be dropped during failover.
    pub async fn send_unfrozen(&self, request: Request) -> Result<Message> {
        self.send_blocking(request, WaitMode::Wait, true).await
    }

    async fn send_oneway(&self, request: Request, wait: WaitMode) -> Result<()> {
        let mut message = Message::request(request, wait);
        message.header.seqno = Seqno::NONE;
        match self.transmit(&mut message).await {
            Ok(()) => Ok(()),
            Err(e) if wait == WaitMode::NoThread => {
                debug!(target: "sfs::client", error = %e, "Dropped one-way message");
                Ok(())
            },
            Err(e) => {
                debug!(target: "sfs::client", error = %e, "One-way message not sent");
                Err(ClientError::Timeout)
            },
        }
    }

    async fn send_blocking(
        &self,
        request: Request,
        wait: WaitMode,
        frozen_fails: bool,
    ) -> Result<Message> {
        let _timer = LatencyTimer::new(&LATENCY_REQUEST);
        let exempt = request.is_freeze_exempt();
        let fail_fast = request.fails_fast_in_failover();
        let mut message = Message::request(request, wait);
        let guard = PendingGuard::new(&self.pending, wait);
        message.header.seqno = guard.request.seqno();
        let transport = &self.config.transport;
        let mut delay = transport.min_delay;
        let mut attempts = 0u32;

        loop {
            if !exempt && self.mount.in_failover() {
                if frozen_fails {
                    return Err(ClientError::Frozen);
                }
                self.wait_unfrozen().await?;
            }

            guard.request.rearm();
            if attempts > 0 {
                sfs_metrics::increment_retransmits();
            }
            attempts = attempts.saturating_add(1);

            if let Err(e) = self.transmit(&mut message).await {
                self.mount.server_down();
                if fail_fast {
                    debug!(target: "sfs::client", error = %e, "Giving up on fail-fast request");
                    return Err(ClientError::Remote(ErrorCode::NOT_CONNECTED));
                }
                if wait == WaitMode::WaitOnce {
                    return Err(e);
                }
                trace!(target: "sfs::client", delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
                delay = transport.next_delay(delay);
                continue;
            }

            let reply = match self.await_reply(&guard.request, exempt).await {
                Waited::Reply(reply) => reply,
                Waited::Interrupted => {
                    if fail_fast {
                        return Err(ClientError::Remote(ErrorCode::NOT_CONNECTED));
                    }
                    if wait == WaitMode::WaitOnce {
                        return Err(ClientError::ConnectionClosed);
                    }
                    tokio::time::sleep(delay).await;
                    delay = transport.next_delay(delay);
                    continue;
                },
                Waited::TimedOut if wait == WaitMode::WaitOnce => {
                    return Err(ClientError::Timeout);
                },
                Waited::TimedOut => {
                    debug!(
                        target: "sfs::client",
                        seqno = %message.header.seqno,
                        command = ?message.header.command,
                        "Reply timed out, retransmitting"
                    );
                    continue;
                },
            };

            match reply.header.error {
                ErrorCode::OK => {
                    if message.header.reset_seqno {
                        self.reset_seqno.store(false, Ordering::Release);
                    }
                    return Ok(reply);
                },
                ErrorCode::NOT_MOUNTED | ErrorCode::TRY_AGAIN => {
                    trace!(target: "sfs::client", code = %reply.header.error, "Server busy");
                    tokio::time::sleep(transport.min_delay).await;
                },
                ErrorCode::MOUNT_OUT_OF_SYNC => {
                    warn!(
                        target: "sfs::client",
                        client_ord = self.mount.client_ord(),
                        "Server does not know this client, re-introducing"
                    );
                    self.reset_seqno.store(true, Ordering::Release);
                    self.introduce().await?;
                },
                code if code.is_connection_loss() => {
                    self.mount.server_down();
                    tokio::time::sleep(delay).await;
                    delay = transport.next_delay(delay);
                },
                code => {
                    if message.header.reset_seqno {
                        self.reset_seqno.store(false, Ordering::Release);
                    }
                    return Err(ClientError::Remote(code));
                },
            }
        }
    }

    /// Wait out a failover freeze, bounded by the failover delay. A plain
    /// server outage does not hold here; retransmissions double as the
    /// status checks that clear it.
    pub async fn wait_unfrozen(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.transport.failover_delay;
        self.mount
            .wait_for_failover(deadline)
            .await
            .map_err(ClientError::from)
    }

    /// Wait for the reply in slices so a freeze or a dropped connection is
    /// noticed promptly. A freeze extends the deadline to the failover
    /// delay; a thaw ends the wait so the request is retransmitted to the
    /// new server.
    async fn await_reply(&self, pending: &PendingRequest, exempt: bool) -> Waited {
        let transport = &self.config.transport;
        let mut deadline = Instant::now() + transport.reply_timeout;
        let mut was_frozen = false;
        loop {
            let now = Instant::now();
            if !exempt {
                if self.mount.in_failover() {
                    was_frozen = true;
                    deadline = deadline.max(now + transport.failover_delay);
                } else if was_frozen {
                    return Waited::TimedOut;
                }
            }
            if now >= deadline {
                return Waited::TimedOut;
            }
            let slice = transport.reply_slice.min(deadline - now);
            match pending.wait_slice(slice).await {
                SliceOutcome::Reply(reply) => return Waited::Reply(reply),
                SliceOutcome::Interrupted => return Waited::Interrupted,
                SliceOutcome::Idle => {},
            }
        }
    }

    async fn transmit(&self, message: &mut Message) -> Result<()> {
        let header = &mut message.header;
        header.client_ord = self.mount.client_ord();
        header.server_ord = self.mount.server_ord();
        header.fsid = self.mount.fsid();
        header.fs_generation = self.mount.fs_generation();
        header.ack = self.pending.ack();
        let is_init = matches!(
            message.payload,
            Payload::Request(Request::Mount(MountRequest::Init { .. }))
        );
        message.header.reset_seqno = !is_init && self.reset_seqno.load(Ordering::Acquire);

        let frame = encode_message(message, ByteOrder::native());
        let tx = self.connect().await?;
        tx.send(frame)
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        sfs_metrics::increment_messages_sent();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    async fn connect(&self) -> Result<mpsc::Sender<Bytes>> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.tx.is_closed() {
                return Ok(conn.tx.clone());
            }
        }
        if let Some(stale) = slot.take() {
            stale.close();
        }

        let connector = self
            .connector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let stream = connector
            .connect()
            .await
            .map_err(ClientError::ConnectionFailed)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);

        let writer = tokio::spawn(write_loop(write_half, rx));
        let reader = tokio::spawn(read_loop(read_half, self.me.clone(), epoch));
        *slot = Some(Connection {
            epoch,
            tx: tx.clone(),
            reader,
            writer,
        });
        debug!(target: "sfs::client", epoch, "Connected");
        Ok(tx)
    }

    fn on_reply(&self, message: Message, order: Option<ByteOrder>) {
        if let Some(order) = order {
            *self
                .server_order
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(order);
        }
        self.mount.server_responding();
        let seqno = message.header.seqno;
        if !self.pending.complete(message) {
            trace!(target: "sfs::client", seqno = %seqno, "Reply nobody waits for");
        }
    }

    fn on_request(&self, message: Message) {
        let Payload::Request(request) = message.payload else {
            return;
        };
        match request {
            Request::Callout(_) | Request::Notify(_) => {
                trace!(target: "sfs::client", request = ?request, "Server message");
                // No subscriber just means nobody caches leases on this mount.
                let _ = self.events.send(request);
            },
            other => {
                debug!(target: "sfs::client", request = ?other, "Ignoring unexpected server request");
            },
        }
    }

    async fn connection_lost(&self, epoch: u64) {
        let mut slot = self.conn.lock().await;
        if slot.as_ref().is_some_and(|c| c.epoch == epoch) {
            if let Some(conn) = slot.take() {
                conn.writer.abort();
            }
            drop(slot);
            self.pending.interrupt_all();
            if self.mount.is_mounted() {
                self.mount.server_down();
            }
            warn!(
                target: "sfs::client",
                epoch,
                pending = self.pending.len(),
                status = %self.mount.status(),
                "Connection to server lost"
            );
        }
    }

    /// Current mount status flags.
    #[must_use]
    pub fn status(&self) -> MountStatus {
        self.mount.status()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(target: "sfs::client", error = %e, "Write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, transport: Weak<ClientTransport>, epoch: u64) {
    let mut buffer = ConnectionBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    'conn: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(target: "sfs::client", error = %e, "Read failed");
                break;
            },
        };
        buffer.extend(&chunk[..n]);

        let Some(transport) = transport.upgrade() else {
            return;
        };
        loop {
            match buffer.next_message() {
                Ok(Some(message)) => {
                    sfs_metrics::increment_messages_received();
                    if message.header.is_reply {
                        transport.on_reply(message, buffer.peer_order());
                    } else {
                        transport.on_request(message);
                    }
                },
                Ok(None) => break,
                Err(sfs_core::ShareError::InvalidMagic(magic)) => {
                    warn!(target: "sfs::client", magic, "Bad frame magic, dropping connection");
                    break 'conn;
                },
                Err(e) => {
                    if matches!(e, sfs_core::ShareError::CrcMismatch { .. }) {
                        sfs_metrics::increment_crc_failures();
                    }
                    warn!(target: "sfs::client", error = %e, "Discarding malformed frame");
                },
            }
        }
    }

    if let Some(transport) = transport.upgrade() {
        transport.connection_lost(epoch).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use sfs_network::parse_message;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// A connector that hands out the client ends of duplex pipes and
    /// forwards the server ends to the test.
    fn duplex_connector() -> (Connector, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Connector::from_fn(move || {
            let tx = tx.clone();
            async move {
                let (client, server) = tokio::io::duplex(64 * 1024);
                tx.send(server)
                    .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
                Ok(client)
            }
        });
        (connector, rx)
    }

    fn fast_config() -> ClientConfig {
        ClientConfig::new("test-host", "sfs0").with_transport(
            TransportConfig::default()
                .with_delays(Duration::from_millis(10), Duration::from_millis(50))
                .with_reply_timeout(Duration::from_millis(200)),
        )
    }

    async fn read_one(stream: &mut DuplexStream, buf: &mut Vec<u8>) -> Message {
        loop {
            if let Some((message, _, used)) = parse_message(buf).unwrap() {
                buf.drain(..used);
                return message;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn answer(stream: &mut DuplexStream, request: &Message, error: ErrorCode, reply: Reply) {
        let frame = encode_message(&Message::reply(&request.header, error, reply), ByteOrder::Big);
        stream.write_all(&frame).await.unwrap();
    }

    fn mount_reply(client_ord: u32) -> Reply {
        Reply::Mount(MountReply {
            client_ord,
            server_ord: 9,
            status: MountStatus::MOUNTED,
            fsid: 3,
            fs_generation: 5,
            flags: MountFlags::EMPTY,
        })
    }

    #[tokio::test]
    async fn test_mount_adopts_identity() {
        let (connector, mut servers) = duplex_connector();
        let transport = ClientTransport::new(fast_config(), connector);

        let client = Arc::clone(&transport);
        let task = tokio::spawn(async move { client.mount().await });

        let mut server = servers.recv().await.unwrap();
        let mut buf = Vec::new();
        let init = read_one(&mut server, &mut buf).await;
        assert!(!init.header.reset_seqno);
        assert!(matches!(
            init.as_request(),
            Some(Request::Mount(MountRequest::Init { host, .. })) if host == "test-host"
        ));
        answer(&mut server, &init, ErrorCode::OK, mount_reply(4)).await;

        task.await.unwrap().unwrap();
        assert_eq!(transport.mount_state().client_ord(), 4);
        assert_eq!(transport.mount_state().fs_generation(), 5);
        assert!(transport.mount_state().is_mounted());
        assert_eq!(transport.server_order(), Some(ByteOrder::Big));
        assert!(transport.pending().is_empty());
    }

    #[tokio::test]
    async fn test_retransmits_with_same_seqno() {
        let (connector, mut servers) = duplex_connector();
        let transport = ClientTransport::new(fast_config(), connector);

        let client = Arc::clone(&transport);
        let task = tokio::spawn(async move {
            client
                .send(Request::Mount(MountRequest::Config), WaitMode::Wait)
                .await
        });

        let mut server = servers.recv().await.unwrap();
        let mut buf = Vec::new();
        let first = read_one(&mut server, &mut buf).await;
        assert!(first.header.reset_seqno);
        let second = read_one(&mut server, &mut buf).await;
        assert_eq!(first.header.seqno, second.header.seqno);
        answer(&mut server, &second, ErrorCode::OK, Reply::Empty).await;

        assert!(task.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wait_once_times_out() {
        let (connector, mut servers) = duplex_connector();
        let transport = ClientTransport::new(fast_config(), connector);

        let client = Arc::clone(&transport);
        let task = tokio::spawn(async move {
            client
                .send(Request::Mount(MountRequest::Config), WaitMode::WaitOnce)
                .await
        });
        let _server = servers.recv().await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn test_out_of_sync_reintroduces() {
        let (connector, mut servers) = duplex_connector();
        let transport = ClientTransport::new(fast_config(), connector);

        let client = Arc::clone(&transport);
        let task = tokio::spawn(async move {
            client
                .send(Request::Mount(MountRequest::Config), WaitMode::Wait)
                .await
        });

        let mut server = servers.recv().await.unwrap();
        let mut buf = Vec::new();
        let config = read_one(&mut server, &mut buf).await;
        answer(&mut server, &config, ErrorCode::MOUNT_OUT_OF_SYNC, Reply::Empty).await;

        let init = read_one(&mut server, &mut buf).await;
        assert!(matches!(
            init.as_request(),
            Some(Request::Mount(MountRequest::Init { .. }))
        ));
        answer(&mut server, &init, ErrorCode::OK, mount_reply(7)).await;

        let retry = read_one(&mut server, &mut buf).await;
        assert_eq!(retry.header.seqno, config.header.seqno);
        assert_eq!(retry.header.client_ord, 7);
        assert!(retry.header.reset_seqno);
        answer(&mut server, &retry, ErrorCode::OK, Reply::Empty).await;

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_surfaces() {
        let (connector, mut servers) = duplex_connector();
        let transport = ClientTransport::new(fast_config(), connector);

        let client = Arc::clone(&transport);
        let task = tokio::spawn(async move {
            client
                .send(Request::Mount(MountRequest::Config), WaitMode::Wait)
                .await
        });
        let mut server = servers.recv().await.unwrap();
        let mut buf = Vec::new();
        let request = read_one(&mut server, &mut buf).await;
        answer(&mut server, &request, ErrorCode::INVALID, Reply::Empty).await;

        assert!(matches!(
            task.await.unwrap(),
            Err(ClientError::Remote(ErrorCode::INVALID))
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_retransmits_on_new_connection() {
        let (connector, mut servers) = duplex_connector();
        let transport = ClientTransport::new(fast_config(), connector);
        transport.mount_state().set_mounted();

        let client = Arc::clone(&transport);
        let task = tokio::spawn(async move {
            client
                .send(Request::Mount(MountRequest::Config), WaitMode::Wait)
                .await
        });

        let mut first = servers.recv().await.unwrap();
        let mut buf = Vec::new();
        let original = read_one(&mut first, &mut buf).await;
        drop(first);

        let mut second = servers.recv().await.unwrap();
        let mut buf = Vec::new();
        let retry = read_one(&mut second, &mut buf).await;
        assert_eq!(retry.header.seqno, original.header.seqno);
        answer(&mut second, &retry, ErrorCode::OK, Reply::Empty).await;

        task.await.unwrap().unwrap();
        assert!(!transport.status().contains(MountStatus::SERVER_DOWN));
    }

    #[tokio::test]
    async fn test_frozen_request_waits_for_thaw() {
        let (connector, mut servers) = duplex_connector();
        let transport = ClientTransport::new(fast_config(), connector);
        transport.mount_state().begin_failover();

        let client = Arc::clone(&transport);
        let frozen = tokio::spawn(async move {
            client
                .send(
                    Request::Name(sfs_network::NameRequest::Lookup {
                        parent: sfs_core::FileId(1),
                        name: "a".into(),
                    }),
                    WaitMode::Wait,
                )
                .await
        });

        // Exempt requests still flow.
        let client = Arc::clone(&transport);
        let status = tokio::spawn(async move {
            client
                .send(Request::Mount(MountRequest::Status), WaitMode::Wait)
                .await
        });
        let mut server = servers.recv().await.unwrap();
        let mut buf = Vec::new();
        let request = read_one(&mut server, &mut buf).await;
        assert!(matches!(
            request.as_request(),
            Some(Request::Mount(MountRequest::Status))
        ));
        answer(&mut server, &request, ErrorCode::OK, Reply::Empty).await;
        status.await.unwrap().unwrap();
        assert!(!frozen.is_finished());

        transport.mount_state().begin_resync();
        let lookup = read_one(&mut server, &mut buf).await;
        assert!(matches!(lookup.as_request(), Some(Request::Name(_))));
        answer(&mut server, &lookup, ErrorCode::OK, Reply::Empty).await;
        frozen.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_unfrozen_refuses_while_frozen() {
        let (connector, _servers) = duplex_connector();
        let transport = ClientTransport::new(fast_config(), connector);
        transport.mount_state().begin_failover();
        let result = transport
            .send_unfrozen(Request::Name(sfs_network::NameRequest::Lookup {
                parent: sfs_core::FileId(1),
                name: "a".into(),
            }))
            .await;
        assert!(matches!(result, Err(ClientError::Frozen)));
    }

    #[tokio::test]
    async fn test_nothread_without_server_is_dropped() {
        let connector = Connector::from_fn(|| async {
            Err::<DuplexStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        });
        let transport = ClientTransport::new(fast_config(), connector);
        let request = Request::Mount(MountRequest::Config);
        assert!(
            transport
                .send(request.clone(), WaitMode::NoThread)
                .await
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            transport.send(request, WaitMode::NoWait).await,
            Err(ClientError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_fail_fast_without_server() {
        let connector = Connector::from_fn(|| async {
            Err::<DuplexStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        });
        let transport = ClientTransport::new(fast_config(), connector);
        let result = transport
            .send(Request::Mount(MountRequest::Status), WaitMode::Wait)
            .await;
        assert!(matches!(
            result,
            Err(ClientError::Remote(ErrorCode::NOT_CONNECTED))
        ));
    }

    #[tokio::test]
    async fn test_server_notifications_are_published() {
        let (connector, mut servers) = duplex_connector();
        let transport = ClientTransport::new(fast_config(), connector);
        let mut events = transport.subscribe();

        let client = Arc::clone(&transport);
        let task = tokio::spawn(async move {
            client
                .send(Request::Mount(MountRequest::Config), WaitMode::Wait)
                .await
        });
        let mut server = servers.recv().await.unwrap();
        let mut buf = Vec::new();
        let request = read_one(&mut server, &mut buf).await;

        let notify = Request::Notify(sfs_network::Notify::LeaseExpire {
            ino: sfs_core::FileId(12),
            mask: sfs_core::LeaseMask::EMPTY,
        });
        let frame = encode_message(&Message::request(notify.clone(), WaitMode::NoWait), ByteOrder::Big);
        server.write_all(&frame).await.unwrap();
        answer(&mut server, &request, ErrorCode::OK, Reply::Empty).await;

        assert_eq!(events.recv().await.unwrap(), notify);
        task.await.unwrap().unwrap();
    }
}
