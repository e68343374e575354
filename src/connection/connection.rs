//! Connection handle shared by both transports and both roles.
//!
//! A [`Connection`] is a cheap, clonable handle. The transport-specific part
//! lives in a [`Link`]; everything else (tag table, inbound demultiplexing,
//! event fan-out, lifecycle) is common.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::datagram::DatagramLink;
use super::stream::StreamLink;
use super::transaction::Transaction;
use crate::core::constants::{CLIENT_TAG_BASE, NOTIFICATION_TAG, SERVER_TAG_BASE};
use crate::core::{NetError, NetResult, ProviderConfig, TransportKind};
use crate::events::{Event, EventHub, EventStream};
use crate::transport::{Frame, KeepAliveAction, TagTable, encode_frame};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side established the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiated locally with `start`.
    Client,
    /// Accepted (stream) or first observed (datagram) by a server.
    Server,
}

impl Role {
    /// First transaction tag used by this role.
    pub fn tag_base(self) -> i32 {
        match self {
            Role::Client => CLIENT_TAG_BASE,
            Role::Server => SERVER_TAG_BASE,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Continuation run when a response arrives.
pub(crate) type ResponseHandler = Box<dyn FnOnce(Bytes) + Send + 'static>;

/// Transport-specific half of a connection.
pub(crate) enum Link {
    Stream(StreamLink),
    Datagram(DatagramLink),
}

/// Why a receive loop ended.
#[derive(Debug)]
pub(crate) enum DropReason {
    /// Local `dispose`.
    Disposed,
    /// Datagram keep-alive expired.
    Expired,
    /// Framing or transport failure.
    Failed(NetError),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Disposed => f.write_str("disposed"),
            DropReason::Expired => f.write_str("keep-alive expired"),
            DropReason::Failed(NetError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                f.write_str("closed by peer")
            }
            DropReason::Failed(e) => write!(f, "{e}"),
        }
    }
}

enum Lifecycle {
    /// Created, not yet started.
    Idle,
    /// Own receive loop running.
    Running {
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    /// Datagram server session, driven by the server loop.
    Detached,
    /// Disposed; terminal.
    Disposed,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    role: Role,
    peer: SocketAddr,
    link: Link,
    tags: Mutex<TagTable<ResponseHandler>>,
    events: EventHub,
    associated: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    running: AtomicBool,
    disposed: AtomicBool,
    span: tracing::Span,
}

/// Bidirectional message endpoint over one transport.
///
/// Clones share the same underlying connection. A running receive loop
/// holds a clone of its own, so dropping every handle does not close the
/// socket; call [`dispose`](Connection::dispose).
///
/// # Example
///
/// ```ignore
/// let provider = Provider::stream(41249);
/// let client = provider.create_client("127.0.0.1".parse()?);
/// let mut events = client.subscribe();
/// client.start().await?;
///
/// client.send_notification(b"hello").await?;
/// let reply = client.request(b"status").await?;
///
/// while let Some(event) = events.recv().await {
///     if let Event::Transaction(tx) = event {
///         tx.send_response(b"ok").await?;
///     }
/// }
/// client.dispose().await;
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    fn with_link(
        role: Role,
        peer: SocketAddr,
        link: Link,
        lifecycle: Lifecycle,
        config: &ProviderConfig,
    ) -> Self {
        let id = ConnectionId::next();
        let transport = match link {
            Link::Stream(_) => TransportKind::Stream,
            Link::Datagram(_) => TransportKind::Datagram,
        };
        let span = tracing::info_span!(
            "connection",
            id = %id,
            role = %role,
            transport = %transport,
            peer = %peer
        );
        let running = matches!(lifecycle, Lifecycle::Detached);

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                role,
                peer,
                link,
                tags: Mutex::new(TagTable::new(role.tag_base())),
                events: EventHub::new(config.event_capacity),
                associated: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(lifecycle),
                running: AtomicBool::new(running),
                disposed: AtomicBool::new(false),
                span,
            }),
        }
    }

    /// Client connection, not yet started.
    pub(crate) fn client(peer: SocketAddr, config: &ProviderConfig) -> Self {
        let link = match config.transport {
            TransportKind::Stream => Link::Stream(StreamLink::idle()),
            TransportKind::Datagram => Link::Datagram(DatagramLink::idle(config.keepalive)),
        };
        Self::with_link(Role::Client, peer, link, Lifecycle::Idle, config)
    }

    /// Server-role stream connection wrapping an accepted socket.
    pub(crate) fn accepted(stream: TcpStream, peer: SocketAddr, config: &ProviderConfig) -> Self {
        let link = Link::Stream(StreamLink::accepted(stream));
        Self::with_link(Role::Server, peer, link, Lifecycle::Idle, config)
    }

    /// Server-role datagram session sharing the server's socket.
    pub(crate) fn session(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        config: &ProviderConfig,
    ) -> Self {
        let link = Link::Datagram(DatagramLink::session(socket, config.keepalive));
        Self::with_link(Role::Server, peer, link, Lifecycle::Detached, config)
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Role of this connection.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Transport this connection runs over.
    pub fn transport(&self) -> TransportKind {
        match self.inner.link {
            Link::Stream(_) => TransportKind::Stream,
            Link::Datagram(_) => TransportKind::Datagram,
        }
    }

    /// Remote IP address.
    pub fn address(&self) -> IpAddr {
        self.inner.peer.ip()
    }

    /// Remote endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Check if the receive path is live.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Check if `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Number of our transactions still awaiting a response.
    pub fn pending_transactions(&self) -> usize {
        self.inner.tags.lock().pending()
    }

    /// Subscribe to this connection's events.
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Attach caller data to this connection, replacing any previous value.
    pub fn set_associated_data<T: Any + Send + Sync>(&self, data: T) {
        *self.inner.associated.lock() = Some(Arc::new(data));
    }

    /// Get the attached data if it is a `T`.
    pub fn associated_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.inner.associated.lock().clone()?;
        data.downcast::<T>().ok()
    }

    /// Remove attached data.
    pub fn clear_associated_data(&self) {
        self.inner.associated.lock().take();
    }

    /// Establish the connection and start receiving.
    ///
    /// Clients connect (stream) or bind and send a first probe (datagram).
    /// Accepted stream connections just start their receive loop. Datagram
    /// server sessions are driven by their server and are always started.
    ///
    /// # Errors
    ///
    /// - [`NetError::AlreadyConnected`] / [`NetError::AlreadyStarted`] on a
    ///   second call.
    /// - [`NetError::Disposed`] after `dispose`.
    /// - I/O errors from connect or bind; nothing is left half-open.
    pub async fn start(&self) -> NetResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Disposed => return Err(NetError::Disposed),
            _ if self.inner.role == Role::Client => return Err(NetError::AlreadyConnected),
            _ => return Err(NetError::AlreadyStarted),
        }

        let (shutdown, task) = match &self.inner.link {
            Link::Stream(link) => {
                let reader = match self.inner.role {
                    Role::Client => link.connect(self.inner.peer).await?,
                    Role::Server => link.take_reader().ok_or(NetError::NotConnected)?,
                };
                self.spawn_loop(super::stream::receive_loop(self.clone(), reader))
            }
            Link::Datagram(link) => {
                let socket = link.bind_and_connect(self.inner.peer).await?;
                if let Err(e) = self.send_probe().await {
                    link.release();
                    return Err(e);
                }
                let interval = link.probe_interval();
                self.spawn_loop(super::datagram::receive_loop(self.clone(), socket, interval))
            }
        };

        self.inner.running.store(true, Ordering::Release);
        *lifecycle = Lifecycle::Running { shutdown, task };

        tracing::info!(parent: &self.inner.span, "connection started");
        Ok(())
    }

    fn spawn_loop<F>(&self, body: F) -> (oneshot::Sender<()>, JoinHandle<()>)
    where
        F: Future<Output = DropReason> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connection = self.clone();

        let task = tokio::spawn(
            async move {
                let reason = tokio::select! {
                    _ = &mut shutdown_rx => DropReason::Disposed,
                    reason = body => reason,
                };
                connection.finish(reason, shutdown_rx).await;
            }
            .instrument(self.inner.span.clone()),
        );

        (shutdown_tx, task)
    }

    /// Runs on the loop task after its body has returned.
    async fn finish(&self, reason: DropReason, mut shutdown: oneshot::Receiver<()>) {
        self.inner.running.store(false, Ordering::Release);
        self.abandon_pending();

        let event = Event::ConnectionDropped(self.clone());
        if let DropReason::Disposed = reason {
            tracing::info!("receive loop stopped");
            self.inner.events.publish_now(event);
            return;
        }

        tracing::warn!(reason = %reason, "connection dropped");
        self.inner.link.release().await;
        tokio::select! {
            _ = &mut shutdown => self.inner.events.publish_now(Event::ConnectionDropped(self.clone())),
            _ = self.inner.events.publish(event) => {}
        }
    }

    /// Stop receiving and release the socket.
    ///
    /// Safe to call more than once. The receive loop is joined before the
    /// socket is released, so the loop never touches a released socket.
    pub async fn dispose(&self) {
        let previous = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Disposed)
        };
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        match previous {
            Lifecycle::Running { shutdown, task } => {
                let _ = shutdown.send(());
                if let Err(e) = task.await {
                    tracing::warn!(parent: &self.inner.span, error = %e, "receive loop panicked");
                }
            }
            Lifecycle::Detached => {
                // Expired sessions already reported their drop.
                if self.inner.running.swap(false, Ordering::AcqRel) {
                    self.abandon_pending();
                    self.inner
                        .events
                        .publish_now(Event::ConnectionDropped(self.clone()));
                }
            }
            Lifecycle::Idle | Lifecycle::Disposed => {}
        }

        self.inner.link.release().await;
        tracing::info!(parent: &self.inner.span, "connection disposed");
    }

    /// Send a notification.
    pub async fn send_notification(&self, payload: impl AsRef<[u8]>) -> NetResult<()> {
        let payload = payload.as_ref();
        let wire = encode_frame(NOTIFICATION_TAG, payload)?;
        tracing::debug!(parent: &self.inner.span, len = payload.len(), "sending notification");
        self.send_wire(&wire).await
    }

    /// Send a transaction; `on_response` runs once the matching response
    /// arrives.
    ///
    /// Returns the tag allocated to the transaction. There is no timeout: if
    /// the peer never responds, `on_response` never runs. If the connection
    /// drops first, `on_response` is dropped without running.
    pub async fn send_transaction<F>(&self, command: impl AsRef<[u8]>, on_response: F) -> NetResult<i32>
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        let command = command.as_ref();
        let tag = self.inner.tags.lock().allocate(Box::new(on_response))?;

        let sent = match encode_frame(tag, command) {
            Ok(wire) => self.send_wire(&wire).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.inner.tags.lock().complete(tag);
            return Err(e);
        }

        tracing::debug!(parent: &self.inner.span, tag, len = command.len(), "sent transaction");
        Ok(tag)
    }

    /// Send a transaction and wait for its response.
    ///
    /// Fails with [`NetError::ConnectionDropped`] if the connection ends
    /// first. Wrap in `tokio::time::timeout` to bound the wait.
    pub async fn request(&self, command: impl AsRef<[u8]>) -> NetResult<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.send_transaction(command, move |response| {
            let _ = tx.send(response);
        })
        .await?;
        rx.await.map_err(|_| NetError::ConnectionDropped)
    }

    pub(crate) async fn send_response(&self, tag: i32, response: &[u8]) -> NetResult<()> {
        let wire = encode_frame(tag, response)?;
        tracing::debug!(parent: &self.inner.span, tag, len = response.len(), "sending response");
        self.send_wire(&wire).await
    }

    /// Send a zero-length keep-alive probe.
    pub(crate) async fn send_probe(&self) -> NetResult<()> {
        self.send_wire(&[]).await
    }

    async fn send_wire(&self, wire: &[u8]) -> NetResult<()> {
        match &self.inner.link {
            Link::Stream(link) => link.send(wire).await,
            Link::Datagram(link) => link.send(wire, self.inner.peer, self.inner.role).await,
        }
    }

    /// Classify an inbound frame.
    ///
    /// Responses to our transactions run their continuation here and yield
    /// no event.
    pub(crate) fn route(&self, frame: Frame) -> Option<Event> {
        if frame.is_notification() {
            return Some(Event::Notification {
                connection: self.clone(),
                payload: frame.payload,
            });
        }

        let handler = self.inner.tags.lock().complete(frame.tag);
        match handler {
            Some(handler) => {
                tracing::debug!(parent: &self.inner.span, tag = frame.tag, "response received");
                handler(frame.payload);
                None
            }
            None => Some(Event::Transaction(Transaction::new(
                self,
                frame.tag,
                frame.payload,
            ))),
        }
    }

    /// Decode one datagram. Any datagram, even a malformed one, counts as
    /// proof of life.
    pub(crate) fn ingest_datagram(&self, data: &[u8]) -> Option<Event> {
        let Link::Datagram(link) = &self.inner.link else {
            return None;
        };
        link.on_datagram();

        if data.is_empty() {
            tracing::trace!(parent: &self.inner.span, "probe received");
            return None;
        }

        match Frame::decode_datagram(data) {
            Ok(frame) => self.route(frame),
            Err(e) => {
                tracing::warn!(parent: &self.inner.span, error = %e, "discarding malformed datagram");
                None
            }
        }
    }

    /// Advance the keep-alive clock one tick.
    ///
    /// Disposed sessions report expiry so their owner prunes them.
    pub(crate) fn keepalive_tick(&self) -> KeepAliveAction {
        if self.is_disposed() {
            return KeepAliveAction::Expired;
        }
        match &self.inner.link {
            Link::Datagram(link) => link.tick(),
            Link::Stream(_) => KeepAliveAction::Probe,
        }
    }

    /// Publish to this connection's subscribers.
    pub(crate) async fn publish(&self, event: Event) {
        self.inner.events.publish(event).await;
    }

    /// End a server-driven datagram session after keep-alive expiry.
    ///
    /// Returns `false` if the session was already stopped by `dispose` or an
    /// earlier expiry; only the caller that stops it reports the drop.
    pub(crate) fn expire(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.abandon_pending();
        if let Link::Datagram(link) = &self.inner.link {
            link.release();
        }
        tracing::warn!(parent: &self.inner.span, "session expired");
        true
    }

    fn abandon_pending(&self) {
        let abandoned = self.inner.tags.lock().abandon_all();
        if !abandoned.is_empty() {
            tracing::debug!(
                parent: &self.inner.span,
                count = abandoned.len(),
                "abandoning pending transactions"
            );
        }
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.inner.span
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("transport", &self.transport())
            .field("peer", &self.inner.peer)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Link {
    async fn release(&self) {
        match self {
            Link::Stream(link) => link.release().await,
            Link::Datagram(link) => link.release(),
        }
    }
}
