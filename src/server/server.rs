//! Server handle.
//!
//! A [`Server`] owns a listening socket and the set of connections it has
//! produced. Stream servers run an accept loop and give every peer its own
//! connection with its own receive loop. Datagram servers run one receive
//! loop on the shared socket and demultiplex by remote endpoint.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::connection::Connection;
use crate::core::constants::MAX_PAYLOAD_SIZE;
use crate::core::{NetError, NetResult, ProviderConfig, TransportKind};
use crate::events::{Event, EventHub, EventStream};
use crate::transport::FrameError;

enum Lifecycle {
    Idle,
    Running {
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    Stopped,
}

pub(crate) struct ServerShared {
    pub(super) config: ProviderConfig,
    pub(super) events: EventHub,
    /// Live members by remote endpoint.
    pub(super) peers: Mutex<HashMap<SocketAddr, Connection>>,
    /// Stream only: tasks relaying member events to server subscribers.
    pub(super) forwarders: Mutex<JoinSet<()>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
    span: tracing::Span,
}

impl ServerShared {
    /// Remove `connection` unless its endpoint already maps to a newer one.
    pub(super) fn remove_peer(&self, connection: &Connection) -> bool {
        let mut peers = self.peers.lock();
        match peers.get(&connection.peer_addr()) {
            Some(current) if current == connection => {
                peers.remove(&connection.peer_addr());
                true
            }
            _ => false,
        }
    }
}

/// Listening endpoint producing server-role connections.
///
/// Clones share the same server. Call [`dispose`](Server::dispose) to stop
/// it; dropping the last handle stops the listening loop but leaves stream
/// members open until their peers close.
///
/// # Example
///
/// ```ignore
/// let server = Provider::stream(41249).create_server();
/// let mut events = server.subscribe();
/// server.start().await?;
///
/// while let Some(event) = events.recv().await {
///     match event {
///         Event::NewConnection(conn) => println!("{} joined", conn.peer_addr()),
///         Event::Notification { payload, .. } => {
///             server.send_notification(&payload).await?;
///         }
///         Event::Transaction(tx) => tx.send_response(b"ok").await?,
///         Event::ConnectionDropped(conn) => println!("{} left", conn.peer_addr()),
///     }
/// }
/// ```
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub(crate) fn new(config: ProviderConfig) -> Self {
        let span = tracing::info_span!(
            "server",
            transport = %config.transport,
            addr = tracing::field::Empty
        );

        Self {
            shared: Arc::new(ServerShared {
                events: EventHub::new(config.event_capacity),
                peers: Mutex::new(HashMap::new()),
                forwarders: Mutex::new(JoinSet::new()),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
                local_addr: Mutex::new(None),
                running: AtomicBool::new(false),
                config,
                span,
            }),
        }
    }

    /// Transport this server listens on.
    pub fn transport(&self) -> TransportKind {
        self.shared.config.transport
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Check if the server is listening.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of live members.
    pub fn connection_count(&self) -> usize {
        self.shared.peers.lock().len()
    }

    /// Snapshot of live members.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.peers.lock().values().cloned().collect()
    }

    /// Subscribe to server events.
    ///
    /// Server subscribers see `NewConnection`, every member's notifications
    /// and transactions, and `ConnectionDropped`.
    pub fn subscribe(&self) -> EventStream {
        self.shared.events.subscribe()
    }

    /// Bind and start listening.
    ///
    /// Binding happens before this returns, so a bind failure is reported
    /// here and [`local_addr`](Server::local_addr) is valid afterwards.
    ///
    /// # Errors
    ///
    /// - [`NetError::AlreadyStarted`] on a second call.
    /// - [`NetError::Disposed`] after `dispose`.
    /// - I/O errors from bind.
    pub async fn start(&self) -> NetResult<()> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => return Err(NetError::AlreadyStarted),
            Lifecycle::Stopped => return Err(NetError::Disposed),
        }

        let config = &self.shared.config;
        let bind = SocketAddr::new(config.bind_ip, config.port);
        let weak = Arc::downgrade(&self.shared);

        let (local, (shutdown, task)) = match config.transport {
            TransportKind::Stream => {
                let listener = TcpListener::bind(bind).await?;
                let local = listener.local_addr()?;
                (local, self.spawn_loop(super::stream::accept_loop(weak, listener)))
            }
            TransportKind::Datagram => {
                let socket = Arc::new(UdpSocket::bind(bind).await?);
                let local = socket.local_addr()?;
                let interval = config.keepalive.probe_interval;
                (
                    local,
                    self.spawn_loop(super::datagram::receive_loop(weak, socket, interval)),
                )
            }
        };

        *self.shared.local_addr.lock() = Some(local);
        self.shared.span.record("addr", tracing::field::display(local));
        self.shared.running.store(true, Ordering::Release);
        *lifecycle = Lifecycle::Running { shutdown, task };

        tracing::info!(parent: &self.shared.span, "server listening");
        Ok(())
    }

    fn spawn_loop<F>(&self, body: F) -> (oneshot::Sender<()>, JoinHandle<()>)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(
            async move {
                // A dropped sender counts as shutdown too.
                tokio::select! {
                    _ = shutdown_rx => {}
                    _ = body => {}
                }
                tracing::info!("server loop stopped");
            }
            .instrument(self.shared.span.clone()),
        );

        (shutdown_tx, task)
    }

    /// Broadcast a notification to every live member.
    ///
    /// Members are sent to concurrently, each bounded by
    /// [`send_timeout`](ProviderConfig::send_timeout), and the call returns
    /// how many accepted the frame. A failing member is logged and skipped;
    /// one that times out is also disposed, since a half-written frame
    /// leaves its stream unusable. Neither stops delivery to the rest.
    ///
    /// # Errors
    ///
    /// Only an oversize payload fails the call as a whole.
    pub async fn send_notification(&self, payload: impl AsRef<[u8]>) -> NetResult<usize> {
        let payload = payload.as_ref();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
            }
            .into());
        }

        let payload = Bytes::copy_from_slice(payload);
        let deadline = self.shared.config.send_timeout;
        let members = self.connections();
        let total = members.len();

        let mut sends = JoinSet::new();
        for member in members {
            let payload = payload.clone();
            sends.spawn(async move {
                let sent = tokio::time::timeout(deadline, member.send_notification(&payload)).await;
                (member, sent)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = sends.join_next().await {
            let (member, sent) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(parent: &self.shared.span, error = %e, "broadcast send task failed");
                    continue;
                }
            };
            match sent {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::warn!(
                    parent: &self.shared.span,
                    peer = %member.peer_addr(),
                    error = %e,
                    "broadcast to member failed"
                ),
                Err(_) => {
                    tracing::warn!(
                        parent: &self.shared.span,
                        peer = %member.peer_addr(),
                        timeout = ?deadline,
                        "broadcast to member timed out, disposing it"
                    );
                    tokio::spawn(async move { member.dispose().await });
                }
            }
        }

        tracing::debug!(
            parent: &self.shared.span,
            delivered,
            members = total,
            "broadcast notification"
        );
        Ok(delivered)
    }

    /// Stop listening and dispose every member.
    ///
    /// Safe to call more than once. The listening loop is joined before any
    /// member is disposed, so no new members appear during teardown.
    pub async fn dispose(&self) {
        let previous = {
            let mut lifecycle = self.shared.lifecycle.lock().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };
        self.shared.running.store(false, Ordering::Release);

        if let Lifecycle::Running { shutdown, task } = previous {
            let _ = shutdown.send(());
            if let Err(e) = task.await {
                tracing::warn!(parent: &self.shared.span, error = %e, "server loop panicked");
            }
        }

        let mut forwarders = std::mem::take(&mut *self.shared.forwarders.lock());
        forwarders.shutdown().await;

        let members: Vec<Connection> = self.shared.peers.lock().drain().map(|(_, c)| c).collect();
        for member in members {
            member.dispose().await;
            self.shared.events.publish_now(Event::ConnectionDropped(member));
        }

        tracing::info!(parent: &self.shared.span, "server disposed");
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> std::sync::Weak<ServerShared> {
        Arc::downgrade(&self.shared)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("transport", &self.transport())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .field("running", &self.is_running())
            .finish()
    }
}
