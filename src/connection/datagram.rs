//! Datagram (UDP) link.
//!
//! Clients own a connected socket and run their own receive loop. Server
//! sessions share the server's socket and are fed by the server loop.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::connection::{Connection, DropReason, Role};
use crate::core::constants::DATAGRAM_RECV_BUFFER_SIZE;
use crate::core::{KeepAliveConfig, NetError, NetResult};
use crate::transport::{KeepAlive, KeepAliveAction};

pub(crate) struct DatagramLink {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    keepalive: Mutex<KeepAlive>,
    config: KeepAliveConfig,
}

impl DatagramLink {
    pub(crate) fn idle(config: KeepAliveConfig) -> Self {
        Self {
            socket: RwLock::new(None),
            keepalive: Mutex::new(KeepAlive::new(&config)),
            config,
        }
    }

    pub(crate) fn session(socket: Arc<UdpSocket>, config: KeepAliveConfig) -> Self {
        Self {
            socket: RwLock::new(Some(socket)),
            keepalive: Mutex::new(KeepAlive::new(&config)),
            config,
        }
    }

    pub(crate) fn probe_interval(&self) -> Duration {
        self.config.probe_interval
    }

    /// Bind an ephemeral port in the peer's address family and connect it.
    pub(crate) async fn bind_and_connect(&self, peer: SocketAddr) -> NetResult<Arc<UdpSocket>> {
        if self.socket.read().is_some() {
            return Err(NetError::AlreadyConnected);
        }

        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        tracing::debug!(local = ?socket.local_addr().ok(), "datagram socket bound");

        let socket = Arc::new(socket);
        *self.socket.write() = Some(socket.clone());
        Ok(socket)
    }

    pub(crate) async fn send(&self, wire: &[u8], peer: SocketAddr, role: Role) -> NetResult<()> {
        let socket = self.socket.read().clone().ok_or(NetError::NotConnected)?;
        match role {
            Role::Client => socket.send(wire).await?,
            Role::Server => socket.send_to(wire, peer).await?,
        };
        Ok(())
    }

    pub(crate) fn on_datagram(&self) {
        self.keepalive.lock().on_datagram();
    }

    pub(crate) fn tick(&self) -> KeepAliveAction {
        self.keepalive.lock().tick()
    }

    pub(crate) fn release(&self) {
        self.socket.write().take();
    }
}

/// Client receive loop: probe on every tick, expire after too many silent
/// ticks, decode everything else.
pub(crate) async fn receive_loop(
    connection: Connection,
    socket: Arc<UdpSocket>,
    interval: Duration,
) -> DropReason {
    let mut buf = vec![0u8; DATAGRAM_RECV_BUFFER_SIZE];
    let mut next_probe = Instant::now() + interval;

    loop {
        tokio::select! {
            biased;

            _ = tokio::time::sleep_until(next_probe) => {
                next_probe = Instant::now() + interval;
                match connection.keepalive_tick() {
                    KeepAliveAction::Expired => return DropReason::Expired,
                    KeepAliveAction::Probe => {
                        if let Err(e) = connection.send_probe().await {
                            tracing::debug!(error = %e, "probe send failed");
                        }
                    }
                }
            }

            received = socket.recv(&mut buf) => match received {
                Ok(len) => {
                    if let Some(event) = connection.ingest_datagram(&buf[..len]) {
                        connection.publish(event).await;
                    }
                }
                // ICMP unreachable and friends surface here; keep-alive
                // decides when the peer is gone.
                Err(e) => tracing::debug!(error = %e, "datagram receive failed"),
            },
        }
    }
}
