//! Datagram server: one receive loop demultiplexing sessions by endpoint.
//!
//! A session is created the first time an endpoint is heard from, or again
//! after its previous session expired or was disposed. The loop also drives
//! every session's keep-alive on a shared tick.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::server::ServerShared;
use crate::connection::Connection;
use crate::core::constants::DATAGRAM_RECV_BUFFER_SIZE;
use crate::events::Event;
use crate::transport::KeepAliveAction;

pub(super) async fn receive_loop(
    shared: Weak<ServerShared>,
    socket: Arc<UdpSocket>,
    interval: Duration,
) {
    let mut buf = vec![0u8; DATAGRAM_RECV_BUFFER_SIZE];
    let mut next_probe = Instant::now() + interval;

    loop {
        tokio::select! {
            biased;

            _ = tokio::time::sleep_until(next_probe) => {
                next_probe = Instant::now() + interval;
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.tick_sessions().await;
            }

            received = socket.recv_from(&mut buf) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                match received {
                    Ok((len, peer)) => shared.ingest(&socket, peer, &buf[..len]).await,
                    Err(e) => tracing::debug!(error = %e, "datagram receive failed"),
                }
            }
        }
    }
}

impl ServerShared {
    /// Probe every session, pruning the ones that stayed silent too long.
    async fn tick_sessions(&self) {
        let sessions: Vec<Connection> = self.peers.lock().values().cloned().collect();

        for session in sessions {
            match session.keepalive_tick() {
                KeepAliveAction::Probe => {
                    if let Err(e) = session.send_probe().await {
                        tracing::debug!(peer = %session.peer_addr(), error = %e, "probe send failed");
                    }
                }
                KeepAliveAction::Expired => {
                    let event = Event::ConnectionDropped(session.clone());
                    // A concurrent dispose may have stopped it first.
                    if session.expire() {
                        session.publish(event.clone()).await;
                    }
                    // Already replaced by a fresh session, which reported it.
                    if self.remove_peer(&session) {
                        tracing::info!(peer = %session.peer_addr(), "session dropped");
                        self.events.publish(event).await;
                    }
                }
            }
        }
    }

    async fn ingest(&self, socket: &Arc<UdpSocket>, peer: SocketAddr, data: &[u8]) {
        let (session, created, replaced) = {
            let mut peers = self.peers.lock();
            let live = peers.get(&peer).filter(|s| s.is_running()).cloned();
            match live {
                Some(session) => (session, false, None),
                None => {
                    let session = Connection::session(socket.clone(), peer, &self.config);
                    let replaced = peers.insert(peer, session.clone());
                    (session, true, replaced)
                }
            }
        };

        if let Some(stale) = replaced {
            self.events.publish(Event::ConnectionDropped(stale)).await;
        }
        if created {
            tracing::info!(peer = %peer, id = %session.id(), "new datagram session");
            self.events
                .publish(Event::NewConnection(session.clone()))
                .await;
        }

        if let Some(event) = session.ingest_datagram(data) {
            session.publish(event.clone()).await;
            self.events.publish(event).await;
        }
    }
}
