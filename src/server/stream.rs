//! Stream server: accept loop and per-member event relay.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

use super::server::ServerShared;
use crate::connection::Connection;
use crate::events::{Event, EventStream};

/// Accept peers until shut down.
///
/// Accept errors (descriptor exhaustion, aborted handshakes) are logged and
/// the loop keeps going.
pub(super) async fn accept_loop(shared: Weak<ServerShared>, listener: TcpListener) {
    loop {
        let accepted = listener.accept().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };

        match accepted {
            Ok((stream, peer)) => shared.admit(stream, peer).await,
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}

impl ServerShared {
    async fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let connection = Connection::accepted(stream, peer, &self.config);
        let events = connection.subscribe();

        self.peers.lock().insert(peer, connection.clone());
        {
            let mut forwarders = self.forwarders.lock();
            while forwarders.try_join_next().is_some() {}
            forwarders.spawn(
                forward(Arc::downgrade(self), connection.clone(), events)
                    .instrument(connection.span().clone()),
            );
        }

        tracing::info!(peer = %peer, id = %connection.id(), "accepted connection");
        self.events
            .publish(Event::NewConnection(connection.clone()))
            .await;

        if let Err(e) = connection.start().await {
            tracing::warn!(peer = %peer, error = %e, "failed to start accepted connection");
            self.remove_peer(&connection);
            connection.dispose().await;
        }
    }
}

/// Relay one member's events to server subscribers, pruning it on drop.
async fn forward(shared: Weak<ServerShared>, connection: Connection, mut events: EventStream) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let dropped = matches!(event, Event::ConnectionDropped(_));
        if dropped {
            shared.remove_peer(&connection);
        }
        shared.events.publish(event).await;
        if dropped {
            return;
        }
    }
}
