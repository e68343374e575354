//! Events published by connections and servers.
//!
//! Observers call `subscribe()` on a [`Connection`] or [`Server`] and read
//! [`Event`]s from the returned [`EventStream`]. Every subscriber gets its own
//! bounded queue; a full queue makes the publishing loop wait, which stalls
//! only the connection (or datagram server) feeding it.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use bytes::Bytes;

use crate::connection::{Connection, Transaction};

/// Event delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A server accepted a stream peer or saw a datagram from a new endpoint.
    NewConnection(Connection),

    /// A connection ended: peer closed, protocol violation, transport error,
    /// keep-alive expiry or local disposal.
    ConnectionDropped(Connection),

    /// Fire-and-forget message from the peer.
    Notification {
        /// Connection it arrived on.
        connection: Connection,
        /// Message body.
        payload: Bytes,
    },

    /// Request from the peer awaiting exactly one response.
    Transaction(Transaction),
}

impl Event {
    /// Connection this event concerns.
    pub fn connection(&self) -> Option<Connection> {
        match self {
            Event::NewConnection(connection)
            | Event::ConnectionDropped(connection)
            | Event::Notification { connection, .. } => Some(connection.clone()),
            Event::Transaction(transaction) => transaction.connection(),
        }
    }
}

/// Receiving half of an event subscription.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Receive the next event.
    ///
    /// Returns `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Receive an event if one is queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out list of subscribers.
#[derive(Debug)]
pub(crate) struct EventHub {
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
    capacity: usize,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        EventStream { rx }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Deliver to every subscriber, waiting for queue space.
    pub(crate) async fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock().clone();
        let mut stale = false;

        for tx in &subscribers {
            if tx.send(event.clone()).await.is_err() {
                stale = true;
            }
        }

        if stale {
            self.subscribers.lock().retain(|tx| !tx.is_closed());
        }
    }

    /// Deliver without waiting; full queues miss the event.
    pub(crate) fn publish_now(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("event queue full, dropping {}", event.kind());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::NewConnection(_) => "NewConnection",
            Event::ConnectionDropped(_) => "ConnectionDropped",
            Event::Notification { .. } => "Notification",
            Event::Transaction(_) => "Transaction",
        }
    }
}
