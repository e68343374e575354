//! Inbound transactions.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;

use super::connection::{Connection, ConnectionInner};
use crate::core::{NetError, NetResult};

/// Request received from the peer, answerable exactly once.
///
/// Holds only a weak reference to its connection; a transaction kept around
/// after the connection is gone cannot be answered.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

struct TransactionInner {
    tag: i32,
    command: Bytes,
    connection: Weak<ConnectionInner>,
    responded: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(connection: &Connection, tag: i32, command: Bytes) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                tag,
                command,
                connection: connection.downgrade(),
                responded: AtomicBool::new(false),
            }),
        }
    }

    /// Tag the response will carry.
    pub fn tag(&self) -> i32 {
        self.inner.tag
    }

    /// Request payload.
    pub fn command(&self) -> &Bytes {
        &self.inner.command
    }

    /// Connection the request arrived on, if it still exists.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connection.upgrade().map(Connection::from_inner)
    }

    /// Check if a response has been sent (or attempted).
    pub fn is_responded(&self) -> bool {
        self.inner.responded.load(Ordering::Acquire)
    }

    /// Send the response.
    ///
    /// # Errors
    ///
    /// - [`NetError::AlreadyResponded`] if called before, even if the first
    ///   attempt failed to transmit.
    /// - [`NetError::NotConnected`] if the connection is gone.
    pub async fn send_response(&self, response: impl AsRef<[u8]>) -> NetResult<()> {
        if self.inner.responded.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyResponded);
        }
        let connection = self.connection().ok_or(NetError::NotConnected)?;
        connection.send_response(self.inner.tag, response.as_ref()).await
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tag", &self.inner.tag)
            .field("len", &self.inner.command.len())
            .field("responded", &self.is_responded())
            .finish()
    }
}
