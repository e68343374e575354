//! NetComms - Connections
//!
//! One [`Connection`] type covers both transports and both roles. Stream
//! connections run a receive loop over the read half of a TCP socket;
//! datagram clients run a receive loop with keep-alive probing; datagram
//! server sessions are fed by their [`Server`](crate::server::Server).

#[allow(clippy::module_inception)]
mod connection;
mod datagram;
mod stream;
mod transaction;

pub use connection::{Connection, ConnectionId, Role};
pub use transaction::Transaction;
