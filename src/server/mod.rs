//! NetComms - Servers
//!
//! [`Server`] listens on one port and turns peers into server-role
//! [`Connection`](crate::connection::Connection)s.

mod datagram;
#[allow(clippy::module_inception)]
mod server;
mod stream;

pub use server::Server;
