//! # NetComms
//!
//! Transport-agnostic message layer for client/server applications.
//!
//! NetComms carries two kinds of message over either TCP or UDP:
//!
//! - **Notifications**: fire-and-forget payloads
//! - **Transactions**: tagged requests answered by exactly one response
//!
//! Both travel in the same frame, `[length: i32 LE][tag: i32 LE][payload]`.
//! Tag 0 marks a notification; any other tag belongs to a transaction, and
//! each side allocates tags from its own range so the two never collide.
//! Over UDP every datagram carries one frame, and a keep-alive probe loop
//! detects peers that went away.
//!
//! ## Modules
//!
//! - [`core`](crate::core): Constants, configuration and error types
//! - [`transport`]: Frame codec, tag allocation, keep-alive state
//! - [`connection`]: [`Connection`] and inbound [`Transaction`]s
//! - [`server`]: [`Server`] accept loop and datagram session multiplexer
//! - [`provider`]: [`Provider`] factory binding a transport to a port
//! - [`events`]: [`Event`]s published to subscribers
//!
//! ## Example Usage
//!
//! ```no_run
//! use netcomms::prelude::*;
//!
//! # async fn run() -> NetResult<()> {
//! let provider = Provider::stream(41249);
//!
//! let server = provider.create_server();
//! let mut server_events = server.subscribe();
//! server.start().await?;
//!
//! let client = provider.create_client("127.0.0.1".parse().unwrap());
//! client.start().await?;
//! client.send_notification(b"hello").await?;
//!
//! while let Some(event) = server_events.recv().await {
//!     match event {
//!         Event::Notification { payload, .. } => {
//!             server.send_notification(&payload).await?;
//!         }
//!         Event::Transaction(tx) => tx.send_response(b"ok").await?,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod connection;
pub mod core;
pub mod events;
pub mod provider;
pub mod server;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::connection::{Connection, ConnectionId, Role, Transaction};
    pub use crate::core::*;
    pub use crate::events::{Event, EventStream};
    pub use crate::provider::Provider;
    pub use crate::server::Server;
}

// Re-export commonly used items at crate root
pub use connection::{Connection, ConnectionId, Role, Transaction};
pub use crate::core::{KeepAliveConfig, NetError, NetResult, ProviderConfig, TransportKind};
pub use events::{Event, EventStream};
pub use provider::Provider;
pub use server::Server;
pub use transport::{Frame, FrameError};
