//! NetComms - Transport layer
//!
//! Pieces shared by both transports and both connection roles:
//!
//! - **Frame encoding/decoding**: [`Frame`], [`encode_frame`], [`read_frame`]
//! - **Tag allocation**: [`TagTable`] pairs outgoing requests with responses
//! - **Liveness**: [`KeepAlive`] for datagram peers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Provider / Server / Connection   │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   frames, tags, keep-alive              │
//! ├─────────────────────────────────────────┤
//! │            TCP  |  UDP                  │
//! └─────────────────────────────────────────┘
//! ```

mod frame;
mod keepalive;
mod tags;

pub use frame::*;
pub use keepalive::{KeepAlive, KeepAliveAction};
pub use tags::TagTable;
