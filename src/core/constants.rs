//! Protocol constants for NetComms.
//!
//! Wire-level values are shared by every peer and MUST NOT be changed
//! without breaking compatibility. Keep-alive values are defaults only and
//! can be overridden through [`ProviderConfig`](super::ProviderConfig).

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Frame header size: 4 (length) + 4 (tag).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum accepted payload length in bytes.
///
/// Frames declaring more than this (or a negative length) are a protocol
/// violation.
pub const MAX_PAYLOAD_SIZE: usize = 32768;

/// Receive buffer for datagram sockets. Larger than any valid datagram so
/// oversize ones are observed whole and rejected instead of truncated.
pub const DATAGRAM_RECV_BUFFER_SIZE: usize = 65536;

/// Tag carried by notifications.
pub const NOTIFICATION_TAG: i32 = 0;

// =============================================================================
// TRANSACTION TAGS
// =============================================================================

/// First tag allocated by locally initiated connections.
pub const CLIENT_TAG_BASE: i32 = 0x1000_0000;

/// First tag allocated by connections accepted or observed by a server.
pub const SERVER_TAG_BASE: i32 = 0x2000_0000;

/// Tags placed in the recycle queue when a connection is created.
pub const PRESEEDED_TAGS: usize = 10;

// =============================================================================
// KEEP-ALIVE (datagram transport)
// =============================================================================

/// Missed probes tolerated before a datagram connection is declared dead.
pub const DEFAULT_PROBE_COUNT: u32 = 5;

/// Interval between keep-alive ticks.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(3000);

// =============================================================================
// SENDING
// =============================================================================

/// Longest a broadcast waits on one member before giving up on it.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// EVENTS
// =============================================================================

/// Per-subscriber event queue depth.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
