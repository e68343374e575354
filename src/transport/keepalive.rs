//! Keep-alive state machine for datagram connections.
//!
//! Datagram sockets give no signal when the peer goes away, so each side
//! probes on a fixed tick and counts ticks that pass without hearing
//! anything back. Any inbound datagram, probe or real traffic, resets the
//! count.
//!
//! ```text
//!            tick (missed <= threshold) / send probe
//!           ┌──────┐
//!           ▼      │
//!        ┌──────────┐  tick (missed > threshold)  ┌──────┐
//!  ───▶  │  Alive   │ ──────────────────────────▶ │ Dead │
//!        └──────────┘                             └──────┘
//!           ▲      │
//!           └──────┘
//!           datagram / missed = 0
//! ```

use crate::core::KeepAliveConfig;

/// What the owner should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Still alive; send a probe.
    Probe,
    /// Too many missed probes; the connection is dead.
    Expired,
}

/// Per-connection keep-alive state.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    /// Ticks since the last inbound datagram.
    missed: u32,
    /// Missed ticks tolerated.
    threshold: u32,
    /// Latched once expired.
    dead: bool,
}

impl KeepAlive {
    /// Create a new keep-alive tracker.
    pub fn new(config: &KeepAliveConfig) -> Self {
        Self {
            missed: 0,
            threshold: config.probe_count,
            dead: false,
        }
    }

    /// Record an inbound datagram of any kind.
    pub fn on_datagram(&mut self) {
        self.missed = 0;
    }

    /// Advance one tick.
    pub fn tick(&mut self) -> KeepAliveAction {
        if self.dead {
            return KeepAliveAction::Expired;
        }

        self.missed = self.missed.saturating_add(1);
        if self.missed > self.threshold {
            self.dead = true;
            KeepAliveAction::Expired
        } else {
            KeepAliveAction::Probe
        }
    }

    /// Ticks since the last inbound datagram.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Check if the connection has been declared dead.
    #[cfg(test)]
    pub fn is_dead(&self) -> bool {
        self.dead
    }
}
