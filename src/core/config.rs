//! Provider configuration.
//!
//! A [`ProviderConfig`] binds a transport kind to a port and carries the
//! datagram keep-alive parameters. Build one with [`ProviderConfigBuilder`]
//! or read it from the environment with [`ProviderConfig::from_env`].

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use super::constants::{
    DEFAULT_EVENT_CAPACITY, DEFAULT_PROBE_COUNT, DEFAULT_PROBE_INTERVAL, DEFAULT_SEND_TIMEOUT,
};
use super::error::{NetError, NetResult};

/// Underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Reliable byte stream (TCP).
    #[default]
    Stream,
    /// Unreliable datagrams (UDP) with keep-alive probing.
    Datagram,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("tcp"),
            TransportKind::Datagram => f.write_str("udp"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "stream" => Ok(TransportKind::Stream),
            "udp" | "datagram" => Ok(TransportKind::Datagram),
            other => Err(NetError::Config(format!("unknown transport: {other}"))),
        }
    }
}

/// Keep-alive parameters for datagram connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Missed probes tolerated before the connection is dead.
    pub probe_count: u32,
    /// Time between keep-alive ticks.
    pub probe_interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            probe_count: DEFAULT_PROBE_COUNT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

impl KeepAliveConfig {
    /// Approximate silence after which a peer is declared dead.
    pub fn detection_window(&self) -> Duration {
        self.probe_interval * (self.probe_count + 1)
    }
}

/// Provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Transport used by clients and servers from this provider.
    pub transport: TransportKind,

    /// Port servers bind to and clients connect to. Port 0 lets a server
    /// pick an ephemeral port.
    pub port: u16,

    /// Local address servers bind to.
    ///
    /// Defaults to `0.0.0.0`, which accepts IPv4 peers only. Set `::` to
    /// accept IPv6 peers; whether that socket also accepts IPv4 follows the
    /// host's dual-stack default (on by default on Linux).
    pub bind_ip: IpAddr,

    /// Datagram keep-alive parameters (ignored for streams).
    pub keepalive: KeepAliveConfig,

    /// Queue depth of each event subscriber.
    pub event_capacity: usize,

    /// Longest a server broadcast waits on a single member. A member that
    /// does not accept the frame in time is skipped and disposed.
    pub send_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stream,
            port: 0,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            keepalive: KeepAliveConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl ProviderConfig {
    /// Read configuration from `NETCOMMS_*` environment variables.
    ///
    /// - `NETCOMMS_TRANSPORT`: `tcp`/`stream` or `udp`/`datagram`
    /// - `NETCOMMS_PORT`: port number
    /// - `NETCOMMS_BIND_IP`: server bind address
    /// - `NETCOMMS_PROBE_COUNT`: missed probes before a datagram peer is dead
    /// - `NETCOMMS_PROBE_INTERVAL_MS`: keep-alive tick in milliseconds
    /// - `NETCOMMS_EVENT_CAPACITY`: per-subscriber queue depth
    /// - `NETCOMMS_SEND_TIMEOUT_MS`: per-member broadcast deadline in milliseconds
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> NetResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> NetResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("NETCOMMS_TRANSPORT") {
            config.transport = value.parse()?;
        }
        if let Some(value) = lookup("NETCOMMS_PORT") {
            config.port = parse_var("NETCOMMS_PORT", &value)?;
        }
        if let Some(value) = lookup("NETCOMMS_BIND_IP") {
            config.bind_ip = parse_var("NETCOMMS_BIND_IP", &value)?;
        }
        if let Some(value) = lookup("NETCOMMS_PROBE_COUNT") {
            config.keepalive.probe_count = parse_var("NETCOMMS_PROBE_COUNT", &value)?;
        }
        if let Some(value) = lookup("NETCOMMS_PROBE_INTERVAL_MS") {
            let millis: u64 = parse_var("NETCOMMS_PROBE_INTERVAL_MS", &value)?;
            config.keepalive.probe_interval = Duration::from_millis(millis);
        }
        if let Some(value) = lookup("NETCOMMS_EVENT_CAPACITY") {
            config.event_capacity = parse_var("NETCOMMS_EVENT_CAPACITY", &value)?;
        }
        if let Some(value) = lookup("NETCOMMS_SEND_TIMEOUT_MS") {
            let millis: u64 = parse_var("NETCOMMS_SEND_TIMEOUT_MS", &value)?;
            config.send_timeout = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> NetResult<()> {
        if self.keepalive.probe_interval.is_zero() {
            return Err(NetError::Config("probe interval must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(NetError::Config("event capacity must be positive".into()));
        }
        if self.send_timeout.is_zero() {
            return Err(NetError::Config("send timeout must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> NetResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| NetError::Config(format!("{key}: invalid value {value:?}")))
}

/// Builder for creating a [`ProviderConfig`].
#[derive(Debug)]
pub struct ProviderConfigBuilder {
    config: ProviderConfig,
}

impl ProviderConfigBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self {
            config: ProviderConfig::default(),
        }
    }

    /// Set the transport.
    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.config.transport = transport;
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the server bind address.
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.config.bind_ip = ip;
        self
    }

    /// Set the number of missed probes tolerated.
    pub fn probe_count(mut self, count: u32) -> Self {
        self.config.keepalive.probe_count = count;
        self
    }

    /// Set the keep-alive tick interval.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive.probe_interval = interval;
        self
    }

    /// Set the per-subscriber event queue depth.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Set the per-member broadcast deadline.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> NetResult<ProviderConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ProviderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
