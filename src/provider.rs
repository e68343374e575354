//! Provider: the factory binding a transport to a port.
//!
//! Application code picks a transport once, when it builds the provider,
//! and otherwise deals only in [`Connection`]s and [`Server`]s.

use std::net::{IpAddr, SocketAddr};

use crate::connection::Connection;
use crate::core::{NetResult, ProviderConfig, ProviderConfigBuilder, TransportKind};
use crate::server::Server;

/// Factory for clients and servers sharing one transport and port.
///
/// # Example
///
/// ```ignore
/// let provider = Provider::new(ProviderConfig::from_env()?)?;
/// let server = provider.create_server();
/// server.start().await?;
///
/// let client = provider.create_client("127.0.0.1".parse()?);
/// client.start().await?;
/// ```
#[derive(Debug, Clone)]
pub struct Provider {
    config: ProviderConfig,
}

impl Provider {
    /// Create a provider from a validated configuration.
    pub fn new(config: ProviderConfig) -> NetResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Stream (TCP) provider on `port` with default settings.
    pub fn stream(port: u16) -> Self {
        Self::with_defaults(TransportKind::Stream, port)
    }

    /// Datagram (UDP) provider on `port` with default keep-alive settings.
    pub fn datagram(port: u16) -> Self {
        Self::with_defaults(TransportKind::Datagram, port)
    }

    fn with_defaults(transport: TransportKind, port: u16) -> Self {
        let config = ProviderConfig {
            transport,
            port,
            ..ProviderConfig::default()
        };
        Self { config }
    }

    /// Start a builder.
    pub fn builder() -> ProviderConfigBuilder {
        ProviderConfigBuilder::new()
    }

    /// Configuration in use.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Transport in use.
    pub fn transport(&self) -> TransportKind {
        self.config.transport
    }

    /// Create a client connection to `address` on the provider's port.
    ///
    /// Nothing touches the network until [`Connection::start`].
    pub fn create_client(&self, address: IpAddr) -> Connection {
        let peer = SocketAddr::new(address, self.config.port);
        tracing::debug!(peer = %peer, transport = %self.config.transport, "creating client");
        Connection::client(peer, &self.config)
    }

    /// Create a server on the provider's port.
    ///
    /// Nothing is bound until [`Server::start`].
    pub fn create_server(&self) -> Server {
        Server::new(self.config.clone())
    }
}
