//! Core constants, configuration and error types.

pub mod config;
pub mod constants;
pub mod error;

pub use config::{KeepAliveConfig, ProviderConfig, ProviderConfigBuilder, TransportKind};
pub use error::{NetError, NetResult};
