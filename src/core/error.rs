//! Error types for NetComms.

use thiserror::Error;

use crate::transport::FrameError;

/// Top-level NetComms errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// `start` was called on a connection or server that is already running.
    #[error("already started")]
    AlreadyStarted,

    /// `start` was called on a client connection that already owns a socket.
    #[error("already connected")]
    AlreadyConnected,

    /// A second response was attempted on the same transaction.
    #[error("response already sent")]
    AlreadyResponded,

    /// No live socket to send on.
    #[error("not connected")]
    NotConnected,

    /// The connection or server has been disposed.
    #[error("disposed")]
    Disposed,

    /// The connection ended before a response arrived.
    #[error("connection dropped")]
    ConnectionDropped,

    /// Every transaction tag is in use.
    #[error("transaction tags exhausted")]
    TagsExhausted,

    /// Wire framing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Check if this error is a caller mistake rather than a runtime failure.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            NetError::AlreadyStarted
                | NetError::AlreadyConnected
                | NetError::AlreadyResponded
                | NetError::Disposed
        )
    }
}

/// Result type for NetComms operations.
pub type NetResult<T> = Result<T, NetError>;
