//! Client error types.

use dbwire_protocol::{ContentError, HostDescription, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the communication layer.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connecting to {host} timed out after {timeout:?}")]
    ConnectTimeout {
        host: HostDescription,
        timeout: Duration,
    },

    #[error("no connection to {host} became available within {timeout:?}")]
    PoolExhausted {
        host: HostDescription,
        timeout: Duration,
    },

    #[error("host {0} is draining")]
    HostDraining(HostDescription),

    #[error("no hosts available")]
    NoHosts,

    #[error("cluster topology unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("conversation already active for context {0}")]
    ConversationAlreadyActive(uuid::Uuid),

    #[error("conversation is owned by another execution context")]
    ConcurrentModification,

    #[error("conversation already closed")]
    ConversationClosed,

    #[error("content error: {0}")]
    Serde(#[from] ContentError),

    #[error("configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("authentication rejected with status {0}")]
    AuthFailed(u16),

    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("communication closed")]
    Closed,
}

impl CommError {
    /// Returns whether this error comes from the transport itself
    /// (open, write or read failure).
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            CommError::Io(_)
                | CommError::ConnectionClosed
                | CommError::ConnectTimeout { .. }
                | CommError::TlsHandshake(_)
        )
    }

    /// Returns whether a caller may reasonably retry the request.
    ///
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        self.is_connection_error()
            || matches!(
                self,
                CommError::PoolExhausted { .. } | CommError::HostDraining(_) | CommError::NoHosts
            )
    }
}
