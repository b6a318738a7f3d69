//! Pool-level error types.

use thiserror::Error;

/// Errors surfaced by the channel pool and client connections.
///
/// Channel-level unhealthiness never appears here when recovery succeeds;
/// callers only see an error when a fresh channel cannot be established.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The backend could not be reached or the handshake failed.
    #[error("connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },

    /// Channel construction exceeded the configured connect timeout.
    #[error("connect to {address} timed out after {ms}ms")]
    ConnectTimeout { address: String, ms: u64 },

    /// An address string could not be parsed as `host:port`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A logical service name has no known address.
    #[error("cannot resolve service name: {0}")]
    Resolve(String),

    /// The pool has been shut down and no longer hands out channels.
    #[error("channel pool is shut down")]
    ShutDown,

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PoolError {
    /// Returns `true` if a later attempt against the same address may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectTimeout { .. } | Self::Io(_)
        )
    }

    /// Shorthand used by transports to build a [`PoolError::Connection`].
    pub fn connection(address: impl ToString, reason: impl ToString) -> Self {
        Self::Connection {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}
