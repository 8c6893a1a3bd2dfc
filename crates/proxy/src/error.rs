//! Error types for the proxy

use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that stop the proxy from starting or keep it from serving
///
/// Failures inside a single session never surface here; they end that
/// session with a [`CloseReason`](crate::CloseReason) instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid, malformed or mismatched TLS material or settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// The listen socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The accept loop hit a non-recoverable listener error
    #[error("Listener closed: {0}")]
    ListenerClosed(#[source] std::io::Error),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The accept loop task panicked or was aborted
    #[error("Proxy task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<rustls::Error> for ProxyError {
    fn from(e: rustls::Error) -> Self {
        ProxyError::Config(format!("TLS: {e}"))
    }
}

impl From<config::ConfigError> for ProxyError {
    fn from(e: config::ConfigError) -> Self {
        ProxyError::Config(e.to_string())
    }
}

/// Check if an error is just the peer going away
pub fn is_connection_closed_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_connection_closed_kinds() {
        assert!(is_connection_closed_error(&Error::from(ErrorKind::ConnectionReset)));
        assert!(is_connection_closed_error(&Error::from(ErrorKind::BrokenPipe)));
        assert!(!is_connection_closed_error(&Error::from(ErrorKind::PermissionDenied)));
    }

    #[test]
    fn test_bind_error_display() {
        let err = ProxyError::Bind {
            addr: ([127, 0, 0, 1], 443).into(),
            source: Error::from(ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("Failed to bind 127.0.0.1:443"));
    }
}
