//! Transport error taxonomy

use thiserror::Error;

/// Transport failures, as a closed set callers can branch on exhaustively.
///
/// Variants carry string detail rather than source errors so results can
/// be cloned and shared between concurrent callers awaiting one dial.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The relay rejected the bearer credential. Not retryable until the
    /// caller acquires a fresh credential.
    #[error("Credential rejected by relay")]
    CredentialRejected,

    /// The authorization policy refused access to the target. Not retryable.
    #[error("Access denied for target")]
    AccessDenied,

    /// Transient network failure reaching the relay (or the destination,
    /// for probe failures). Retryable.
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The handshake did not complete within the handshake window,
    /// including peer-initiated close mid-handshake. Retryable.
    #[error("Relay handshake timed out")]
    HandshakeTimeout,

    /// The connection failed for a reason outside the handshake window.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Malformed framing on the wire. Fatal to the whole connection.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The connection is no longer open.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The logical stream is no longer open.
    #[error("Stream closed")]
    StreamClosed,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl TransportError {
    /// Whether retrying the same operation with the same credential can
    /// reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::NetworkUnreachable(_)
                | TransportError::HandshakeTimeout
                | TransportError::ConnectionFailed(_)
                | TransportError::ConnectionClosed
        )
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::NetworkUnreachable("refused".into()).is_retryable());
        assert!(TransportError::HandshakeTimeout.is_retryable());

        assert!(!TransportError::CredentialRejected.is_retryable());
        assert!(!TransportError::AccessDenied.is_retryable());
        assert!(!TransportError::ProtocolViolation("bad frame".into()).is_retryable());
    }
}
