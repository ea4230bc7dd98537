//! Client-side error types

use thiserror::Error;
use vmrelay_transport::TransportError;

/// Failures surfaced by the tunnel and broker layers.
///
/// Clone-able so one dial result can be delivered to every caller that
/// joined the attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TunnelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The loopback listener could not be bound.
    #[error("Failed to bind local listener: {0}")]
    Bind(String),

    /// The caller's wait elapsed. Only that caller's wait is cancelled;
    /// a shared dial keeps running for the remaining waiters.
    #[error("Timed out waiting for tunnel")]
    Timeout,

    /// The tunnel went away while the operation was in flight.
    #[error("Tunnel lost: {0}")]
    TunnelLost(String),

    /// The broker is shutting down and accepts no new work.
    #[error("Broker is shut down")]
    ShuttingDown,
}

pub type TunnelResult<T> = Result<T, TunnelError>;
