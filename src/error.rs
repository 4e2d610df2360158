//! Error types for buslink.

use thiserror::Error;

/// Main error type for all buslink operations.
#[derive(Debug, Error)]
pub enum BuslinkError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted on a channel that is not open.
    #[error("not connected")]
    NotConnected,

    /// Out-of-range id, zero length, malformed endpoint, and similar.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded pool (DMA operations) is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A handler is already registered for this interface.
    #[error("handler already registered for interface {0}")]
    AlreadyRegistered(u8),

    /// Connection torn down while work was still pending.
    #[error("disconnected")]
    Disconnected,

    /// Transport closed or errored underneath us.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The peer signaled the frame's error flag.
    #[error("bus fault signaled by peer")]
    Fault,
}

/// Result type alias using BuslinkError.
pub type Result<T> = std::result::Result<T, BuslinkError>;
