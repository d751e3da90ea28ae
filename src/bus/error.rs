//! Transport error types for the message-bus client

use std::fmt;

/// Errors raised by message-bus transports.
#[derive(Debug, Clone, PartialEq)]
pub enum BusError {
    /// Initial connection to the broker failed.
    ConnectFailed {
        host: String,
        port: u16,
        details: String,
    },
    /// An established connection dropped mid-session.
    ConnectionLost { details: String },
    /// Publishing a payload failed.
    PublishFailed { topic: String, details: String },
    /// The client is not connected.
    NotConnected,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::ConnectFailed {
                host,
                port,
                details,
            } => write!(f, "failed to connect to bus {}:{}: {}", host, port, details),
            BusError::ConnectionLost { details } => {
                write!(f, "bus connection lost: {}", details)
            }
            BusError::PublishFailed { topic, details } => {
                write!(f, "failed to publish to {}: {}", topic, details)
            }
            BusError::NotConnected => write!(f, "bus client is not connected"),
        }
    }
}

impl std::error::Error for BusError {}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// Whether the session can continue after reconnecting. Startup
    /// connection failures are left to the caller's fatal-init policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BusError::ConnectionLost { .. }
                | BusError::PublishFailed { .. }
                | BusError::NotConnected
        )
    }
}
