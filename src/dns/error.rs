//! Error types for the DNS interceptor

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors from DNS message handling, listeners, and upstream exchanges
#[derive(Debug, Error)]
pub enum DnsError {
    /// A DNS message could not be decoded
    #[error("Failed to parse DNS message: {reason}")]
    ParseError { reason: String },

    /// A DNS message could not be encoded
    #[error("Failed to serialize DNS message: {reason}")]
    SerializeError { reason: String },

    /// Socket I/O failed
    #[error("Network error: {reason}")]
    NetworkError {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The upstream resolver misbehaved
    #[error("Upstream {addr} error: {reason}")]
    UpstreamError { addr: String, reason: String },

    /// An exchange exceeded its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The interceptor is shutting down
    #[error("DNS interceptor shutting down")]
    ShuttingDown,
}

impl DnsError {
    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a serialize error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::SerializeError {
            reason: reason.into(),
        }
    }

    /// Create a network error wrapping an I/O error
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create an upstream error
    pub fn upstream(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamError {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Whether this error is a timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Transient errors may succeed on retry; parse/serialize failures and
    /// shutdown will not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::NetworkError { .. } | Self::UpstreamError { .. } | Self::Timeout { .. } => true,
            Self::ParseError { .. } | Self::SerializeError { .. } | Self::ShuttingDown => false,
        }
    }
}

/// Type alias for Result with DnsError
pub type DnsResult<T> = std::result::Result<T, DnsError>;
