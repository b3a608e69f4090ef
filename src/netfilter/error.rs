//! Error types for the kernel driver layer

use std::io;

use thiserror::Error;

/// Errors from ipset / iptables / ip invocations
#[derive(Debug, Error)]
pub enum NetfilterError {
    /// The external binary exited non-zero
    #[error("command failed: {command}: {stderr}")]
    CommandFailed {
        /// The full command line that was run
        command: String,
        /// Captured stderr (trimmed)
        stderr: String,
    },

    /// The external binary could not be spawned at all
    #[error("failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The invocation was cancelled before the subprocess finished
    #[error("command cancelled: {command}")]
    Cancelled { command: String },

    /// Output from the utility could not be interpreted
    #[error("failed to parse {command} output: {reason}")]
    OutputParse { command: String, reason: String },
}

impl NetfilterError {
    /// Driver errors are transient as far as the reconciler is concerned:
    /// the next pass re-issues the same idempotent operations.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::CommandFailed { .. } | Self::Cancelled { .. } => true,
            Self::SpawnFailed { .. } | Self::OutputParse { .. } => false,
        }
    }
}

/// Type alias for Result with NetfilterError
pub type NetfilterResult<T> = std::result::Result<T, NetfilterError>;
