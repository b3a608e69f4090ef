//! Error types for bypass-router
//!
//! Subsystems with their own failure taxonomy define their error enum next
//! to their code (`netfilter::NetfilterError`, `dns::DnsError`); this module
//! holds the configuration and store errors plus the top-level aggregate.

use std::io;

use thiserror::Error;

use crate::dns::DnsError;
use crate::netfilter::NetfilterError;

/// Top-level error type for bypass-router
#[derive(Debug, Error)]
pub enum BypassError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bundle store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Kernel driver errors (ipset / iptables invocation)
    #[error("Netfilter error: {0}")]
    Netfilter(#[from] NetfilterError),

    /// DNS interceptor errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Parsing error in the configuration document
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading or writing config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are never recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Bundle store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bundle with the given name does not exist
    #[error("bundle {0:?} not found")]
    BundleNotFound(String),

    /// Bundle with the given name already exists
    #[error("bundle {0:?} already exists")]
    BundleExists(String),

    /// Selector already present in the bundle (after normalisation)
    #[error("selector {value:?} already exists in bundle {bundle:?}")]
    SelectorExists { bundle: String, value: String },

    /// Selector not present in the bundle
    #[error("selector {value:?} not found in bundle {bundle:?}")]
    SelectorNotFound { bundle: String, value: String },

    /// Parsing error in the bundles document
    #[error("Failed to parse bundles file: {0}")]
    ParseError(String),

    /// I/O error while reading or writing the bundles file
    #[error("I/O error accessing bundles file: {0}")]
    IoError(#[from] io::Error),
}

impl StoreError {
    /// Create a selector-exists error
    pub fn selector_exists(bundle: impl Into<String>, value: impl Into<String>) -> Self {
        Self::SelectorExists {
            bundle: bundle.into(),
            value: value.into(),
        }
    }

    /// Create a selector-not-found error
    pub fn selector_not_found(bundle: impl Into<String>, value: impl Into<String>) -> Self {
        Self::SelectorNotFound {
            bundle: bundle.into(),
            value: value.into(),
        }
    }
}

/// Type alias for Result with BypassError
pub type Result<T> = std::result::Result<T, BypassError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::BundleNotFound("Streaming".into());
        assert!(err.to_string().contains("Streaming"));

        let err = StoreError::selector_exists("Default", "example.com");
        let msg = err.to_string();
        assert!(msg.contains("example.com"));
        assert!(msg.contains("Default"));
    }

    #[test]
    fn test_error_conversion() {
        let cfg_err = ConfigError::ValidationError("bad port".into());
        assert!(!cfg_err.is_recoverable());

        let top: BypassError = cfg_err.into();
        assert!(top.to_string().contains("bad port"));

        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let top: BypassError = io_err.into();
        assert!(matches!(top, BypassError::Io(_)));
    }
}
