//! Error types for portbridge allocation and relay operations.

use std::time::Duration;

use thiserror::Error;

/// Main error type for portbridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The port is already bound on the given host
    #[error("address {0}:{1} is already in use")]
    AddressInUse(String, u16),

    /// The host is not a local address (or its address family is unusable)
    #[error("address {0}:{1} is not available on this machine")]
    AddressNotAvailable(String, u16),

    /// The host cannot be bound at all (e.g. IPv6 link-local without a scope)
    #[error("invalid bind address {0}:{1}")]
    InvalidAddress(String, u16),

    /// The port probed free but was handed out recently
    #[error("port {0} is locked")]
    LockConflict(u16),

    /// Every candidate port was excluded, in use or locked
    #[error("no available ports found")]
    NoPortsAvailable,

    /// Malformed caller input (port bounds, exclude entries, host)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unclassified OS error while probing a port
    #[error("probe of {host}:{port} failed: {source}")]
    Io {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A single relay connection attempt failed
    #[error("connect to {0}:{1} failed: {2}")]
    ConnectFailed(String, u16, #[source] std::io::Error),

    /// The relay gave up after its retry budget was spent
    #[error("connect to {host}:{port} failed after {attempts} attempts ({delay:?} apart): {source}")]
    RetriesExhausted {
        host: String,
        port: u16,
        attempts: u32,
        delay: Duration,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration in the named section
    #[error("invalid config in [{0}]: {1}")]
    InvalidConfig(String, String),
}

impl BridgeError {
    /// Errors that mean "try the next host or candidate" rather than abort.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::AddressInUse(..)
                | BridgeError::AddressNotAvailable(..)
                | BridgeError::InvalidAddress(..)
                | BridgeError::LockConflict(_)
        )
    }
}

/// Result type alias for portbridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
