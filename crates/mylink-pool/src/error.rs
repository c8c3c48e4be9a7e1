//! Link and pool error types.

use std::time::Duration;

use mylink_core::{ConfigError, HostEntry};
use thiserror::Error;

/// Transport-level failure of a single server link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection to {address} refused: {reason}")]
    Refused { address: String, reason: String },

    #[error("connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("authentication against {address} failed: {reason}")]
    Authentication { address: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("link is broken: {0}")]
    Broken(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// One failed attempt recorded while walking a failover group.
#[derive(Debug)]
pub struct FailedAttempt {
    pub host: HostEntry,
    pub error: LinkError,
}

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced to callers of the pool and the registry.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Unable to connect to any of the specified MySQL hosts.")]
    FailoverExhausted { attempts: Vec<FailedAttempt> },

    #[error(
        "Timeout expired. The timeout period elapsed prior to obtaining a connection from the pool."
    )]
    PoolTimeout { waited: Duration },

    #[error("broken link: {0}")]
    BrokenLink(#[source] LinkError),

    #[error("link {link_id} belongs to pool {owner}, not pool {pool}")]
    ForeignLink { link_id: u64, owner: u64, pool: u64 },

    #[error("connection pool has been shut down")]
    Closed,
}
