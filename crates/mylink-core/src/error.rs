//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration parsing and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while parsing or validating a link configuration.
///
/// These are always reported synchronously, before any network I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("You must either assign no priority to any of the hosts or give a priority for every host.")]
    MixedPriority,

    #[error("The priority must be between 0 and 100.")]
    PriorityOutOfRange { priority: i64 },

    #[error("invalid priority value `{0}`")]
    InvalidPriority(String),

    #[error("the keyword `{0}` was not found in the host group")]
    KeywordNotFound(String),

    #[error("host must not be empty")]
    EmptyHost,

    #[error("invalid host `{0}`")]
    InvalidHost(String),

    #[error("no hosts were specified")]
    NoHosts,

    #[error("invalid port `{0}`")]
    InvalidPort(String),

    #[error("specifying a port is not supported when dns-srv resolution is enabled")]
    PortWithDnsSrv,

    #[error("dns-srv resolution requires exactly one host")]
    MultipleHostsWithDnsSrv,

    #[error("invalid duration `{0}`")]
    InvalidDuration(String),

    #[error("max pool size must be at least 1")]
    ZeroMaxSize,
}
