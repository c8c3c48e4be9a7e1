//! mylink-core: host lists, failover methods, and configuration parsing.

pub mod config;
pub mod error;
pub mod host;

pub use config::{Credentials, FailoverSettings, LinkConfig, PoolSettings, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use host::{DEFAULT_PORT, FailoverMethod, HostEntry, MAX_PRIORITY};
