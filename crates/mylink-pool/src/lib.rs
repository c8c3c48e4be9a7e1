//! mylink-pool: connection pooling and client-side failover for MySQL.
//!
//! # Architecture
//!
//! ```text
//! PoolRegistry::acquire(spec)
//!   ├── PoolKey (normalised configuration) → ConnectionPool (one per key)
//!   │   ├── idle link → ping → PooledLink
//!   │   └── no idle link → FailoverResolver
//!   │       ├── FailoverGroup (sequential | priority | random order)
//!   │       ├── DemotedHosts (recently failed hosts tried last)
//!   │       └── Connector::open per host, bounded by connect_timeout
//!   └── PoolMaintenanceScheduler (periodic idle reaping)
//! ```
//!
//! The transport is injected through [`Connector`]; [`mysql::MysqlConnector`]
//! is the TCP implementation.

pub mod error;
pub mod failover;
pub mod key;
pub mod link;
pub mod maintenance;
pub mod mysql;
pub mod pool;
pub mod registry;

#[cfg(test)]
mod testing;

pub use error::{FailedAttempt, LinkError, PoolError, PoolResult};
pub use failover::{DemotedHosts, FailoverGroup, FailoverResolver, auto_priorities};
pub use key::PoolKey;
pub use link::{Connector, LinkState, ServerLink, Session};
pub use maintenance::{MaintenanceReport, PoolMaintenanceScheduler, run_maintenance_tick};
pub use pool::{ConnectionPool, PoolConfig, PoolSpec, PoolStats, PooledLink};
pub use registry::PoolRegistry;
