//! Registry of connection pools keyed by normalised configuration.
//!
//! The registry lock is only taken to look up or create a pool; acquire and
//! release work on the pool's own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mylink_core::LinkConfig;
use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};
use crate::failover::{DEFAULT_DEMOTE_TIMEOUT, DemotedHosts};
use crate::key::PoolKey;
use crate::link::{Connector, ServerLink};
use crate::pool::{ConnectionPool, PoolSpec, PooledLink};

/// Table of pools sharing one connector and one demoted-host table.
pub struct PoolRegistry {
    connector: Arc<dyn Connector>,
    demoted: Arc<DemotedHosts>,
    pools: Mutex<HashMap<PoolKey, Arc<ConnectionPool>>>,
    closed: AtomicBool,
}

impl PoolRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_demote_timeout(connector, DEFAULT_DEMOTE_TIMEOUT)
    }

    pub fn with_demote_timeout(connector: Arc<dyn Connector>, demote_timeout: Duration) -> Self {
        Self {
            connector,
            demoted: Arc::new(DemotedHosts::new(demote_timeout)),
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Build a registry whose demote timeout comes from `config`.
    pub fn from_config(connector: Arc<dyn Connector>, config: &LinkConfig) -> PoolResult<Self> {
        let demote_timeout = mylink_core::parse_duration(&config.failover.demote_timeout)?;
        Ok(Self::with_demote_timeout(connector, demote_timeout))
    }

    pub fn demoted_hosts(&self) -> &Arc<DemotedHosts> {
        &self.demoted
    }

    /// Look up the pool for `spec`, creating it on first use.
    ///
    /// At most one pool exists per key.
    pub fn get_or_create(&self, spec: &PoolSpec) -> PoolResult<Arc<ConnectionPool>> {
        self.get_or_create_inner(spec).map(|(pool, _)| pool)
    }

    fn get_or_create_inner(&self, spec: &PoolSpec) -> PoolResult<(Arc<ConnectionPool>, bool)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let key = spec.key();
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&key) {
            return Ok((Arc::clone(pool), false));
        }
        let pool = ConnectionPool::new(
            spec.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.demoted),
        );
        pools.insert(key, Arc::clone(&pool));
        Ok((pool, true))
    }

    /// Acquire a link from the pool for `spec`, warming a new pool up to its
    /// `min_size` first.
    pub async fn acquire(&self, spec: &PoolSpec) -> PoolResult<PooledLink> {
        let (pool, created) = self.get_or_create_inner(spec)?;
        if created && pool.config().min_size > 0 {
            pool.warm_up().await;
        }
        pool.acquire().await
    }

    /// Validate `config` and acquire a link from its pool.
    pub async fn acquire_config(&self, config: &LinkConfig) -> PoolResult<PooledLink> {
        let spec = PoolSpec::from_config(config)?;
        self.acquire(&spec).await
    }

    pub fn get(&self, key: &PoolKey) -> Option<Arc<ConnectionPool>> {
        self.pools.lock().get(key).cloned()
    }

    /// Snapshot of every registered pool.
    pub fn pools(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Clear the pool for `key` and remove it. Returns whether it existed.
    ///
    /// Borrowed links keep the removed pool alive and are closed on release,
    /// as are links from acquisitions that raced the removal.
    pub async fn clear_one(&self, key: &PoolKey) -> bool {
        let removed = self.pools.lock().remove(key);
        match removed {
            Some(pool) => {
                pool.retire().await;
                true
            }
            None => false,
        }
    }

    /// Clear the pool that created `link`.
    pub async fn clear_link_pool(&self, link: &ServerLink) -> bool {
        self.clear_one(link.pool_key()).await
    }

    /// Clear and remove every pool and forget all demoted hosts.
    pub async fn clear_all(&self) {
        let drained: Vec<_> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        let count = drained.len();
        for pool in drained {
            pool.retire().await;
        }
        self.demoted.clear();
        tracing::info!(pools = count, "cleared all connection pools");
    }

    /// Shut every pool down; later acquisitions fail with [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in &drained {
            pool.shutdown().await;
        }
        self.demoted.clear();
        tracing::info!(pools = drained.len(), "pool registry shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn log_stats(&self) {
        for pool in self.pools() {
            pool.log_stats();
        }
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.len())
            .field("demoted_hosts", &self.demoted.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use mylink_core::{Credentials, HostEntry};

    use super::*;
    use crate::pool::PoolConfig;
    use crate::testing::{MockConnector, init_tracing};

    fn make_registry() -> (Arc<PoolRegistry>, MockConnector) {
        init_tracing();
        let connector = MockConnector::new();
        let registry = Arc::new(PoolRegistry::new(Arc::new(connector.clone())));
        (registry, connector)
    }

    fn spec(host: &str) -> PoolSpec {
        PoolSpec::new(vec![HostEntry::new(host)], Credentials::new("app"))
    }

    #[tokio::test]
    async fn same_spec_reuses_one_pool() {
        let (registry, connector) = make_registry();
        for _ in 0..10 {
            registry.acquire(&spec("db1")).await.unwrap().release().await;
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test]
    async fn whitespace_variants_share_a_pool() {
        let (registry, _) = make_registry();
        let a = LinkConfig::from_toml("server = \"db1,db2\"\nuser = \"app\"\n").unwrap();
        let b = LinkConfig::from_toml("server = \"db1 , db2\"\nuser = \" app \"\n").unwrap();
        registry.acquire_config(&a).await.unwrap().release().await;
        registry.acquire_config(&b).await.unwrap().release().await;
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_get_or_create_makes_one_pool() {
        let (registry, _) = make_registry();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create(&spec("db1")).unwrap().id() })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn different_specs_get_separate_pools() {
        let (registry, _) = make_registry();
        let a = registry.get_or_create(&spec("db1")).unwrap();
        let b = registry.get_or_create(&spec("db2")).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(a.key()).is_some());
    }

    #[tokio::test]
    async fn configuration_error_surfaces_from_acquire() {
        let (registry, connector) = make_registry();
        let config = LinkConfig::from_toml(
            "server = \"(address=a,priority=150),(address=b,priority=1)\"\nuser = \"app\"\n",
        )
        .unwrap();
        let err = registry.acquire_config(&config).await.unwrap_err();
        assert_eq!(err.to_string(), "The priority must be between 0 and 100.");
        assert!(connector.attempts().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn clear_one_removes_pool_and_closes_returning_links() {
        let (registry, connector) = make_registry();
        let held = registry.acquire(&spec("db1")).await.unwrap();
        let idle = registry.acquire(&spec("db1")).await.unwrap();
        idle.release().await;
        let key = held.pool_key().clone();

        assert!(registry.clear_one(&key).await);
        assert!(!registry.clear_one(&key).await);
        assert!(registry.get(&key).is_none());
        assert_eq!(connector.closes(), 1);

        let old_pool = Arc::clone(held.pool());
        held.release().await;
        assert_eq!(connector.closes(), 2);
        assert_eq!(old_pool.stats().total, 0);

        let fresh = registry.acquire(&spec("db1")).await.unwrap();
        assert_ne!(fresh.pool().id(), old_pool.id());
    }

    #[tokio::test]
    async fn clear_link_pool_uses_the_owning_key() {
        let (registry, _) = make_registry();
        let link = registry.acquire(&spec("db1")).await.unwrap();
        registry.get_or_create(&spec("db2")).unwrap();

        assert!(registry.clear_link_pool(&link).await);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn clear_all_empties_registry_and_demotions() {
        let (registry, connector) = make_registry();
        connector.fail_host("down");
        let failing = PoolSpec::new(
            vec![HostEntry::new("down"), HostEntry::new("db1")],
            Credentials::new("app"),
        )
        .with_method(mylink_core::FailoverMethod::Sequential);
        registry.acquire(&failing).await.unwrap().release().await;
        registry.acquire(&spec("db2")).await.unwrap().release().await;
        assert_eq!(registry.demoted_hosts().len(), 1);

        registry.clear_all().await;
        registry.clear_all().await;
        assert!(registry.is_empty());
        assert!(registry.demoted_hosts().is_empty());
        assert_eq!(connector.closes(), 2);
    }

    #[tokio::test]
    async fn new_pool_is_warmed_up() {
        let (registry, connector) = make_registry();
        let warm = spec("db1").with_config(PoolConfig {
            min_size: 3,
            max_size: 5,
            ..PoolConfig::default()
        });
        let link = registry.acquire(&warm).await.unwrap();
        assert_eq!(connector.opens(), 3);
        assert_eq!(link.pool().stats().idle, 2);
    }

    #[tokio::test]
    async fn shutdown_refuses_everything() {
        let (registry, _) = make_registry();
        registry.acquire(&spec("db1")).await.unwrap().release().await;
        let pool = registry.get_or_create(&spec("db1")).unwrap();

        registry.shutdown().await;
        assert!(registry.is_closed());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.acquire(&spec("db1")).await,
            Err(PoolError::Closed)
        ));
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_during_warm_up_stays_within_max_size() {
        let (registry, connector) = make_registry();
        connector.delay_host("db1", Duration::from_secs(1));
        let warm = spec("db1").with_config(PoolConfig {
            min_size: 2,
            max_size: 2,
            ..PoolConfig::default()
        });
        let first = {
            let registry = Arc::clone(&registry);
            let warm = warm.clone();
            tokio::spawn(async move { registry.acquire(&warm).await.unwrap() })
        };
        settle().await;

        let pool = registry.get(&warm.key()).unwrap();
        let second = pool.acquire().await.unwrap();
        let first = first.await.unwrap();

        assert_ne!(first.thread_id(), second.thread_id());
        let stats = pool.stats();
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.total, 2);
        assert_eq!(connector.opens(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clear_all_races_acquire_and_release() {
        let (registry, connector) = make_registry();
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let link = registry.acquire(&spec("db1")).await.unwrap();
                        tokio::task::yield_now().await;
                        link.release().await;
                    }
                })
            })
            .collect();
        let clearer = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..20 {
                    registry.clear_all().await;
                    tokio::task::yield_now().await;
                }
            })
        };
        for handle in workers {
            handle.await.unwrap();
        }
        clearer.await.unwrap();

        let idle: usize = registry
            .pools()
            .iter()
            .map(|pool| {
                let stats = pool.stats();
                assert_eq!(stats.in_use, 0);
                stats.idle
            })
            .sum();
        // Removed pools closed all their links; only registered pools keep idle ones.
        assert_eq!(connector.closes(), connector.opens() - idle);

        let link = registry.acquire(&spec("db1")).await.unwrap();
        assert_eq!(link.generation(), link.pool().stats().generation);
        link.release().await;
        assert_eq!(registry.len(), 1);
    }
}
