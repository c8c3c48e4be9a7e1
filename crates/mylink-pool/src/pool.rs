//! Connection pool: bounded idle/in-use bookkeeping for one configuration.
//!
//! # Architecture
//!
//! ```text
//! acquire(timeout)
//!   → take a capacity permit (wait up to timeout, else PoolTimeout)
//!     → idle link available → move to in-use, ping, hand out
//!     → idle link fails ping → discard, try the next idle link
//!     → no idle link → FailoverResolver opens a new one → hand out
//! release(link)
//!   → broken / expired / older generation → close, free the permit
//!   → otherwise (reset if configured) → back to idle, free the permit
//! ```
//!
//! Idle links hold no permit; an in-use link holds exactly one. A permit is
//! only handed back after the released link is already parked idle, and
//! every open reserves its slot under the pool lock first, so
//! `idle + in_use + pending` never exceeds `max_size`.
//!
//! Acquire and release may be cancelled at any await point: a guard drops
//! the in-use entry (and the permit, on release) of an abandoned link.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mylink_core::{
    ConfigError, ConfigResult, Credentials, FailoverMethod, FailoverSettings, HostEntry,
    LinkConfig, PoolSettings, parse_duration,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::error::{PoolError, PoolResult};
use crate::failover::{DemotedHosts, FailoverResolver};
use crate::key::PoolKey;
use crate::link::{Connector, ServerLink};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Typed runtime options for one pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Links kept open even when idle (default: 0).
    pub min_size: usize,
    /// Upper bound on idle plus in-use links (default: 100).
    pub max_size: usize,
    /// Maximum wait for a free slot in `acquire` (default: 15s).
    pub acquire_timeout: Duration,
    /// Idle links unused for longer are reaped (default: 180s).
    pub idle_timeout: Duration,
    /// Links older than this are closed instead of re-idled (default: none).
    pub connection_lifetime: Option<Duration>,
    /// Reset server session state when a link is returned (default: false).
    pub connection_reset: bool,
    /// Ping idle links before handing them out (default: true).
    pub validate_on_acquire: bool,
    /// Per-host connect timeout used by failover (default: 15s).
    pub connect_timeout: Duration,
    /// Interval for the maintenance scheduler (default: 180s).
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 100,
            acquire_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(180),
            connection_lifetime: None,
            connection_reset: false,
            validate_on_acquire: true,
            connect_timeout: Duration::from_secs(15),
            maintenance_interval: Duration::from_secs(180),
        }
    }
}

impl PoolConfig {
    /// Build from the file model. `min_size` is clamped to `max_size`.
    pub fn from_settings(pool: &PoolSettings, failover: &FailoverSettings) -> ConfigResult<Self> {
        if pool.max_size == 0 {
            return Err(ConfigError::ZeroMaxSize);
        }
        let max_size = pool.max_size as usize;
        Ok(Self {
            min_size: (pool.min_size as usize).min(max_size),
            max_size,
            acquire_timeout: parse_duration(&pool.acquire_timeout)?,
            idle_timeout: parse_duration(&pool.idle_timeout)?,
            connection_lifetime: pool
                .connection_lifetime
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            connection_reset: pool.connection_reset,
            validate_on_acquire: pool.validate_on_acquire,
            connect_timeout: parse_duration(&failover.connect_timeout)?,
            maintenance_interval: parse_duration(&pool.maintenance_interval)?,
        })
    }
}

/// Everything a pool needs to open links: hosts, method, account, options.
#[derive(Clone, Debug)]
pub struct PoolSpec {
    pub hosts: Vec<HostEntry>,
    pub method: FailoverMethod,
    pub credentials: Credentials,
    pub config: PoolConfig,
}

impl PoolSpec {
    pub fn new(hosts: Vec<HostEntry>, credentials: Credentials) -> Self {
        let method = FailoverMethod::infer(&hosts);
        Self {
            hosts,
            method,
            credentials,
            config: PoolConfig::default(),
        }
    }

    pub fn with_method(self, method: FailoverMethod) -> Self {
        Self { method, ..self }
    }

    pub fn with_config(self, config: PoolConfig) -> Self {
        Self { config, ..self }
    }

    /// Validate and type a loaded configuration file.
    pub fn from_config(config: &LinkConfig) -> ConfigResult<Self> {
        let hosts = config.hosts()?;
        let method = config.failover_method(&hosts);
        Ok(Self {
            credentials: config.credentials(),
            config: PoolConfig::from_settings(&config.pool, &config.failover)?,
            hosts,
            method,
        })
    }

    /// Normalised key; equal settings always produce equal keys.
    ///
    /// The password is folded into a fingerprint so keys are safe to log.
    pub fn key(&self) -> PoolKey {
        let c = &self.config;
        let password = self.credentials.password.as_deref().map(|password| {
            let mut hasher = DefaultHasher::new();
            password.hash(&mut hasher);
            format!("#{:016x}", hasher.finish())
        });
        let raw = format!(
            "server={};user={};password={};database={};method={};min_size={};max_size={};\
             acquire_timeout_ms={};idle_timeout_ms={};connection_lifetime_ms={};\
             connection_reset={};validate_on_acquire={};connect_timeout_ms={}",
            HostEntry::render_list(&self.hosts),
            self.credentials.user,
            password.unwrap_or_default(),
            self.credentials.database.as_deref().unwrap_or_default(),
            self.method,
            c.min_size,
            c.max_size,
            c.acquire_timeout.as_millis(),
            c.idle_timeout.as_millis(),
            c.connection_lifetime.map(|l| l.as_millis()).unwrap_or_default(),
            c.connection_reset,
            c.validate_on_acquire,
            c.connect_timeout.as_millis(),
        );
        PoolKey::new(&raw)
    }
}

/// Pool-level statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Links parked idle.
    pub idle: usize,
    /// Links currently borrowed.
    pub in_use: usize,
    /// Total links (idle + in use).
    pub total: usize,
    /// Acquisitions that timed out waiting for a slot.
    pub wait_count: u64,
    /// Current generation; bumped by every clear.
    pub generation: u64,
    /// Whether links borrowed before the last clear are still out.
    pub draining: bool,
}

#[derive(Default)]
struct PoolState {
    /// Oldest returned at the front; acquire takes from the back.
    idle: VecDeque<ServerLink>,
    /// Borrowed link ids and the generation each was admitted in.
    in_use: HashMap<u64, u64>,
    /// Opens reserved but not yet admitted.
    pending: usize,
    generation: u64,
    wait_count: u64,
    closed: bool,
    /// Removed from its registry: returned links are closed, never parked.
    retired: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.pending
    }
}

/// Result of one look at the idle list.
enum Checkout {
    Idle(ServerLink),
    Open,
    Full,
}

/// Idle and in-use links for one [`PoolKey`].
pub struct ConnectionPool {
    id: u64,
    key: PoolKey,
    spec: PoolSpec,
    resolver: FailoverResolver,
    state: Mutex<PoolState>,
    /// One permit per link that may still be borrowed.
    semaphore: Arc<Semaphore>,
    next_link_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        spec: PoolSpec,
        connector: Arc<dyn Connector>,
        demoted: Arc<DemotedHosts>,
    ) -> Arc<Self> {
        let key = spec.key();
        let pool = Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            semaphore: Arc::new(Semaphore::new(spec.config.max_size)),
            resolver: FailoverResolver::new(connector, demoted),
            state: Mutex::new(PoolState::default()),
            next_link_id: AtomicU64::new(1),
            key,
            spec,
        });
        tracing::info!(
            pool = %pool.key,
            pool_id = pool.id,
            max_size = pool.spec.config.max_size,
            min_size = pool.spec.config.min_size,
            method = %pool.spec.method,
            "created connection pool"
        );
        pool
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn spec(&self) -> &PoolSpec {
        &self.spec
    }

    pub fn config(&self) -> &PoolConfig {
        &self.spec.config
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Acquire a link, waiting up to the configured `acquire_timeout`.
    pub async fn acquire(self: &Arc<Self>) -> PoolResult<PooledLink> {
        self.acquire_with_timeout(self.spec.config.acquire_timeout)
            .await
    }

    /// Acquire a link, waiting up to `timeout` for a free slot.
    ///
    /// Idle links are preferred (most recently returned first) and pinged
    /// when `validate_on_acquire` is set; a link that fails is discarded and
    /// the search continues. Only when no idle link survives is a new one
    /// opened through failover, whose errors propagate unchanged.
    pub async fn acquire_with_timeout(self: &Arc<Self>, timeout: Duration) -> PoolResult<PooledLink> {
        let started = Instant::now();
        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    let wait_count = {
                        let mut state = self.state.lock();
                        state.wait_count += 1;
                        state.wait_count
                    };
                    tracing::warn!(
                        pool = %self.key,
                        timeout = ?timeout,
                        wait_count = wait_count,
                        "timed out waiting for a pooled link"
                    );
                    return Err(PoolError::PoolTimeout {
                        waited: started.elapsed(),
                    });
                }
            };

        let slot = loop {
            let mut link = match self.checkout()? {
                Checkout::Idle(link) => link,
                Checkout::Open => break OpenSlot::reserved(&self.state),
                Checkout::Full => {
                    // Slot counts catch up with the permits shortly.
                    tokio::task::yield_now().await;
                    continue;
                }
            };
            let in_use = InUseGuard::new(self, link.id(), false);
            if self.is_past_lifetime(&link, Instant::now())
                || (self.spec.config.validate_on_acquire && !link.ping().await)
            {
                tracing::debug!(
                    pool = %self.key,
                    link_id = link.id(),
                    thread_id = link.thread_id(),
                    state = %link.state(),
                    "discarded idle link"
                );
                drop(in_use);
                link.close().await;
                continue;
            }

            tracing::debug!(
                pool = %self.key,
                link_id = link.id(),
                thread_id = link.thread_id(),
                "reused idle link"
            );
            in_use.disarm();
            // The permit stays taken while the link is borrowed.
            permit.forget();
            return Ok(PooledLink::new(link, Arc::clone(self)));
        };

        // Dropping the permit on error gives the slot back.
        let link = self.open_link(slot).await?;
        tracing::debug!(
            pool = %self.key,
            link_id = link.id(),
            thread_id = link.thread_id(),
            host = %link.host(),
            "created new link"
        );
        permit.forget();
        Ok(PooledLink::new(link, Arc::clone(self)))
    }

    /// Return a borrowed link.
    ///
    /// A link from another pool is rejected with [`PoolError::ForeignLink`]
    /// after being returned to the pool that owns it.
    pub async fn release(&self, mut link: PooledLink) -> PoolResult<()> {
        let Some(inner) = link.link.take() else {
            return Ok(());
        };
        if inner.pool_id() != self.id {
            let owner = Arc::clone(&link.pool);
            let err = PoolError::ForeignLink {
                link_id: inner.id(),
                owner: owner.id,
                pool: self.id,
            };
            tracing::warn!(pool = %self.key, error = %err, "rejected foreign link");
            owner.release_link(inner).await;
            return Err(err);
        }
        self.release_link(inner).await;
        Ok(())
    }

    /// Close every idle link now; borrowed links are closed when returned.
    ///
    /// New acquisitions are not blocked and get links of the new generation.
    pub async fn clear(&self) {
        self.clear_with(|_| {}).await;
    }

    /// Clear the pool for good after it left its registry. Acquisitions
    /// still in flight succeed, but every link is closed when returned.
    pub(crate) async fn retire(&self) {
        self.clear_with(|state| state.retired = true).await;
    }

    async fn clear_with(&self, mark: impl FnOnce(&mut PoolState)) {
        let (drained, in_use, generation) = {
            let mut state = self.state.lock();
            mark(&mut state);
            state.generation += 1;
            let drained: Vec<ServerLink> = state.idle.drain(..).collect();
            (drained, state.in_use.len(), state.generation)
        };
        tracing::info!(
            pool = %self.key,
            closed_idle = drained.len(),
            marked_in_use = in_use,
            generation = generation,
            "cleared connection pool"
        );
        for mut link in drained {
            link.close().await;
        }
    }

    /// Close idle links unused for longer than `idle_timeout`, oldest first,
    /// keeping at least `min_size` idle. Links past `connection_lifetime`
    /// are closed regardless. Returns the number closed.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let config = &self.spec.config;
        let (expired, remaining) = {
            let mut state = self.state.lock();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            while let Some(link) = state.idle.pop_front() {
                let left_if_removed = state.idle.len() + kept.len();
                let idle_for = now.saturating_duration_since(link.last_returned_at());
                if self.is_past_lifetime(&link, now)
                    || (idle_for > config.idle_timeout && left_if_removed >= config.min_size)
                {
                    expired.push(link);
                } else {
                    kept.push_back(link);
                }
            }
            state.idle = kept;
            (expired, state.idle.len())
        };

        let reaped = expired.len();
        for mut link in expired {
            link.close().await;
        }
        if reaped > 0 {
            tracing::info!(
                pool = %self.key,
                reaped = reaped,
                remaining_idle = remaining,
                "reaped idle links"
            );
        }
        reaped
    }

    /// Open links until `min_size` exist. Failures are logged and stop the
    /// warm-up; the pool stays usable. Returns the number opened.
    pub async fn warm_up(&self) -> usize {
        let mut opened = 0;
        loop {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let slot = {
                let mut state = self.state.lock();
                let total = state.total();
                if state.closed
                    || state.retired
                    || total >= self.spec.config.min_size
                    || total >= self.spec.config.max_size
                {
                    None
                } else {
                    state.pending += 1;
                    Some(OpenSlot::reserved(&self.state))
                }
            };
            let Some(slot) = slot else {
                break;
            };
            match self.open_link(slot).await {
                Ok(mut link) => {
                    link.touch(Instant::now());
                    let parked = {
                        let mut state = self.state.lock();
                        state.in_use.remove(&link.id());
                        if state.retired || link.generation() != state.generation {
                            Some(link)
                        } else {
                            state.idle.push_back(link);
                            None
                        }
                    };
                    drop(permit);
                    if let Some(mut link) = parked {
                        link.close().await;
                        break;
                    }
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!(pool = %self.key, error = %e, "pool warm-up failed");
                    break;
                }
            }
        }
        if opened > 0 {
            tracing::debug!(pool = %self.key, opened = opened, "warmed up pool");
        }
        opened
    }

    /// Clear the pool and refuse all further acquisitions.
    pub async fn shutdown(&self) {
        self.state.lock().closed = true;
        self.semaphore.close();
        self.clear().await;
        tracing::info!(pool = %self.key, "connection pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            total: state.idle.len() + state.in_use.len(),
            wait_count: state.wait_count,
            generation: state.generation,
            draining: state
                .in_use
                .values()
                .any(|generation| *generation < state.generation),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            pool = %self.key,
            idle = stats.idle,
            in_use = stats.in_use,
            total = stats.total,
            wait_count = stats.wait_count,
            generation = stats.generation,
            draining = stats.draining,
            "pool statistics"
        );
    }

    /// Move the most recently returned idle link to in-use, or reserve a
    /// slot for a new link when none is idle, in one step.
    fn checkout(&self) -> PoolResult<Checkout> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if let Some(link) = state.idle.pop_back() {
            state.in_use.insert(link.id(), link.generation());
            return Ok(Checkout::Idle(link));
        }
        if state.total() >= self.spec.config.max_size {
            return Ok(Checkout::Full);
        }
        state.pending += 1;
        Ok(Checkout::Open)
    }

    /// Open a link through failover into a reserved slot and admit it as
    /// in-use.
    async fn open_link(&self, mut slot: OpenSlot<'_>) -> PoolResult<ServerLink> {
        let (session, host) = self
            .resolver
            .resolve(
                &self.spec.hosts,
                self.spec.method,
                self.spec.config.connect_timeout,
                &self.spec.credentials,
            )
            .await?;
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let mut link = ServerLink::new(id, session, host, self.key.clone(), self.id);

        let admitted = {
            let mut state = self.state.lock();
            state.pending -= 1;
            slot.armed = false;
            if state.closed {
                false
            } else {
                link.admit(state.generation);
                state.in_use.insert(link.id(), link.generation());
                true
            }
        };
        if !admitted {
            link.close().await;
            return Err(PoolError::Closed);
        }
        Ok(link)
    }

    fn is_past_lifetime(&self, link: &ServerLink, now: Instant) -> bool {
        self.spec
            .config
            .connection_lifetime
            .is_some_and(|lifetime| now.saturating_duration_since(link.created_at()) > lifetime)
    }

    pub(crate) async fn release_link(&self, mut link: ServerLink) {
        let in_use = InUseGuard::new(self, link.id(), true);
        let now = Instant::now();
        let mut reusable = link.is_open() && !self.is_past_lifetime(&link, now) && {
            let state = self.state.lock();
            !state.closed && !state.retired && link.generation() == state.generation
        };

        if reusable && self.spec.config.connection_reset {
            if let Err(e) = link.reset().await {
                tracing::warn!(
                    pool = %self.key,
                    link_id = link.id(),
                    error = %e,
                    "session reset failed, discarding link"
                );
                reusable = false;
            }
        }

        let parked = {
            let mut state = self.state.lock();
            state.in_use.remove(&link.id());
            if reusable
                && !state.closed
                && !state.retired
                && link.generation() == state.generation
            {
                link.touch(now);
                state.idle.push_back(link);
                None
            } else {
                Some(link)
            }
        };
        self.semaphore.add_permits(1);
        in_use.disarm();

        match parked {
            None => tracing::debug!(pool = %self.key, "returned link to pool"),
            Some(mut link) => {
                tracing::debug!(
                    pool = %self.key,
                    link_id = link.id(),
                    thread_id = link.thread_id(),
                    state = %link.state(),
                    "discarded link on release"
                );
                link.close().await;
            }
        }
    }

    /// Synchronous release for a link whose async release cannot run. The
    /// link is dropped without a goodbye.
    pub(crate) fn forget_link(&self, link: ServerLink) {
        self.state.lock().in_use.remove(&link.id());
        self.semaphore.add_permits(1);
        tracing::debug!(
            pool = %self.key,
            link_id = link.id(),
            "dropped link without closing it"
        );
    }
}

// ── Cancellation guards ─────────────────────────────────────────────

/// A slot reserved for a link being opened. Dropped armed, it gives the
/// reservation back.
struct OpenSlot<'a> {
    state: &'a Mutex<PoolState>,
    armed: bool,
}

impl<'a> OpenSlot<'a> {
    /// Wrap a reservation already counted in `pending`.
    fn reserved(state: &'a Mutex<PoolState>) -> Self {
        Self { state, armed: true }
    }
}

impl Drop for OpenSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().pending -= 1;
        }
    }
}

/// The in-use entry of a link that is being handed out or returned.
/// Dropped armed, it forgets the link and, on the release path, frees its
/// permit.
struct InUseGuard<'a> {
    pool: &'a ConnectionPool,
    link_id: u64,
    returns_permit: bool,
    armed: bool,
}

impl<'a> InUseGuard<'a> {
    fn new(pool: &'a ConnectionPool, link_id: u64, returns_permit: bool) -> Self {
        Self {
            pool,
            link_id,
            returns_permit,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InUseGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.pool.state.lock().in_use.remove(&self.link_id);
        if self.returns_permit {
            self.pool.semaphore.add_permits(1);
        }
        tracing::debug!(
            pool = %self.pool.key,
            link_id = self.link_id,
            "abandoned link hand-off"
        );
    }
}

/// A dropped [`PooledLink`] on its way back to the pool. If the release
/// task is dropped before it runs, the slot is freed synchronously.
struct DeferredRelease {
    pool: Arc<ConnectionPool>,
    link: Option<ServerLink>,
}

impl DeferredRelease {
    async fn run(mut self) {
        if let Some(link) = self.link.take() {
            self.pool.release_link(link).await;
        }
    }
}

impl Drop for DeferredRelease {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            self.pool.forget_link(link);
        }
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("key", &self.key.as_str())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

const DEREF_ERR: &str = "(bug) PooledLink used after release";

/// A link borrowed from a [`ConnectionPool`].
///
/// Returned to its pool by [`PooledLink::release`] or on drop.
pub struct PooledLink {
    link: Option<ServerLink>,
    pool: Arc<ConnectionPool>,
}

impl PooledLink {
    fn new(link: ServerLink, pool: Arc<ConnectionPool>) -> Self {
        Self {
            link: Some(link),
            pool,
        }
    }

    /// The pool that owns this link.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Return the link to its pool and wait for the bookkeeping to finish.
    pub async fn release(mut self) {
        if let Some(link) = self.link.take() {
            self.pool.release_link(link).await;
        }
    }
}

impl Deref for PooledLink {
    type Target = ServerLink;

    fn deref(&self) -> &ServerLink {
        self.link.as_ref().expect(DEREF_ERR)
    }
}

impl DerefMut for PooledLink {
    fn deref_mut(&mut self) -> &mut ServerLink {
        self.link.as_mut().expect(DEREF_ERR)
    }
}

impl std::fmt::Debug for PooledLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledLink")
            .field("link", &self.link)
            .field("pool_id", &self.pool.id)
            .finish()
    }
}

impl Drop for PooledLink {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let release = DeferredRelease {
            pool: Arc::clone(&self.pool),
            link: Some(link),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release.run());
            }
            Err(_) => drop(release),
        }
    }
}
