//! Client-side failover: attempt ordering, demoted hosts, and the attempt loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mylink_core::{ConfigError, Credentials, FailoverMethod, HostEntry, MAX_PRIORITY};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{FailedAttempt, LinkError, PoolError, PoolResult};
use crate::link::{Connector, Session};

/// Default time a failed host stays demoted.
pub const DEFAULT_DEMOTE_TIMEOUT: Duration = Duration::from_secs(120);

/// Priorities assigned by position when no host carries one.
///
/// The first host gets 100 and the last 0, spaced by integer division.
/// Past 101 hosts the trailing entries all get 0.
pub fn auto_priorities(count: usize) -> Vec<i64> {
    if count <= 1 {
        return vec![MAX_PRIORITY; count];
    }
    let span = (count as i64 - 1).min(MAX_PRIORITY);
    (0..count as i64)
        .map(|i| MAX_PRIORITY - i.min(span) * MAX_PRIORITY / span)
        .collect()
}

/// Ordered attempt sequence for one connection open.
#[derive(Debug, Clone)]
pub struct FailoverGroup {
    method: FailoverMethod,
    hosts: Vec<HostEntry>,
}

impl FailoverGroup {
    /// Validate `hosts` and order them for `method`.
    ///
    /// Validation happens before any I/O. Random order is recomputed on
    /// every call.
    pub fn new(hosts: &[HostEntry], method: FailoverMethod) -> Result<Self, ConfigError> {
        HostEntry::validate_list(hosts)?;

        let mut ordered = hosts.to_vec();
        if ordered.iter().all(|h| h.priority.is_none()) {
            for (host, priority) in ordered.iter_mut().zip(auto_priorities(hosts.len())) {
                host.priority = Some(priority);
            }
        }

        match method {
            FailoverMethod::Sequential => {}
            // sort_by is stable: equal priorities keep input order
            FailoverMethod::Priority => ordered.sort_by(|a, b| b.priority.cmp(&a.priority)),
            FailoverMethod::Random => ordered.shuffle(&mut rand::thread_rng()),
        }

        Ok(Self {
            method,
            hosts: ordered,
        })
    }

    pub fn method(&self) -> FailoverMethod {
        self.method
    }

    pub fn hosts(&self) -> &[HostEntry] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Move demoted hosts to the end, keeping relative order on both sides.
    fn demote(&mut self, demoted: &DemotedHosts) {
        let (healthy, failed): (Vec<_>, Vec<_>) = self
            .hosts
            .drain(..)
            .partition(|host| !demoted.is_demoted(host));
        self.hosts = healthy;
        self.hosts.extend(failed);
    }
}

/// Hosts that recently failed, keyed by canonical address.
pub struct DemotedHosts {
    timeout: Duration,
    hosts: Mutex<HashMap<String, Instant>>,
}

impl DemotedHosts {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn demote(&self, host: &HostEntry) {
        let until = Instant::now() + self.timeout;
        self.hosts.lock().insert(demotion_key(host), until);
    }

    /// Whether `host` is demoted. Expired demotions are dropped here.
    pub fn is_demoted(&self, host: &HostEntry) -> bool {
        let key = demotion_key(host);
        let mut hosts = self.hosts.lock();
        match hosts.get(&key) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                hosts.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn restore(&self, host: &HostEntry) {
        self.hosts.lock().remove(&demotion_key(host));
    }

    /// Drop expired demotions, returning how many were released.
    pub fn release_expired(&self) -> usize {
        let now = Instant::now();
        let mut hosts = self.hosts.lock();
        let before = hosts.len();
        hosts.retain(|_, until| *until > now);
        before - hosts.len()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.lock().is_empty()
    }

    pub fn clear(&self) {
        self.hosts.lock().clear();
    }
}

impl Default for DemotedHosts {
    fn default() -> Self {
        Self::new(DEFAULT_DEMOTE_TIMEOUT)
    }
}

fn demotion_key(host: &HostEntry) -> String {
    format!("{}:{}", host.host.to_ascii_lowercase(), host.port_or_default())
}

/// Drives one pass over a failover group until a host accepts.
pub struct FailoverResolver {
    connector: Arc<dyn Connector>,
    demoted: Arc<DemotedHosts>,
}

impl FailoverResolver {
    pub fn new(connector: Arc<dyn Connector>, demoted: Arc<DemotedHosts>) -> Self {
        Self { connector, demoted }
    }

    pub fn demoted(&self) -> &Arc<DemotedHosts> {
        &self.demoted
    }

    /// Open a session against the first host in the resolved order that
    /// accepts within `per_host_timeout`.
    ///
    /// Configuration errors are returned before any attempt. Each host is
    /// tried once; when all fail the error carries every attempt.
    pub async fn resolve(
        &self,
        hosts: &[HostEntry],
        method: FailoverMethod,
        per_host_timeout: Duration,
        credentials: &Credentials,
    ) -> PoolResult<(Box<dyn Session>, HostEntry)> {
        let mut group = FailoverGroup::new(hosts, method)?;
        group.demote(&self.demoted);

        let mut attempts = Vec::with_capacity(group.len());
        for host in group.hosts {
            let opened =
                tokio::time::timeout(per_host_timeout, self.connector.open(&host, credentials))
                    .await;
            let error = match opened {
                Ok(Ok(session)) => {
                    self.demoted.restore(&host);
                    debug!(
                        host = %host,
                        thread_id = session.thread_id(),
                        failed_hosts = attempts.len(),
                        "connected"
                    );
                    return Ok((session, host));
                }
                Ok(Err(e)) => e,
                Err(_) => LinkError::Timeout {
                    address: host.to_string(),
                    timeout: per_host_timeout,
                },
            };

            warn!(host = %host, error = %error, "host attempt failed");
            self.demoted.demote(&host);
            attempts.push(FailedAttempt { host, error });
        }

        Err(PoolError::FailoverExhausted { attempts })
    }
}
