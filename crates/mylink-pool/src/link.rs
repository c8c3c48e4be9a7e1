//! Server links: one authenticated session to one MySQL endpoint.
//!
//! The transport is reached through two seams so pools can be tested
//! without a server:
//!
//! - [`Connector`] opens a new authenticated [`Session`] against a host.
//! - [`Session`] is the live connection: ping, reset, close.
//!
//! [`ServerLink`] wraps a session with the bookkeeping the pool needs
//! (owning pool, generation, timestamps, state).

use std::fmt;

use async_trait::async_trait;
use mylink_core::{Credentials, HostEntry};
use tokio::time::Instant;

use crate::error::{LinkError, PoolError, PoolResult};
use crate::key::PoolKey;

/// A live, authenticated server session.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Server-assigned thread (connection) id of this session.
    fn thread_id(&self) -> u64;

    /// Lightweight liveness check. Returns `true` if the session answered.
    async fn ping(&mut self) -> bool;

    /// Reset server-side session state (variables, temporary tables, locks).
    async fn reset(&mut self) -> Result<(), LinkError>;

    /// Close the session gracefully. Must not fail.
    async fn close(&mut self);
}

/// Opens sessions on behalf of a pool.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate a session against `host`.
    ///
    /// The caller bounds this with its own per-host timeout.
    async fn open(
        &self,
        host: &HostEntry,
        credentials: &Credentials,
    ) -> Result<Box<dyn Session>, LinkError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Opened by the transport but not yet admitted by its pool.
    Connecting,
    Open,
    /// Closed gracefully; never reused.
    Closed,
    /// Detected dead (failed ping, failed reset, severed transport); never reused.
    Broken,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Open => write!(f, "open"),
            LinkState::Closed => write!(f, "closed"),
            LinkState::Broken => write!(f, "broken"),
        }
    }
}

/// One physical connection owned by a [`ConnectionPool`](crate::ConnectionPool).
pub struct ServerLink {
    id: u64,
    session: Box<dyn Session>,
    host: HostEntry,
    state: LinkState,
    pool_key: PoolKey,
    pool_id: u64,
    generation: u64,
    created_at: Instant,
    last_returned_at: Instant,
}

impl ServerLink {
    pub(crate) fn new(
        id: u64,
        session: Box<dyn Session>,
        host: HostEntry,
        pool_key: PoolKey,
        pool_id: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            session,
            host,
            state: LinkState::Connecting,
            pool_key,
            pool_id,
            generation: 0,
            created_at: now,
            last_returned_at: now,
        }
    }

    /// Pool-local link id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread_id(&self) -> u64 {
        self.session.thread_id()
    }

    /// The host this link is connected to.
    pub fn host(&self) -> &HostEntry {
        &self.host
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Key of the pool that created this link.
    pub fn pool_key(&self) -> &PoolKey {
        &self.pool_key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the link was last returned to its pool (or created).
    pub fn last_returned_at(&self) -> Instant {
        self.last_returned_at
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Report that the transport under this link was severed.
    ///
    /// The pool discards broken links on release instead of re-idling them.
    pub fn mark_broken(&mut self) {
        if self.state != LinkState::Closed {
            self.state = LinkState::Broken;
        }
    }

    /// Access the session for protocol work.
    ///
    /// Fails with [`PoolError::BrokenLink`] once the link is broken or closed.
    pub fn session_mut(&mut self) -> PoolResult<&mut dyn Session> {
        match self.state {
            LinkState::Open => Ok(self.session.as_mut()),
            state => Err(PoolError::BrokenLink(LinkError::Broken(format!(
                "link {} to {} is {state}",
                self.id, self.host
            )))),
        }
    }

    /// Ping the server, marking the link broken if it does not answer.
    pub async fn ping(&mut self) -> bool {
        if self.state != LinkState::Open {
            return false;
        }
        let alive = self.session.ping().await;
        if !alive {
            self.state = LinkState::Broken;
        }
        alive
    }

    /// Reset server-side session state, marking the link broken on failure.
    pub async fn reset(&mut self) -> Result<(), LinkError> {
        if self.state != LinkState::Open {
            return Err(LinkError::Broken(format!("cannot reset a {} link", self.state)));
        }
        let result = self.session.reset().await;
        if result.is_err() {
            self.state = LinkState::Broken;
        }
        result
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn admit(&mut self, generation: u64) {
        self.generation = generation;
        self.state = LinkState::Open;
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_returned_at = now;
    }

    /// Close the link. Broken links are dropped without a goodbye.
    pub(crate) async fn close(&mut self) {
        if matches!(self.state, LinkState::Open | LinkState::Connecting) {
            self.session.close().await;
        }
        self.state = LinkState::Closed;
    }
}

impl fmt::Debug for ServerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerLink")
            .field("id", &self.id)
            .field("thread_id", &self.thread_id())
            .field("host", &self.host.to_string())
            .field("state", &self.state)
            .field("pool", &self.pool_key.as_str())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;

    async fn open_link(connector: &MockConnector) -> ServerLink {
        let session = connector
            .open(&HostEntry::new("db1"), &Credentials::new("app"))
            .await
            .unwrap();
        let mut link = ServerLink::new(1, session, HostEntry::new("db1"), PoolKey::new("k=v"), 7);
        link.admit(3);
        link
    }

    #[tokio::test]
    async fn new_link_is_connecting_until_admitted() {
        let connector = MockConnector::new();
        let session = connector
            .open(&HostEntry::new("db1"), &Credentials::new("app"))
            .await
            .unwrap();
        let mut link = ServerLink::new(1, session, HostEntry::new("db1"), PoolKey::new("k=v"), 7);
        assert_eq!(link.state(), LinkState::Connecting);
        assert!(link.session_mut().is_err());

        link.admit(3);
        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(link.generation(), 3);
        assert_eq!(link.pool_id(), 7);
    }

    #[tokio::test]
    async fn failed_ping_marks_broken() {
        let connector = MockConnector::new();
        let mut link = open_link(&connector).await;
        assert!(link.ping().await);

        connector.kill(link.thread_id());
        assert!(!link.ping().await);
        assert_eq!(link.state(), LinkState::Broken);
        assert!(matches!(link.session_mut(), Err(PoolError::BrokenLink(_))));
    }

    #[tokio::test]
    async fn failed_reset_marks_broken() {
        let connector = MockConnector::new();
        let mut link = open_link(&connector).await;
        connector.kill(link.thread_id());
        assert!(link.reset().await.is_err());
        assert_eq!(link.state(), LinkState::Broken);
    }

    #[tokio::test]
    async fn close_skips_goodbye_on_broken_link() {
        let connector = MockConnector::new();
        let mut link = open_link(&connector).await;
        link.mark_broken();
        link.close().await;
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(connector.closes(), 0);

        let mut healthy = open_link(&connector).await;
        healthy.close().await;
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn mark_broken_does_not_reopen_closed_link() {
        let connector = MockConnector::new();
        let mut link = open_link(&connector).await;
        link.close().await;
        link.mark_broken();
        assert_eq!(link.state(), LinkState::Closed);
    }
}
