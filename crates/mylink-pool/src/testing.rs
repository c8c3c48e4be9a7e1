//! In-memory connector and session used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mylink_core::{Credentials, HostEntry};
use parking_lot::Mutex;

use crate::error::LinkError;
use crate::link::{Connector, Session};

#[derive(Default)]
struct MockState {
    next_thread_id: u64,
    killed: HashSet<u64>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    session_delay: Duration,
    attempts: Vec<String>,
    opens: usize,
    closes: usize,
    resets: usize,
}

/// Connector whose sessions live in memory. Clones share state.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection to `host`.
    pub(crate) fn fail_host(&self, host: &str) {
        self.state.lock().failing.insert(host.to_string());
    }

    pub(crate) fn heal_host(&self, host: &str) {
        self.state.lock().failing.remove(host);
    }

    /// Delay every connection to `host` by `delay` before answering.
    pub(crate) fn delay_host(&self, host: &str, delay: Duration) {
        self.state.lock().delays.insert(host.to_string(), delay);
    }

    /// Make every session's ping and reset take `delay`.
    pub(crate) fn stall_sessions(&self, delay: Duration) {
        self.state.lock().session_delay = delay;
    }

    /// Simulate the server killing the session with `thread_id`.
    pub(crate) fn kill(&self, thread_id: u64) {
        self.state.lock().killed.insert(thread_id);
    }

    /// Host names in the order connections were attempted.
    pub(crate) fn attempts(&self) -> Vec<String> {
        self.state.lock().attempts.clone()
    }

    pub(crate) fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub(crate) fn resets(&self) -> usize {
        self.state.lock().resets
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        host: &HostEntry,
        _credentials: &Credentials,
    ) -> Result<Box<dyn Session>, LinkError> {
        let delay = {
            let mut state = self.state.lock();
            state.attempts.push(host.host.clone());
            state.delays.get(&host.host).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing.contains(&host.host) {
            return Err(LinkError::Refused {
                address: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.next_thread_id += 1;
        state.opens += 1;
        Ok(Box::new(MockSession {
            thread_id: state.next_thread_id,
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Debug)]
struct MockSession {
    thread_id: u64,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    async fn stall(&self) {
        let delay = self.state.lock().session_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for MockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockState").finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for MockSession {
    fn thread_id(&self) -> u64 {
        self.thread_id
    }

    async fn ping(&mut self) -> bool {
        self.stall().await;
        !self.state.lock().killed.contains(&self.thread_id)
    }

    async fn reset(&mut self) -> Result<(), LinkError> {
        self.stall().await;
        let mut state = self.state.lock();
        if state.killed.contains(&self.thread_id) {
            return Err(LinkError::Broken(format!(
                "session {} was killed",
                self.thread_id
            )));
        }
        state.resets += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().closes += 1;
    }
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
