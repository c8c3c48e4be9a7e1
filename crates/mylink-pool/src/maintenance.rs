//! Pool maintenance: a background task that reaps idle links.
//!
//! Each tick walks a snapshot of the registry, reaps idle links past their
//! pool's idle timeout or lifetime, and releases expired host demotions.
//! Ticks run inline in one task, so they never overlap; a tick that runs
//! long makes the scheduler skip the missed ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::pool::PoolConfig;
use crate::registry::PoolRegistry;

/// Outcome of one maintenance tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pools: usize,
    pub reaped: usize,
    pub released_demotions: usize,
}

/// Run one maintenance pass over every pool in `registry`.
pub async fn run_maintenance_tick(registry: &PoolRegistry) -> MaintenanceReport {
    let pools = registry.pools();
    let mut report = MaintenanceReport {
        pools: pools.len(),
        ..MaintenanceReport::default()
    };
    for pool in pools {
        report.reaped += pool.reap_idle().await;
    }
    report.released_demotions = registry.demoted_hosts().release_expired();

    if report.reaped > 0 || report.released_demotions > 0 {
        info!(
            pools = report.pools,
            reaped = report.reaped,
            released_demotions = report.released_demotions,
            "pool maintenance"
        );
    } else {
        debug!(pools = report.pools, "pool maintenance found nothing to do");
    }
    report
}

/// Periodic maintenance task with an explicit stop signal.
pub struct PoolMaintenanceScheduler {
    interval: Duration,
    handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PoolMaintenanceScheduler {
    /// Spawn the maintenance loop. The first tick runs one `interval` from now.
    pub fn start(registry: Arc<PoolRegistry>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let first_tick = Instant::now() + interval;
        let handle = tokio::spawn(run_maintenance_loop(
            registry,
            first_tick,
            interval,
            shutdown_rx,
        ));
        info!(interval = ?interval, "pool maintenance started");
        Self {
            interval,
            handle: Some(handle),
            shutdown_tx,
        }
    }

    /// Spawn the loop at the `maintenance_interval` of `config`.
    pub fn start_with_config(registry: Arc<PoolRegistry>, config: &PoolConfig) -> Self {
        Self::start(registry, config.maintenance_interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop to stop and wait for it. A tick in progress finishes.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            info!("pool maintenance stopped");
        }
    }
}

impl Drop for PoolMaintenanceScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run_maintenance_loop(
    registry: Arc<PoolRegistry>,
    first_tick: Instant,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(first_tick, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_maintenance_tick(&registry).await;
            }
            _ = shutdown.changed() => {
                debug!("pool maintenance loop shutting down");
                break;
            }
        }
    }
}
