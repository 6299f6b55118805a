//! Background monitors.
//!
//! Three pollers drive state forward without caller involvement: the
//! confirmation monitor advances `funding -> funded`, the timeout monitor
//! triggers automated refunds, and the secret monitor extracts revealed
//! preimages from counterparty chains. Each tick snapshots trade ids under
//! the read lock, releases it, then lets the coordinator take per-swap write
//! locks, so the global lock is never held across RPC.

use crate::coordinator::Coordinator;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Poll cadences for the background monitors.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often to poll funding confirmations.
    pub confirmation_interval: Duration,
    /// How often to check refund timeout heights.
    pub timeout_interval: Duration,
    /// How often to scan escrow history / contract logs for the preimage.
    pub secret_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            confirmation_interval: Duration::from_secs(30),
            timeout_interval: Duration::from_secs(60),
            secret_interval: Duration::from_secs(30),
        }
    }
}

/// Periodic confirmation poller: advances swaps from `funding` to `funded`.
pub struct ConfirmationMonitor<S: Store> {
    coordinator: Arc<Coordinator<S>>,
    interval: Duration,
    stop: watch::Receiver<bool>,
}

impl<S: Store + 'static> ConfirmationMonitor<S> {
    pub fn new(coordinator: Arc<Coordinator<S>>, config: &MonitorConfig) -> Self {
        let stop = coordinator.shutdown_signal();
        Self {
            coordinator,
            interval: config.confirmation_interval,
            stop,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.pass().await,
                _ = self.stop.changed() => {
                    log::debug!("confirmation monitor stopping");
                    return;
                }
            }
        }
    }

    /// One polling pass. Errors are logged and retried next tick.
    pub async fn pass(&self) {
        for trade_id in self.coordinator.active_trade_ids().await {
            if let Err(e) = self.coordinator.update_confirmations(&trade_id).await {
                match e {
                    crate::error::Error::Cancelled => return,
                    e => log::warn!("confirmation poll for {trade_id}: {e}"),
                }
            }
        }
    }
}

/// Periodic timeout poller: refunds escrows whose timeout height passed.
pub struct TimeoutMonitor<S: Store> {
    coordinator: Arc<Coordinator<S>>,
    interval: Duration,
    stop: watch::Receiver<bool>,
}

impl<S: Store + 'static> TimeoutMonitor<S> {
    pub fn new(coordinator: Arc<Coordinator<S>>, config: &MonitorConfig) -> Self {
        let stop = coordinator.shutdown_signal();
        Self {
            coordinator,
            interval: config.timeout_interval,
            stop,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let errors = self.coordinator.check_timeouts().await;
                    for (trade_id, e) in errors {
                        log::warn!("timeout pass for {trade_id}: {e}");
                    }
                }
                _ = self.stop.changed() => {
                    log::debug!("timeout monitor stopping");
                    return;
                }
            }
        }
    }
}

/// Periodic secret monitor: watches counterparty chains for the revealed
/// preimage and propagates it into the local sessions.
pub struct SecretMonitor<S: Store> {
    coordinator: Arc<Coordinator<S>>,
    interval: Duration,
    stop: watch::Receiver<bool>,
}

impl<S: Store + 'static> SecretMonitor<S> {
    pub fn new(coordinator: Arc<Coordinator<S>>, config: &MonitorConfig) -> Self {
        let stop = coordinator.shutdown_signal();
        Self {
            coordinator,
            interval: config.secret_interval,
            stop,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let errors = self.coordinator.scan_revealed_secrets().await;
                    for (trade_id, e) in errors {
                        log::warn!("secret scan for {trade_id}: {e}");
                    }
                }
                _ = self.stop.changed() => {
                    log::debug!("secret monitor stopping");
                    return;
                }
            }
        }
    }
}

/// Spawn all three monitors on detached tasks.
pub fn spawn_monitors<S: Store + Send + Sync + 'static>(
    coordinator: Arc<Coordinator<S>>,
    config: MonitorConfig,
) {
    tokio::spawn(ConfirmationMonitor::new(coordinator.clone(), &config).run());
    tokio::spawn(TimeoutMonitor::new(coordinator.clone(), &config).run());
    tokio::spawn(SecretMonitor::new(coordinator, &config).run());
}
