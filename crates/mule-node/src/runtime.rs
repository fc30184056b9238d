use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::service::BundleLayer;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    /// Bundles accepted from local producers.
    pub submitted: u64,
    /// Inbound frames handed to the receive path.
    pub received: u64,
    /// Inbound bundles stored in `inbox`.
    pub accepted: u64,
    /// Accepted bundles held only for role-driven caching.
    pub speculative: u64,
    pub duplicates: u64,
    /// Inbound bundles with a bad signature.
    pub quarantined: u64,
    /// Inbound copies at their hop limit with no local interest.
    pub saturated: u64,
    /// Inbound bundles dropped as malformed, expired, misaddressed or unwanted.
    pub dropped: u64,
    /// Receipts that moved a bundle to `delivered`.
    pub receipts: u64,
    /// Bundles transferred to peers in committed sessions.
    pub transmitted: u64,
    /// Forwarding attempts postponed by the bandwidth budget.
    pub deferred: u64,
    /// Admissions refused at hard storage capacity.
    pub rejected: u64,
    pub evicted: u64,
    /// Bundles moved to `expired` by TTL or hop limit.
    pub expired: u64,
    /// Terminal entries removed after the audit window.
    pub purged: u64,
    pub sync_sessions: u64,
    pub sync_failures: u64,
}

/// Handles for the reaper, reconcile and forwarding-drain loops.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signals every loop to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background task ended abnormally");
            }
        }
    }
}

async fn run_periodic<P, T>(
    mut shutdown: watch::Receiver<bool>,
    name: &'static str,
    period: P,
    tick: T,
) where
    P: Fn() -> Duration,
    T: Fn(),
{
    tracing::debug!(task = name, "background task started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(period()) => tick(),
        }
    }
    tracing::debug!(task = name, "background task stopped");
}

/// Spawns the periodic maintenance loops on the current tokio runtime.
///
/// The drain loop period follows the battery-scaled poll interval, so it
/// slows down as the battery drains.
pub fn spawn_background(layer: &BundleLayer) -> BackgroundTasks {
    let (shutdown, rx) = watch::channel(false);
    let config = layer.config().clone();
    let mut handles = Vec::with_capacity(3);

    let reaper = layer.clone();
    let reaper_period = config.reaper_period;
    handles.push(tokio::spawn(run_periodic(
        rx.clone(),
        "reaper",
        move || reaper_period,
        move || {
            reaper.reap();
        },
    )));

    let reconcile = layer.clone();
    let reconcile_period = config.reconcile_period;
    handles.push(tokio::spawn(run_periodic(
        rx.clone(),
        "reconcile",
        move || reconcile_period,
        move || {
            reconcile.reconcile_budget();
        },
    )));

    let drain = layer.clone();
    let poll = layer.clone();
    let forward_period = config.forward_period;
    handles.push(tokio::spawn(run_periodic(
        rx,
        "forwarding-drain",
        move || poll.poll_interval(forward_period),
        move || {
            drain.drain_to_pending();
        },
    )));

    BackgroundTasks { shutdown, handles }
}
