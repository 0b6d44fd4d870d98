//! Periodic background jobs.

use super::rates::RateRefresher;
use super::reconcile::Reconciler;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Broadcasts shutdown to every spawned job.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `tick` every `period` until shutdown. The first run happens
/// immediately.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: &Shutdown,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(job = name, period_secs = period.as_secs(), "Background job started");
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!(job = name, "Background job stopped");
    })
}

pub fn spawn_verify_pending(
    reconciler: Reconciler,
    period: Duration,
    shutdown: &Shutdown,
) -> JoinHandle<()> {
    spawn_periodic("verify_pending", period, shutdown, move || {
        let reconciler = reconciler.clone();
        async move {
            if let Err(e) = reconciler.verify_pending(None).await {
                warn!(error = %e, "Verify-pending pass failed");
            }
        }
    })
}

pub fn spawn_rate_refresh(
    refresher: RateRefresher,
    period: Duration,
    shutdown: &Shutdown,
) -> JoinHandle<()> {
    spawn_periodic("rate_refresh", period, shutdown, move || {
        let refresher = refresher.clone();
        async move {
            if let Err(e) = refresher.refresh().await {
                warn!(error = %e, "Exchange-rate refresh failed");
            }
        }
    })
}
