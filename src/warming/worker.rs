//! Background warming: the periodic schedule and the related-query worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use super::warmer::CacheWarmer;

/// Handle to a running warmer's background tasks.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) stops
/// the tasks at their next wakeup without waiting for them.
pub struct WarmerHandle {
    related_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    periodic: Option<JoinHandle<()>>,
    related: JoinHandle<()>,
}

impl CacheWarmer {
    /// Spawn the background workers.
    ///
    /// With a `schedule`, a full cycle runs every `schedule` (the first one
    /// after one interval, not immediately). A zero `schedule` is treated
    /// as none. The related-query worker always runs.
    pub fn start(self: &Arc<Self>, schedule: Option<Duration>) -> WarmerHandle {
        let schedule = schedule.filter(|every| {
            if every.is_zero() {
                warn!("zero warming schedule, periodic warming disabled");
            }
            !every.is_zero()
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (related_tx, related_rx) = mpsc::channel(self.config.related_queue_size.max(1));

        let periodic = schedule.map(|every| {
            info!(interval_secs = every.as_secs(), "scheduled periodic cache warming");
            tokio::spawn(run_periodic(Arc::clone(self), every, shutdown_rx.clone()))
        });
        let related = tokio::spawn(run_related(Arc::clone(self), related_rx, shutdown_rx));

        WarmerHandle {
            related_tx,
            shutdown_tx,
            periodic,
            related,
        }
    }
}

impl WarmerHandle {
    /// Queue related-query warming for `query` without waiting.
    ///
    /// Returns `false` if the request was dropped because the queue is full
    /// or the worker has stopped.
    pub fn warm_related(&self, query: impl Into<String>) -> bool {
        match self.related_tx.try_send(query.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(query)) => {
                debug!(query = %query, "related warming queue full, dropping request");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("related warming worker stopped, dropping request");
                false
            }
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.periodic.is_some()
    }

    /// Signal both workers to stop and wait for them.
    ///
    /// A periodic cycle in progress is abandoned; items already running on
    /// the blocking pool finish on their own.
    pub async fn shutdown(self) {
        // Receivers may already be gone if a worker panicked.
        let _ = self.shutdown_tx.send(true);

        if let Some(periodic) = self.periodic {
            if let Err(e) = periodic.await {
                warn!(error = %e, "periodic warming task ended abnormally");
            }
        }
        if let Err(e) = self.related.await {
            warn!(error = %e, "related warming task ended abnormally");
        }
        info!("cache warmer stopped");
    }
}

async fn run_periodic(
    warmer: Arc<CacheWarmer>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                info!("starting scheduled cache warming");
                let cycle_warmer = Arc::clone(&warmer);
                let mut cycle = tokio::spawn(async move { cycle_warmer.warm_on_startup().await });

                tokio::select! {
                    joined = &mut cycle => {
                        if let Err(e) = joined {
                            error!(error = %e, "scheduled cache warming failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        cycle.abort();
                        break;
                    }
                }
            }
        }
    }
    debug!("periodic warming stopped");
}

async fn run_related(
    warmer: Arc<CacheWarmer>,
    mut related_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            query = related_rx.recv() => {
                let Some(query) = query else {
                    break;
                };
                let warmed = warmer.warm_related_queries(&query).await;
                debug!(warmed, "related query warming done");
            }
        }
    }
    debug!("related warming stopped");
}
