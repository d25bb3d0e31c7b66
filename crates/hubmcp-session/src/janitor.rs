//! The Janitor (C8): a single periodic task that scans for idle or dead
//! sessions and evicts them without holding the session table locked across
//! a `Drain`.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::manager::SessionManager;

/// Owns the periodic eviction tick and the final shutdown drain.
pub struct Janitor {
    manager: Arc<SessionManager>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Janitor {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            manager,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// A handle other components can use to trigger shutdown independently
    /// of holding a reference to the running task.
    #[must_use]
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run until `shutdown_handle().send(true)` is called, ticking every
    /// `cleanup_interval` in between. On shutdown, triggers a final drain of
    /// every live session before returning.
    pub async fn run(mut self) {
        let interval = self.manager.config().cleanup_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("janitor shutting down, draining all sessions");
                        self.drain_all().await;
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let eligible = self.manager.eligible_for_eviction();
        if eligible.is_empty() {
            debug!("janitor tick: nothing eligible for eviction");
            return;
        }
        info!(count = eligible.len(), "janitor evicting idle sessions");

        let evictions = eligible
            .into_iter()
            .map(|key| self.manager.evict(key, "idle_timeout"));
        futures::future::join_all(evictions).await;
    }

    async fn drain_all(&self) {
        let keys = self.manager.all_keys();
        let evictions = keys
            .into_iter()
            .map(|key| self.manager.evict(key, "shutdown"));
        futures::future::join_all(evictions).await;
    }
}
