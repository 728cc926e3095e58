//! Keeps every world's displayed population in line with the store.
//!
//! Two independent paths feed the worlds:
//!
//! - the **timer path** ([`PopulationReconciler::tick`]) polls the store's
//!   global total and notifies worlds only when it changed;
//! - the **event path** ([`PopulationReconciler::on_population_change`])
//!   runs whenever a world gains or loses a player, publishes fresh counters
//!   and pushes the recomputed total straight away.
//!
//! The two may race. Every read is stamped with an epoch taken before the
//! store is queried. A result is only committed if its epoch is newer than
//! the last committed one, and worlds drop updates older than the last one
//! they applied, so a slow read can never overwrite a newer figure.
//!
//! [`PopulationReconciler::run`] also performs the initial event-path pass
//! once the store becomes ready, so that pass never overlaps a tick.

use crate::pool::ShardPool;
use crate::shard::{PopulationEvent, PopulationUpdate, Shard};
use crate::store::PopulationStore;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

/// The newest total handed to the worlds and the epoch it was read at.
#[derive(Debug, Default, Clone, Copy)]
struct Committed {
    epoch: u64,
    total: u64,
}

pub struct PopulationReconciler<S, P> {
    pool: Arc<ShardPool<S>>,
    store: Arc<P>,
    committed: Mutex<Committed>,
    epoch: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl<S: Shard, P: PopulationStore> PopulationReconciler<S, P> {
    pub fn new(pool: Arc<ShardPool<S>>, store: Arc<P>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            store,
            committed: Mutex::new(Committed::default()),
            epoch: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Last global total delivered to the worlds.
    pub fn last_total(&self) -> u64 {
        self.committed().total
    }

    /// Timer path. Returns the total if it changed and was delivered.
    pub async fn tick(&self) -> Option<u64> {
        if !self.store.is_ready() {
            return None;
        }

        let epoch = self.next_epoch();
        let total = match self.store.total_population().await {
            Ok(total) => total,
            Err(e) => {
                warn!("Skipping population check: {}", e);
                return None;
            }
        };
        if self.is_shutting_down() {
            return None;
        }

        if !self.commit(epoch, total, false) {
            return None;
        }

        let changed = self.pool.broadcast_population(PopulationUpdate { epoch, total });
        debug!("Total population now {} ({} worlds updated)", total, changed);
        Some(total)
    }

    /// Event path. Publishes this server's counters, then delivers the
    /// recomputed total to every world. Returns the total on success.
    pub async fn on_population_change(&self) -> Option<u64> {
        if !self.store.is_ready() {
            return None;
        }

        let distribution = self.pool.distribution();
        let epoch = self.next_epoch();
        let counted = self.store.update_counters(&distribution).await;
        self.store.report_distribution(&distribution).await;

        let total = match counted {
            Ok(total) => total,
            Err(e) => {
                warn!("Could not publish player counters: {}", e);
                return None;
            }
        };
        if self.is_shutting_down() {
            return None;
        }

        if !self.commit(epoch, total, true) {
            debug!("Dropping population total {} read at stale epoch {}", total, epoch);
            return None;
        }
        let changed = self.pool.broadcast_population(PopulationUpdate { epoch, total });
        debug!(
            "Population changed: {:?}, total {} ({} worlds updated)",
            distribution, total, changed
        );
        Some(total)
    }

    /// Drives both paths until shutdown.
    pub async fn run(
        self: Arc<Self>,
        period: Duration,
        mut events: mpsc::UnboundedReceiver<PopulationEvent>,
    ) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick fires immediately
        ticker.tick().await;

        let mut ready = self.store.wait_ready();
        let mut awaiting_ready = true;
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                is_ready = &mut ready, if awaiting_ready => {
                    awaiting_ready = false;
                    if is_ready {
                        info!("Population store ready");
                        self.on_population_change().await;
                    }
                }

                _ = ticker.tick() => {
                    self.tick().await;
                }

                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        debug!("{:?}", event);
                        // One pass covers every change queued so far
                        while events.try_recv().is_ok() {}
                        self.on_population_change().await;
                    }
                    None => events_open = false,
                },
            }
        }

        info!("Population reconciler stopped");
    }

    /// Records `total` as read at `epoch` unless a newer read was already
    /// committed. Returns whether the worlds should be told. An unchanged
    /// total only advances the epoch, unless `force` is set.
    fn commit(&self, epoch: u64, total: u64, force: bool) -> bool {
        let mut committed = self.committed();
        if epoch <= committed.epoch {
            return false;
        }
        let changed = committed.total != total;
        *committed = Committed { epoch, total };
        changed || force
    }

    fn committed(&self) -> MutexGuard<'_, Committed> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
