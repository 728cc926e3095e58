//! Where the global population figure comes from.
//!
//! A single server runs with [`LocalStore`], which only counts its own
//! worlds. Several cooperating servers share a
//! [`MetricsStore`](crate::metrics::MetricsStore) instead.

use crate::error::StoreError;
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

#[async_trait]
pub trait PopulationStore: Send + Sync + 'static {
    /// Whether admission should be weighted by this store's open world count.
    fn is_coordinated(&self) -> bool;

    /// Whether the store has answered at least once since startup.
    fn is_ready(&self) -> bool;

    /// Resolves once the store is ready. Returns false if it never will be.
    async fn wait_ready(&self) -> bool;

    /// Players active across every participating server.
    async fn total_population(&self) -> Result<u64, StoreError>;

    /// How many worlds this server should keep open, if anyone set a limit.
    async fn open_shard_count(&self) -> Result<Option<i64>, StoreError>;

    /// Publishes this server's occupancy and returns the recomputed total.
    async fn update_counters(&self, distribution: &[usize]) -> Result<u64, StoreError>;

    /// Exports the per-world distribution. Failures are logged, not returned.
    async fn report_distribution(&self, distribution: &[usize]);
}

/// In-process counters for a server running on its own.
#[derive(Debug, Default)]
pub struct LocalStore {
    total: AtomicU64,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PopulationStore for LocalStore {
    fn is_coordinated(&self) -> bool {
        false
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn wait_ready(&self) -> bool {
        true
    }

    async fn total_population(&self) -> Result<u64, StoreError> {
        Ok(self.total.load(Ordering::Acquire))
    }

    async fn open_shard_count(&self) -> Result<Option<i64>, StoreError> {
        Ok(None)
    }

    async fn update_counters(&self, distribution: &[usize]) -> Result<u64, StoreError> {
        let total = distribution.iter().sum::<usize>() as u64;
        self.total.store(total, Ordering::Release);
        Ok(total)
    }

    async fn report_distribution(&self, distribution: &[usize]) {
        debug!("World distribution: {:?}", distribution);
    }
}
