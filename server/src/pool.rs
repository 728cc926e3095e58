//! The fixed set of worlds created at startup.

use crate::shard::{PopulationUpdate, Shard};
use std::sync::Arc;

/// Ordered, fixed-size collection of shards.
///
/// Built once and never resized. Components share it through an `Arc` and
/// only ever read the list itself; occupancy changes happen inside each
/// shard.
pub struct ShardPool<S> {
    shards: Vec<Arc<S>>,
}

impl<S: Shard> ShardPool<S> {
    pub fn new(shards: Vec<S>) -> Self {
        Self {
            shards: shards.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<S>> {
        self.shards.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<S>> {
        self.shards.iter()
    }

    /// Occupancy of every shard in pool order.
    pub fn distribution(&self) -> Vec<usize> {
        self.shards.iter().map(|shard| shard.occupancy()).collect()
    }

    pub fn total_capacity(&self) -> usize {
        self.shards.iter().map(|shard| shard.capacity()).sum()
    }

    pub fn total_occupancy(&self) -> usize {
        self.shards.iter().map(|shard| shard.occupancy()).sum()
    }

    /// Delivers a population update to every shard. Returns how many shards
    /// actually changed what they display.
    pub fn broadcast_population(&self, update: PopulationUpdate) -> usize {
        self.shards
            .iter()
            .filter(|shard| shard.update_population(update))
            .count()
    }
}
