//! Read-only view of how players are spread across worlds.

use crate::pool::ShardPool;
use crate::shard::Shard;
use std::sync::Arc;

pub struct StatusReporter<S> {
    pool: Arc<ShardPool<S>>,
}

impl<S: Shard> StatusReporter<S> {
    pub fn new(pool: Arc<ShardPool<S>>) -> Self {
        Self { pool }
    }

    /// Occupancy per world, in pool order. Each entry is read under its
    /// world's lock, so no entry is ever half-updated.
    pub fn snapshot(&self) -> Vec<usize> {
        self.pool.distribution()
    }

    /// The snapshot as a JSON array, e.g. `[12,3,0]`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.snapshot())
    }
}

impl<S> Clone for StatusReporter<S> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ConnectionRouter;
    use crate::testing::{MockConnection, MockShard, MockStore};

    #[test]
    fn test_snapshot_in_pool_order() {
        let pool = Arc::new(ShardPool::new(vec![
            MockShard::with_occupancy(10, 4),
            MockShard::with_occupancy(10, 0),
            MockShard::with_occupancy(10, 9),
        ]));
        let reporter = StatusReporter::new(pool);

        assert_eq!(reporter.snapshot(), vec![4, 0, 9]);
        assert_eq!(reporter.to_json().unwrap(), "[4,0,9]");
    }

    #[test]
    fn test_empty_worlds_serialize() {
        let pool = Arc::new(ShardPool::new(vec![MockShard::new(1), MockShard::new(1)]));
        assert_eq!(StatusReporter::new(pool).to_json().unwrap(), "[0,0]");
    }

    #[tokio::test]
    async fn test_snapshot_during_routing_stays_consistent() {
        let pool = Arc::new(ShardPool::new(vec![
            MockShard::new(50),
            MockShard::new(50),
            MockShard::new(50),
        ]));
        let store = Arc::new(MockStore::coordinated(None));
        let router = Arc::new(ConnectionRouter::new(Arc::clone(&pool), store));
        let reporter = StatusReporter::new(Arc::clone(&pool));

        let routing = {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                for id in 0..120 {
                    let (conn, _) = MockConnection::new(id);
                    let _ = router.route(conn).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let total_capacity = pool.total_capacity();
        let mut previous_sum = 0;
        while !routing.is_finished() {
            let snapshot = reporter.snapshot();
            let sum: usize = snapshot.iter().sum();
            assert_eq!(snapshot.len(), 3);
            assert!(sum <= total_capacity);
            assert!(sum >= previous_sum);
            previous_sum = sum;
            tokio::task::yield_now().await;
        }
        routing.await.unwrap();

        assert_eq!(reporter.snapshot(), vec![40, 40, 40]);
    }
}
