//! Test doubles for shards, connections and population stores.

use crate::error::{HandoffError, StoreError};
use crate::shard::{Connection, PopulationUpdate, Shard};
use crate::store::PopulationStore;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct MockConnection {
    pub id: u32,
    pub closes: Arc<AtomicUsize>,
}

impl MockConnection {
    pub fn new(id: u32) -> (Self, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                id,
                closes: Arc::clone(&closes),
            },
            closes,
        )
    }
}

impl Connection for MockConnection {
    fn id(&self) -> u32 {
        self.id
    }

    fn close(self, _reason: &str) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockShard {
    capacity: usize,
    ready: bool,
    members: Mutex<HashSet<u32>>,
    /// Players attached before the test started, not tied to a connection
    preloaded: usize,
    handoffs: AtomicUsize,
    population_calls: AtomicUsize,
    last_update: Mutex<Option<PopulationUpdate>>,
}

impl MockShard {
    pub fn new(capacity: usize) -> Self {
        Self::with_occupancy(capacity, 0)
    }

    pub fn with_occupancy(capacity: usize, occupancy: usize) -> Self {
        Self {
            capacity,
            ready: true,
            members: Mutex::new(HashSet::new()),
            preloaded: occupancy,
            handoffs: AtomicUsize::new(0),
            population_calls: AtomicUsize::new(0),
            last_update: Mutex::new(None),
        }
    }

    pub fn not_ready(capacity: usize) -> Self {
        Self {
            ready: false,
            ..Self::new(capacity)
        }
    }

    pub fn handoffs(&self) -> usize {
        self.handoffs.load(Ordering::SeqCst)
    }

    pub fn population_calls(&self) -> usize {
        self.population_calls.load(Ordering::SeqCst)
    }

    pub fn displayed_total(&self) -> Option<u64> {
        self.last_update.lock().unwrap().map(|update| update.total)
    }
}

impl Shard for MockShard {
    type Conn = MockConnection;

    fn name(&self) -> &str {
        "mock"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn occupancy(&self) -> usize {
        self.preloaded + self.members.lock().unwrap().len()
    }

    fn accept_handoff(&self, conn: MockConnection) -> Result<(), HandoffError<MockConnection>> {
        self.handoffs.fetch_add(1, Ordering::SeqCst);
        if !self.ready {
            return Err(HandoffError::NotReady(conn));
        }

        let mut members = self.members.lock().unwrap();
        if members.contains(&conn.id) {
            return Err(HandoffError::Duplicate(conn));
        }
        if self.preloaded + members.len() >= self.capacity {
            return Err(HandoffError::Full(conn));
        }
        members.insert(conn.id);
        Ok(())
    }

    fn update_population(&self, update: PopulationUpdate) -> bool {
        self.population_calls.fetch_add(1, Ordering::SeqCst);

        let mut last = self.last_update.lock().unwrap();
        let previous = *last;
        if let Some(previous) = previous {
            if update.epoch <= previous.epoch {
                return false;
            }
        }
        *last = Some(update);
        previous.map(|p| p.total) != Some(update.total)
    }
}

/// Scriptable population store.
#[derive(Debug)]
pub struct MockStore {
    coordinated: bool,
    ready: AtomicBool,
    failing: AtomicBool,
    open_count: Mutex<Option<i64>>,
    /// Players on other servers, added to this server's count
    remote_players: AtomicU64,
    total: AtomicU64,
    delay: Mutex<Option<Duration>>,
    publish_delay: Mutex<Option<Duration>>,
    pub total_reads: AtomicUsize,
    pub open_count_reads: AtomicUsize,
    pub counter_updates: Mutex<Vec<Vec<usize>>>,
    pub distribution_reports: AtomicUsize,
}

impl MockStore {
    pub fn local() -> Self {
        Self::build(false, None)
    }

    pub fn coordinated(open_count: Option<i64>) -> Self {
        Self::build(true, open_count)
    }

    fn build(coordinated: bool, open_count: Option<i64>) -> Self {
        Self {
            coordinated,
            ready: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            open_count: Mutex::new(open_count),
            remote_players: AtomicU64::new(0),
            total: AtomicU64::new(0),
            delay: Mutex::new(None),
            publish_delay: Mutex::new(None),
            total_reads: AtomicUsize::new(0),
            open_count_reads: AtomicUsize::new(0),
            counter_updates: Mutex::new(Vec::new()),
            distribution_reports: AtomicUsize::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_open_count(&self, open_count: Option<i64>) {
        *self.open_count.lock().unwrap() = open_count;
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn set_remote_players(&self, players: u64) {
        self.remote_players.store(players, Ordering::SeqCst);
    }

    /// Makes every store call wait before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Makes only `update_counters` wait, on top of any common delay.
    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock().unwrap() = Some(delay);
    }

    async fn respond(&self) -> Result<(), StoreError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout(Duration::from_millis(500)));
        }
        Ok(())
    }
}

#[async_trait]
impl PopulationStore for MockStore {
    fn is_coordinated(&self) -> bool {
        self.coordinated
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn wait_ready(&self) -> bool {
        self.is_ready()
    }

    async fn total_population(&self) -> Result<u64, StoreError> {
        self.total_reads.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        Ok(self.total.load(Ordering::SeqCst))
    }

    async fn open_shard_count(&self) -> Result<Option<i64>, StoreError> {
        self.open_count_reads.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        let open_count = *self.open_count.lock().unwrap();
        Ok(open_count)
    }

    async fn update_counters(&self, distribution: &[usize]) -> Result<u64, StoreError> {
        self.counter_updates
            .lock()
            .unwrap()
            .push(distribution.to_vec());
        let publish_delay = *self.publish_delay.lock().unwrap();
        if let Some(delay) = publish_delay {
            tokio::time::sleep(delay).await;
        }
        self.respond().await?;
        let local: u64 = distribution.iter().map(|&n| n as u64).sum();
        let total = local + self.remote_players.load(Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
        Ok(total)
    }

    async fn report_distribution(&self, _distribution: &[usize]) {
        self.distribution_reports.fetch_add(1, Ordering::SeqCst);
    }
}
