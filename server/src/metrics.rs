//! Client for the shared metrics store used when several game servers
//! cooperate.
//!
//! The store is a plain key/value service reached over UDP. Each game server
//! publishes `player_count_<name>`, recomputes `total_players` from every
//! server's count, and reads `world_count_<name>` to learn how many of its
//! worlds should accept new players.
//!
//! Requests carry an id; a background receiver matches replies to waiting
//! callers, so concurrent routing tasks never wait on each other's round
//! trips. Every request is bounded by the configured timeout.

use crate::error::StoreError;
use crate::store::PopulationStore;
use async_trait::async_trait;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    player_count_key, world_count_key, world_distribution_key, StoreCommand, StoreReply,
    StoreRequest, StoreResponse, MAX_DATAGRAM_SIZE, TOTAL_PLAYERS_KEY,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout};

const READINESS_RETRY: Duration = Duration::from_secs(1);

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<StoreReply>>>>;

/// Identity of this server within the cooperating group.
#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub server_name: String,
    /// Every server whose player count contributes to the total.
    pub game_servers: Vec<String>,
    pub request_timeout: Duration,
}

pub struct MetricsStore {
    settings: MetricsSettings,
    socket: Arc<UdpSocket>,
    pending: PendingReplies,
    next_request_id: AtomicU64,
    ready: watch::Sender<bool>,
    stop: watch::Sender<bool>,
}

impl MetricsStore {
    /// Opens a socket to the store and starts the reply receiver and the
    /// readiness probe. Returns before the store has answered; use
    /// [`PopulationStore::wait_ready`] to wait for it.
    pub async fn connect(
        store_addr: SocketAddr,
        mut settings: MetricsSettings,
    ) -> Result<Arc<Self>, StoreError> {
        let bind_addr = if store_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(store_addr).await?;

        if !settings.game_servers.contains(&settings.server_name) {
            settings.game_servers.push(settings.server_name.clone());
        }

        let (ready, _) = watch::channel(false);
        let (stop, stop_rx) = watch::channel(false);

        let store = Arc::new(Self {
            settings,
            socket: Arc::new(socket),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            ready,
            stop,
        });

        Self::spawn_reply_receiver(Arc::clone(&store.socket), Arc::clone(&store.pending), stop_rx);
        Self::spawn_readiness_probe(Arc::downgrade(&store));

        info!("Metrics store client connecting to {}", store_addr);
        Ok(store)
    }

    pub fn server_name(&self) -> &str {
        &self.settings.server_name
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self
            .request(StoreCommand::Get {
                key: key.to_string(),
            })
            .await?
        {
            StoreReply::Value(value) => Ok(value),
            other => Err(StoreError::Unexpected(format!("{:?}", other))),
        }
    }

    pub async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        match self
            .request(StoreCommand::Set {
                key: key.to_string(),
                value,
            })
            .await?
        {
            StoreReply::Stored => Ok(()),
            other => Err(StoreError::Unexpected(format!("{:?}", other))),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match self.request(StoreCommand::Ping).await? {
            StoreReply::Pong => Ok(()),
            other => Err(StoreError::Unexpected(format!("{:?}", other))),
        }
    }

    async fn request(&self, command: StoreCommand) -> Result<StoreReply, StoreError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = serialize(&StoreRequest {
            request_id,
            command,
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, reply_tx);

        if let Err(e) = self.socket.send(&frame).await {
            lock(&self.pending).remove(&request_id);
            return Err(e.into());
        }

        match timeout(self.settings.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(StoreError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                Err(StoreError::Timeout(self.settings.request_timeout))
            }
        }
    }

    async fn read_count(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| StoreError::Unexpected(format!("{} holds {:?}", key, raw))),
        }
    }

    fn spawn_reply_receiver(
        socket: Arc<UdpSocket>,
        pending: PendingReplies,
        mut stop: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    received = socket.recv(&mut buffer) => match received {
                        Ok(len) => match deserialize::<StoreResponse>(&buffer[..len]) {
                            Ok(response) => {
                                let waiter = lock(&pending).remove(&response.request_id);
                                match waiter {
                                    Some(waiter) => {
                                        let _ = waiter.send(response.reply);
                                    }
                                    None => debug!(
                                        "Late metrics reply for request {}",
                                        response.request_id
                                    ),
                                }
                            }
                            Err(e) => warn!("Undecodable metrics store reply: {}", e),
                        },
                        Err(e) => {
                            error!("Error receiving from metrics store: {}", e);
                            sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
            debug!("Metrics reply receiver stopped");
        });
    }

    fn spawn_readiness_probe(store: Weak<Self>) {
        tokio::spawn(async move {
            loop {
                let Some(client) = store.upgrade() else {
                    return;
                };

                match client.ping().await {
                    Ok(()) => {
                        info!("Metrics store is ready");
                        client.ready.send_replace(true);
                        return;
                    }
                    Err(e) => warn!("Metrics store not ready yet: {}", e),
                }
                drop(client);

                sleep(READINESS_RETRY).await;
            }
        });
    }
}

impl Drop for MetricsStore {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

#[async_trait]
impl PopulationStore for MetricsStore {
    fn is_coordinated(&self) -> bool {
        true
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the store has answered a ping.
    async fn wait_ready(&self) -> bool {
        let mut ready = self.ready.subscribe();
        loop {
            if *ready.borrow_and_update() {
                return true;
            }
            if ready.changed().await.is_err() {
                return false;
            }
        }
    }

    async fn total_population(&self) -> Result<u64, StoreError> {
        let total = self.read_count(TOTAL_PLAYERS_KEY).await?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }

    /// A value that is not a number counts as unset. Only transport
    /// failures are errors.
    async fn open_shard_count(&self) -> Result<Option<i64>, StoreError> {
        match self
            .read_count(&world_count_key(&self.settings.server_name))
            .await
        {
            Err(StoreError::Unexpected(detail)) => {
                warn!("Ignoring malformed world count: {}", detail);
                Ok(None)
            }
            result => result,
        }
    }

    async fn update_counters(&self, distribution: &[usize]) -> Result<u64, StoreError> {
        let player_count: usize = distribution.iter().sum();
        self.set(
            &player_count_key(&self.settings.server_name),
            player_count.to_string(),
        )
        .await?;

        let mut total_players: u64 = 0;
        for server in &self.settings.game_servers {
            let key = player_count_key(server);
            let count = match self.read_count(&key).await {
                Ok(count) => count.unwrap_or(0).max(0) as u64,
                Err(StoreError::Unexpected(detail)) => {
                    warn!("Ignoring malformed player count: {}", detail);
                    0
                }
                Err(e) => return Err(e),
            };
            total_players += count;
        }

        self.set(TOTAL_PLAYERS_KEY, total_players.to_string())
            .await?;
        debug!(
            "{} reports {} players, {} in total",
            self.settings.server_name, player_count, total_players
        );
        Ok(total_players)
    }

    async fn report_distribution(&self, distribution: &[usize]) {
        let encoded = match serde_json::to_string(distribution) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Could not encode world distribution: {}", e);
                return;
            }
        };

        let key = world_distribution_key(&self.settings.server_name);
        if let Err(e) = self.set(&key, encoded).await {
            warn!("Could not export world distribution: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_store::KvStore;
    use tokio_test::{assert_err, assert_ok};

    fn settings(name: &str, servers: &[&str]) -> MetricsSettings {
        MetricsSettings {
            server_name: name.to_string(),
            game_servers: servers.iter().map(|s| s.to_string()).collect(),
            request_timeout: Duration::from_millis(300),
        }
    }

    async fn start_backend() -> (SocketAddr, Arc<KvStore>) {
        let kv = Arc::new(KvStore::new());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let backend = Arc::clone(&kv);
        tokio::spawn(async move {
            // Dropping the sender would stop the backend
            let _stop_tx = stop_tx;
            metrics_store::serve(socket, backend, stop_rx).await;
        });
        (addr, kv)
    }

    #[tokio::test]
    async fn test_becomes_ready_once_backend_answers() {
        let (addr, _kv) = start_backend().await;
        let store = MetricsStore::connect(addr, settings("server1", &[]))
            .await
            .unwrap();

        assert!(timeout(Duration::from_secs(2), store.wait_ready())
            .await
            .unwrap());
        assert!(store.is_ready());
        assert!(store.is_coordinated());
    }

    #[tokio::test]
    async fn test_update_counters_sums_all_servers() {
        let (addr, kv) = start_backend().await;
        kv.set(player_count_key("server2"), "7".to_string());

        let store = MetricsStore::connect(addr, settings("server1", &["server1", "server2"]))
            .await
            .unwrap();
        store.wait_ready().await;

        let total = assert_ok!(store.update_counters(&[2, 1]).await);
        assert_eq!(total, 10);
        assert_eq!(kv.get(&player_count_key("server1")), Some("3".to_string()));
        assert_eq!(kv.get(TOTAL_PLAYERS_KEY), Some("10".to_string()));
        assert_eq!(assert_ok!(store.total_population().await), 10);
    }

    #[tokio::test]
    async fn test_own_server_is_always_counted() {
        let (addr, kv) = start_backend().await;
        let store = MetricsStore::connect(addr, settings("solo", &["other"]))
            .await
            .unwrap();

        let total = assert_ok!(store.update_counters(&[4]).await);
        assert_eq!(total, 4);
        assert_eq!(kv.get(&player_count_key("solo")), Some("4".to_string()));
    }

    #[tokio::test]
    async fn test_open_shard_count_reads_world_count_key() {
        let (addr, kv) = start_backend().await;
        let store = MetricsStore::connect(addr, settings("server1", &[]))
            .await
            .unwrap();

        assert_eq!(assert_ok!(store.open_shard_count().await), None);

        kv.set(world_count_key("server1"), "2".to_string());
        assert_eq!(assert_ok!(store.open_shard_count().await), Some(2));

        kv.set(world_count_key("server1"), "lots".to_string());
        assert_eq!(assert_ok!(store.open_shard_count().await), None);
    }

    #[tokio::test]
    async fn test_malformed_world_count_opens_every_world() {
        use crate::pool::ShardPool;
        use crate::router::ConnectionRouter;
        use crate::testing::{MockConnection, MockShard};

        let (addr, kv) = start_backend().await;
        kv.set(world_count_key("server1"), "lots".to_string());
        let store = MetricsStore::connect(addr, settings("server1", &[]))
            .await
            .unwrap();
        assert!(timeout(Duration::from_secs(2), store.wait_ready())
            .await
            .unwrap());

        let pool = Arc::new(ShardPool::new(vec![
            MockShard::with_occupancy(10, 5),
            MockShard::with_occupancy(10, 0),
        ]));
        let router = ConnectionRouter::new(Arc::clone(&pool), store);

        let (conn, _) = MockConnection::new(1);
        assert_eq!(router.route(conn).await, Ok(1));
        assert_eq!(pool.distribution(), vec![5, 1]);
    }

    #[tokio::test]
    async fn test_report_distribution_as_json() {
        let (addr, kv) = start_backend().await;
        let store = MetricsStore::connect(addr, settings("server1", &[]))
            .await
            .unwrap();

        store.report_distribution(&[3, 0, 12]).await;
        assert_eq!(
            kv.get(&world_distribution_key("server1")),
            Some("[3,0,12]".to_string())
        );
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        // Bound but never answered
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let store = MetricsStore::connect(addr, settings("server1", &[]))
            .await
            .unwrap();

        let result = store.total_population().await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert_err!(store.open_shard_count().await);
        assert!(!store.is_ready());
    }
}
