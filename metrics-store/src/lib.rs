//! # Metrics Store
//!
//! A small in-memory key/value service that several game servers share to
//! agree on population figures. Each server publishes its own player count
//! and reads back the total; operators can set `world_count_<server>` to cap
//! how many worlds a server keeps open.
//!
//! The store speaks [`shared::StoreRequest`] / [`shared::StoreResponse`]
//! frames over UDP, encoded with bincode. Every request gets exactly one
//! reply carrying the same request id. There is no persistence; a restart
//! starts empty and game servers repopulate their keys on the next
//! population change.

use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{StoreCommand, StoreReply, StoreRequest, StoreResponse, MAX_DATAGRAM_SIZE};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Thread-safe key/value table.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: String, value: String) {
        self.lock().insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Applies one command and produces its reply.
    pub fn apply(&self, command: StoreCommand) -> StoreReply {
        match command {
            StoreCommand::Ping => StoreReply::Pong,
            StoreCommand::Get { key } => StoreReply::Value(self.get(&key)),
            StoreCommand::Set { key, value } => {
                debug!("{} = {}", key, value);
                self.set(key, value);
                StoreReply::Stored
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parses a `key=value` seed as given on the command line.
pub fn parse_seed(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

/// Answers requests on `socket` until `shutdown` flips to true or its sender
/// is dropped.
pub async fn serve(socket: UdpSocket, store: Arc<KvStore>, mut shutdown: watch::Receiver<bool>) {
    if let Ok(addr) = socket.local_addr() {
        info!("Metrics store listening on {}", addr);
    }

    let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Metrics store shutting down");
                break;
            }
            received = socket.recv_from(&mut buffer) => {
                let (len, addr) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Error receiving request: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };

                let request = match deserialize::<StoreRequest>(&buffer[..len]) {
                    Ok(request) => request,
                    Err(_) => {
                        warn!("Failed to deserialize request from {}", addr);
                        continue;
                    }
                };

                let response = StoreResponse {
                    request_id: request.request_id,
                    reply: store.apply(request.command),
                };

                match serialize(&response) {
                    Ok(data) => {
                        if let Err(e) = socket.send_to(&data, addr).await {
                            error!("Failed to reply to {}: {}", addr, e);
                        }
                    }
                    Err(e) => error!("Failed to encode reply for {}: {}", addr, e),
                }
            }
        }
    }
}
