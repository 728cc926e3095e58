//! Chooses a world for every new connection.
//!
//! Two admission policies exist:
//!
//! - **Local**: used when there is no shared metrics store or it has not
//!   answered yet. Worlds are filled in pool order; the first world with a
//!   free slot gets the player.
//! - **Coordinated**: used once the shared store is ready. The store says how
//!   many worlds this server should keep open (`k`), and the player joins the
//!   least populated of the first `k` worlds. Ties go to the earliest world.
//!
//! Each connection gets exactly one admission attempt. A rejected connection
//! is closed immediately and nothing else changes. A successful admission
//! increments exactly one world's occupancy through its handoff, and the world
//! then reports the population change itself.

use crate::error::{HandoffError, RouteError};
use crate::pool::ShardPool;
use crate::shard::{Connection, Shard};
use crate::store::PopulationStore;
use log::{debug, error, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    Local,
    Coordinated,
}

/// A refused admission, still holding the connection so it can be closed.
struct Rejection<C> {
    error: RouteError,
    conn: C,
}

pub struct ConnectionRouter<S, P> {
    pool: Arc<ShardPool<S>>,
    store: Arc<P>,
}

impl<S: Shard, P: PopulationStore> ConnectionRouter<S, P> {
    pub fn new(pool: Arc<ShardPool<S>>, store: Arc<P>) -> Self {
        Self { pool, store }
    }

    /// Policy that would apply to a connection arriving now.
    pub fn policy(&self) -> AdmissionPolicy {
        if self.store.is_coordinated() && self.store.is_ready() {
            AdmissionPolicy::Coordinated
        } else {
            AdmissionPolicy::Local
        }
    }

    /// Admits `conn` to a world and returns the world's pool index.
    ///
    /// On rejection the connection has already been closed.
    pub async fn route(&self, conn: S::Conn) -> Result<usize, RouteError> {
        let client_id = conn.id();

        let outcome = match self.policy() {
            AdmissionPolicy::Local => self.admit_local(conn),
            AdmissionPolicy::Coordinated => match self.store.open_shard_count().await {
                Ok(open_count) => self.admit_coordinated(conn, open_count),
                Err(e) => {
                    warn!(
                        "Metrics store unavailable ({}), routing client {} locally",
                        e, client_id
                    );
                    self.admit_local(conn)
                }
            },
        };

        match outcome {
            Ok(index) => {
                debug!("Client {} routed to world index {}", client_id, index);
                Ok(index)
            }
            Err(Rejection { error, conn }) => {
                error!(
                    "Rejecting client {}: {} (worlds: {:?}, capacity: {})",
                    client_id,
                    error,
                    self.pool.distribution(),
                    self.pool.total_capacity()
                );
                conn.close(&error.to_string());
                Err(error)
            }
        }
    }

    fn admit_local(&self, conn: S::Conn) -> Result<usize, Rejection<S::Conn>> {
        match select_first_open(&self.pool) {
            Some(index) => self.hand_off(index, conn, RouteError::NoCapacity),
            None => Err(Rejection {
                error: RouteError::NoCapacity,
                conn,
            }),
        }
    }

    fn admit_coordinated(
        &self,
        conn: S::Conn,
        open_count: Option<i64>,
    ) -> Result<usize, Rejection<S::Conn>> {
        match select_least_populated(&self.pool, open_count) {
            Some(index) => self.hand_off(index, conn, RouteError::NoSuitableShard),
            None => Err(Rejection {
                error: RouteError::NoSuitableShard,
                conn,
            }),
        }
    }

    /// `when_full` is reported if the world filled up after it was selected.
    fn hand_off(
        &self,
        index: usize,
        conn: S::Conn,
        when_full: RouteError,
    ) -> Result<usize, Rejection<S::Conn>> {
        let Some(shard) = self.pool.get(index) else {
            return Err(Rejection {
                error: RouteError::NoSuitableShard,
                conn,
            });
        };

        shard.accept_handoff(conn).map(|()| index).map_err(|e| {
            let error = match e {
                HandoffError::Full(_) => when_full,
                HandoffError::NotReady(_) | HandoffError::Duplicate(_) => {
                    RouteError::NoSuitableShard
                }
            };
            warn!("{} refused handoff: {}", shard.name(), e);
            Rejection {
                error,
                conn: e.into_connection(),
            }
        })
    }
}

/// First world in pool order with a free slot.
pub fn select_first_open<S: Shard>(pool: &ShardPool<S>) -> Option<usize> {
    pool.iter().position(|shard| shard.has_capacity())
}

/// Number of worlds eligible under an open-world limit.
///
/// A missing or non-positive limit means every world is open.
pub fn candidate_count(pool_size: usize, open_count: Option<i64>) -> usize {
    match open_count {
        Some(k) if k > 0 => usize::try_from(k).unwrap_or(usize::MAX).min(pool_size),
        _ => pool_size,
    }
}

/// Least populated of the open worlds; the earliest wins a tie.
pub fn select_least_populated<S: Shard>(
    pool: &ShardPool<S>,
    open_count: Option<i64>,
) -> Option<usize> {
    pool.iter()
        .take(candidate_count(pool.len(), open_count))
        .enumerate()
        .min_by_key(|(_, shard)| shard.occupancy())
        .map(|(index, _)| index)
}
