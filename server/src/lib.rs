//! # World Gateway Server Library
//!
//! This library implements the front door of a multiplayer game server that
//! runs several capacity-bounded worlds. It decides which world every new
//! player joins, keeps each world's population figure current, and reports
//! how players are spread across worlds.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Each connecting player gets exactly one admission attempt. On its own a
//! server fills worlds in order. When several servers share a metrics store,
//! a server only keeps as many worlds open as the store says and sends each
//! player to the least crowded of those. A rejected player is told why and
//! disconnected.
//!
//! ### Population Tracking
//! Worlds report every join and leave. The reconciler publishes this
//! server's counts to the store, reads back the global total, and pushes it
//! to every world so players can see how many people are online. A periodic
//! poll picks up changes made by other servers.
//!
//! ### Status Reporting
//! The per-world distribution can be queried at any time as a JSON array.
//!
//! ## Architecture Design
//!
//! ### Shared, Fixed Pool
//! Worlds are created once at startup and shared by `Arc`. Each world
//! serializes its own occupancy changes behind a mutex, so routing tasks can
//! run concurrently without overfilling a world.
//!
//! ### Graceful Degradation
//! The metrics store is a hint, never an authority. If it is slow or down,
//! routing falls back to the local policy for that player and the
//! reconciler skips a cycle. Nothing in the store path can stop the server.
//!
//! ## Module Organization
//!
//! - `shard`: capability traits for worlds and connections
//! - `world`: the concrete world and player connection
//! - `pool`: the fixed set of worlds
//! - `store` / `metrics`: local counters and the shared metrics client
//! - `router`: admission policies
//! - `reconciler`: population propagation
//! - `status`: distribution snapshots
//! - `network` / `client_manager`: the UDP gateway and its sessions
//! - `config` / `error`: settings and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::pool::ShardPool;
//! use server::router::ConnectionRouter;
//! use server::store::LocalStore;
//! use server::network::Server;
//! use server::world::World;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::{mpsc, watch};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (events_tx, _events_rx) = mpsc::unbounded_channel();
//!     let worlds: Vec<World> = (0..3)
//!         .map(|i| World::new(i, 100, events_tx.clone()))
//!         .collect();
//!     worlds.iter().for_each(World::run);
//!
//!     let pool = Arc::new(ShardPool::new(worlds));
//!     let router = Arc::new(ConnectionRouter::new(Arc::clone(&pool), Arc::new(LocalStore::new())));
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//!     let mut server = Server::bind(
//!         "127.0.0.1:8000",
//!         pool,
//!         router,
//!         Duration::from_secs(5),
//!         shutdown_rx,
//!     )
//!     .await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod pool;
pub mod reconciler;
pub mod router;
pub mod shard;
pub mod status;
pub mod store;
pub mod world;

#[cfg(test)]
pub(crate) mod testing;
