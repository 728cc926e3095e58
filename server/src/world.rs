//! Worlds: the concrete shards the gateway routes players into.
//!
//! A world owns the connections attached to it and is the only writer of its
//! own occupancy. All mutation happens under the world's mutex, so handoffs
//! arriving from concurrent routing tasks are serialized per world.

use crate::error::HandoffError;
use crate::network::GameMessage;
use crate::shard::{Connection, PopulationEvent, PopulationUpdate, Shard};
use log::{debug, info};
use shared::Packet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A player's transport handle. Packets are queued on the gateway's outbound
/// channel rather than written to the socket directly.
#[derive(Debug, Clone)]
pub struct PlayerConnection {
    pub client_id: u32,
    pub addr: SocketAddr,
    outbound: mpsc::UnboundedSender<GameMessage>,
}

impl PlayerConnection {
    pub fn new(
        client_id: u32,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<GameMessage>,
    ) -> Self {
        Self {
            client_id,
            addr,
            outbound,
        }
    }

    /// Queues a packet for this player. Returns false if the gateway is gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.outbound
            .send(GameMessage::SendPacket {
                packet,
                addr: self.addr,
            })
            .is_ok()
    }
}

impl Connection for PlayerConnection {
    fn id(&self) -> u32 {
        self.client_id
    }

    fn close(self, reason: &str) {
        let delivered = self.send(Packet::Disconnected {
            reason: reason.to_string(),
        });
        if !delivered {
            debug!(
                "Client {} already gone, dropping close notice",
                self.client_id
            );
        }
    }
}

#[derive(Debug, Default)]
struct WorldState {
    players: HashMap<u32, PlayerConnection>,
    last_update: Option<PopulationUpdate>,
}

pub struct World {
    index: usize,
    name: String,
    capacity: usize,
    running: AtomicBool,
    state: Mutex<WorldState>,
    events: mpsc::UnboundedSender<PopulationEvent>,
}

impl World {
    /// Creates a stopped world. It refuses handoffs until [`World::run`].
    pub fn new(
        index: usize,
        capacity: usize,
        events: mpsc::UnboundedSender<PopulationEvent>,
    ) -> Self {
        Self {
            index,
            name: format!("world{}", index + 1),
            capacity,
            running: AtomicBool::new(false),
            state: Mutex::new(WorldState::default()),
            events,
        }
    }

    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        info!(
            "{} created (capacity: {} players).",
            self.name, self.capacity
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn contains(&self, client_id: u32) -> bool {
        self.lock().players.contains_key(&client_id)
    }

    /// Detaches a player. Returns false if the player was not in this world,
    /// so a disconnect that races a timeout is only counted once.
    pub fn remove_player(&self, client_id: u32) -> bool {
        let removed = self.lock().players.remove(&client_id).is_some();
        if removed {
            debug!("{}: player {} left", self.name, client_id);
            self.emit(PopulationEvent::EntityRemoved {
                world: self.index,
                client_id,
            });
        }
        removed
    }

    /// Last population update applied, if any.
    pub fn last_population(&self) -> Option<PopulationUpdate> {
        self.lock().last_update
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PopulationEvent) {
        if self.events.send(event).is_err() {
            debug!("{}: population listener is gone", self.name);
        }
    }
}

impl Shard for World {
    type Conn = PlayerConnection;

    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn occupancy(&self) -> usize {
        self.lock().players.len()
    }

    fn accept_handoff(&self, conn: PlayerConnection) -> Result<(), HandoffError<PlayerConnection>> {
        if !self.is_running() {
            return Err(HandoffError::NotReady(conn));
        }

        let client_id = conn.client_id;
        {
            let mut state = self.lock();
            if state.players.contains_key(&client_id) {
                return Err(HandoffError::Duplicate(conn));
            }
            if state.players.len() >= self.capacity {
                return Err(HandoffError::Full(conn));
            }

            conn.send(Packet::Connected {
                client_id,
                world: self.name.clone(),
            });
            state.players.insert(client_id, conn);
        }

        info!("{}: player {} joined", self.name, client_id);
        self.emit(PopulationEvent::EntityAdded {
            world: self.index,
            client_id,
        });
        Ok(())
    }

    fn update_population(&self, update: PopulationUpdate) -> bool {
        let mut state = self.lock();

        let previous = state.last_update;
        if let Some(last) = previous {
            if update.epoch <= last.epoch {
                return false;
            }
        }
        state.last_update = Some(update);

        if previous.map(|last| last.total) == Some(update.total) {
            return false;
        }

        let world_players = state.players.len() as u32;
        for player in state.players.values() {
            player.send(Packet::Population {
                world_players,
                total_players: update.total,
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn running_world(
        capacity: usize,
    ) -> (
        World,
        mpsc::UnboundedReceiver<PopulationEvent>,
        mpsc::UnboundedSender<GameMessage>,
        mpsc::UnboundedReceiver<GameMessage>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let world = World::new(0, capacity, events_tx);
        world.run();
        (world, events_rx, out_tx, out_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<GameMessage>) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(GameMessage::SendPacket { packet, .. }) = rx.try_recv() {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn test_world_naming_is_one_based() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let world = World::new(2, 10, events_tx);
        assert_eq!(world.name(), "world3");
        assert_eq!(world.index(), 2);
        assert_eq!(world.capacity(), 10);
        assert_eq!(world.occupancy(), 0);
    }

    #[test]
    fn test_handoff_before_run_is_refused() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let world = World::new(0, 2, events_tx);

        let conn = PlayerConnection::new(1, test_addr(9000), out_tx);
        let result = world.accept_handoff(conn);

        assert!(matches!(result, Err(HandoffError::NotReady(_))));
        assert_eq!(world.occupancy(), 0);
    }

    #[test]
    fn test_handoff_welcomes_player_and_emits_event() {
        let (world, mut events, out_tx, mut out_rx) = running_world(2);

        let conn = PlayerConnection::new(7, test_addr(9000), out_tx);
        assert!(world.accept_handoff(conn).is_ok());

        assert_eq!(world.occupancy(), 1);
        assert!(world.contains(7));
        assert_eq!(
            drain(&mut out_rx),
            vec![Packet::Connected {
                client_id: 7,
                world: "world1".to_string()
            }]
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PopulationEvent::EntityAdded {
                world: 0,
                client_id: 7
            }
        );
    }

    #[test]
    fn test_handoff_respects_capacity() {
        let (world, _events, out_tx, _out_rx) = running_world(1);

        let first = PlayerConnection::new(1, test_addr(9000), out_tx.clone());
        let second = PlayerConnection::new(2, test_addr(9001), out_tx);

        assert!(world.accept_handoff(first).is_ok());
        let rejected = world.accept_handoff(second);

        match rejected {
            Err(HandoffError::Full(conn)) => assert_eq!(conn.client_id, 2),
            other => panic!("expected Full, got {:?}", other.map(|_| ())),
        }
        assert_eq!(world.occupancy(), 1);
    }

    #[test]
    fn test_same_connection_is_never_counted_twice() {
        let (world, _events, out_tx, _out_rx) = running_world(4);

        let conn = PlayerConnection::new(5, test_addr(9000), out_tx);
        assert!(world.accept_handoff(conn.clone()).is_ok());
        assert!(matches!(
            world.accept_handoff(conn),
            Err(HandoffError::Duplicate(_))
        ));
        assert_eq!(world.occupancy(), 1);
    }

    #[test]
    fn test_remove_player_only_once() {
        let (world, mut events, out_tx, _out_rx) = running_world(2);

        let conn = PlayerConnection::new(3, test_addr(9000), out_tx);
        world.accept_handoff(conn).unwrap();
        let _ = events.try_recv();

        assert!(world.remove_player(3));
        assert!(!world.remove_player(3));
        assert_eq!(world.occupancy(), 0);

        assert_eq!(
            events.try_recv().unwrap(),
            PopulationEvent::EntityRemoved {
                world: 0,
                client_id: 3
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_population_broadcast_is_idempotent() {
        let (world, _events, out_tx, mut out_rx) = running_world(2);
        world
            .accept_handoff(PlayerConnection::new(1, test_addr(9000), out_tx))
            .unwrap();
        drain(&mut out_rx);

        assert!(world.update_population(PopulationUpdate { epoch: 1, total: 12 }));
        assert!(!world.update_population(PopulationUpdate { epoch: 2, total: 12 }));
        assert!(!world.update_population(PopulationUpdate { epoch: 3, total: 12 }));

        assert_eq!(
            drain(&mut out_rx),
            vec![Packet::Population {
                world_players: 1,
                total_players: 12
            }]
        );
        assert_eq!(
            world.last_population(),
            Some(PopulationUpdate { epoch: 3, total: 12 })
        );
    }

    #[test]
    fn test_stale_population_update_is_dropped() {
        let (world, _events, _out_tx, _out_rx) = running_world(2);

        assert!(world.update_population(PopulationUpdate { epoch: 5, total: 40 }));
        assert!(!world.update_population(PopulationUpdate { epoch: 4, total: 38 }));
        assert!(world.update_population(PopulationUpdate { epoch: 6, total: 38 }));

        assert_eq!(
            world.last_population(),
            Some(PopulationUpdate { epoch: 6, total: 38 })
        );
    }

    #[test]
    fn test_close_after_gateway_shutdown_does_not_panic() {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        drop(out_rx);

        let conn = PlayerConnection::new(1, test_addr(9000), out_tx);
        conn.close("Server full");
    }
}
