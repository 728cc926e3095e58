//! Gateway network layer: accepts players over UDP and hands them to worlds

use crate::client_manager::{Client, ClientManager};
use crate::error::RouteError;
use crate::pool::ShardPool;
use crate::router::ConnectionRouter;
use crate::shard::Connection;
use crate::status::StatusReporter;
use crate::store::PopulationStore;
use crate::world::{PlayerConnection, World};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};

/// Messages sent from network tasks to main gateway loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    Routed {
        client_id: u32,
        result: Result<usize, RouteError>,
    },
    ClientTimeout {
        client: Client,
    },
}

/// Messages queued for the network sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

pub struct Server<P> {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    pool: Arc<ShardPool<World>>,
    router: Arc<ConnectionRouter<World, P>>,
    status: StatusReporter<World>,
    client_timeout: Duration,
    shutdown: watch::Receiver<bool>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl<P: PopulationStore> Server<P> {
    pub async fn bind(
        addr: &str,
        pool: Arc<ShardPool<World>>,
        router: Arc<ConnectionRouter<World, P>>,
        client_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, std::io::Error> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new())),
            status: StatusReporter::new(Arc::clone(&pool)),
            pool,
            router,
            client_timeout,
            shutdown,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let timeout = self.client_timeout;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts(timeout)
                };

                for client in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Takes a player out of its world, if it made it into one.
    fn leave_world(&self, client: &Client) {
        if let Some(world) = client.world.and_then(|index| self.pool.get(index)) {
            world.remove_player(client.id);
        }
    }

    /// Processes incoming packets
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                if client_version != PROTOCOL_VERSION {
                    warn!(
                        "Client at {} speaks protocol {}, expected {}",
                        addr, client_version, PROTOCOL_VERSION
                    );
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Protocol version mismatch".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                // Remove existing connection if present
                let existing = {
                    let mut clients = self.clients.write().await;
                    let existing_id = clients.find_client_by_addr(addr);
                    existing_id.and_then(|id| clients.remove_client(&id))
                };
                if let Some(existing) = existing {
                    info!("Replacing existing client {} from {}", existing.id, addr);
                    self.leave_world(&existing);
                }

                let client_id = self.clients.write().await.add_client(addr);
                let conn = PlayerConnection::new(client_id, addr, self.game_tx.clone());

                // Coordinated routing awaits the metrics store; never block
                // other players on it
                let router = Arc::clone(&self.router);
                let server_tx = self.server_tx.clone();
                tokio::spawn(async move {
                    let result = router.route(conn).await;
                    if server_tx
                        .send(ServerMessage::Routed { client_id, result })
                        .is_err()
                    {
                        debug!("Gateway stopped before client {} was routed", client_id);
                    }
                });
            }

            Packet::Heartbeat => {
                let client_id = {
                    let clients = self.clients.read().await;
                    clients.find_client_by_addr(addr)
                };

                if let Some(client_id) = client_id {
                    self.clients.write().await.touch(client_id);
                }
            }

            Packet::Disconnect => {
                let removed = {
                    let mut clients = self.clients.write().await;
                    let client_id = clients.find_client_by_addr(addr);
                    client_id.and_then(|id| clients.remove_client(&id))
                };

                if let Some(client) = removed {
                    self.leave_world(&client);
                }
            }

            Packet::StatusRequest => match self.status.to_json() {
                Ok(distribution) => self.send_packet(Packet::Status { distribution }, addr),
                Err(e) => error!("Failed to encode status: {}", e),
            },

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_routed(&mut self, client_id: u32, result: Result<usize, RouteError>) {
        match result {
            Ok(world) => {
                let assigned = self.clients.write().await.assign_world(client_id, world);
                if !assigned {
                    // The player left while routing was in flight
                    if let Some(world) = self.pool.get(world) {
                        world.remove_player(client_id);
                    }
                }
            }
            Err(_) => {
                self.clients.write().await.remove_client(&client_id);
            }
        }
    }

    fn handle_timeout(&self, client: Client) {
        info!("Client {} timed out", client.id);
        self.leave_world(&client);
        PlayerConnection::new(client.id, client.addr, self.game_tx.clone()).close("Client timeout");
    }

    /// Main gateway loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        info!("Server started successfully");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::Routed { client_id, result }) => {
                            self.handle_routed(client_id, result).await;
                        },
                        Some(ServerMessage::ClientTimeout { client }) => {
                            self.handle_timeout(client);
                        },
                        None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = shutdown.changed() => {
                    info!("Server shutting down");
                    break;
                },
            }
        }

        Ok(())
    }
}
