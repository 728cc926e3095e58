use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
/// Largest UDP payload over IPv4. Every receive buffer is this big.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub const TOTAL_PLAYERS_KEY: &str = "total_players";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Heartbeat,
    Disconnect,
    StatusRequest,

    Connected {
        client_id: u32,
        world: String,
    },
    Population {
        world_players: u32,
        total_players: u64,
    },
    Status {
        distribution: String,
    },
    Disconnected {
        reason: String,
    },
}

/// Commands understood by the shared metrics store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum StoreCommand {
    Ping,
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoreRequest {
    pub request_id: u64,
    pub command: StoreCommand,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum StoreReply {
    Pong,
    Value(Option<String>),
    Stored,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoreResponse {
    pub request_id: u64,
    pub reply: StoreReply,
}

/// Key holding the player count reported by one game server.
pub fn player_count_key(server_name: &str) -> String {
    format!("player_count_{}", server_name)
}

/// Key an operator sets to limit how many worlds a server keeps open.
pub fn world_count_key(server_name: &str) -> String {
    format!("world_count_{}", server_name)
}

pub fn world_distribution_key(server_name: &str) -> String {
    format!("world_distribution_{}", server_name)
}

/// Whether a JSON distribution fits in one datagram both as a status reply
/// and as the store write exporting it for `server_name`.
pub fn distribution_fits(server_name: &str, distribution: &str) -> bool {
    let status = Packet::Status {
        distribution: distribution.to_string(),
    };
    let export = StoreRequest {
        request_id: u64::MAX,
        command: StoreCommand::Set {
            key: world_distribution_key(server_name),
            value: distribution.to_string(),
        },
    };

    let fits = |size: bincode::Result<u64>| matches!(size, Ok(n) if n <= MAX_DATAGRAM_SIZE as u64);
    fits(bincode::serialized_size(&status)) && fits(bincode::serialized_size(&export))
}
