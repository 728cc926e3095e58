//! Asks a running gateway how its players are spread across worlds.

use bincode::{deserialize, serialize};
use clap::Parser;
use shared::{Packet, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(author, version, about = "Query a gateway's world distribution", long_about = None)]
struct Args {
    /// Gateway address
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    server: SocketAddr,

    /// How long to wait for the answer, in milliseconds
    #[arg(short, long, default_value = "1000")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let bind_addr = if args.server.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(args.server).await?;
    socket.send(&serialize(&Packet::StatusRequest)?).await?;

    let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
    let wait = Duration::from_millis(args.timeout);

    loop {
        let len = match timeout(wait, socket.recv(&mut buffer)).await {
            Ok(received) => received?,
            Err(_) => {
                return Err(format!("No answer from {} within {:?}", args.server, wait).into());
            }
        };

        match deserialize::<Packet>(&buffer[..len]) {
            Ok(Packet::Status { distribution }) => {
                println!("{}", distribution);
                return Ok(());
            }
            Ok(other) => eprintln!("Ignoring unexpected packet: {:?}", other),
            Err(e) => eprintln!("Ignoring malformed packet: {}", e),
        }
    }
}
