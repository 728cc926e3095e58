use clap::Parser;
use log::info;
use metrics_store::{parse_seed, serve, KvStore};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared population metrics store", long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8090")]
    port: u16,

    /// Initial entries, e.g. --set world_count_server1=2
    #[arg(long = "set", value_parser = parse_seed)]
    seeds: Vec<(String, String)>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let store = Arc::new(KvStore::new());
    for (key, value) in args.seeds {
        info!("Seeding {} = {}", key, value);
        store.set(key, value);
    }

    let socket = UdpSocket::bind((args.host.as_str(), args.port)).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(serve(socket, store, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    server.await?;

    Ok(())
}
