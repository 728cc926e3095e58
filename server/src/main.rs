use clap::Parser;
use log::{error, info};
use server::config::{Args, Config};
use server::metrics::MetricsStore;
use server::network::Server;
use server::pool::ShardPool;
use server::reconciler::PopulationReconciler;
use server::router::ConnectionRouter;
use server::shard::PopulationEvent;
use server::store::{LocalStore, PopulationStore};
use server::world::World;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Main-method of the application.
/// Loads the configuration, creates the worlds, then runs the gateway and the
/// population reconciler until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(&args.default_config, &args.config)?;
    args.apply_overrides(&mut config);

    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();

    if !args.config.exists() {
        info!(
            "This server can be customized by creating a configuration file named: {}",
            args.config.display()
        );
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel::<PopulationEvent>();

    // Create worlds
    let worlds: Vec<World> = (0..config.nb_worlds)
        .map(|index| World::new(index, config.nb_players_per_world, events_tx.clone()))
        .collect();
    worlds.iter().for_each(World::run);
    let pool = Arc::new(ShardPool::new(worlds));
    info!(
        "{} worlds ready, {} player slots in total",
        pool.len(),
        pool.total_capacity()
    );

    if config.metrics_enabled {
        let metrics_addr = config.metrics_address();
        let store_addr = tokio::net::lookup_host(&metrics_addr)
            .await?
            .next()
            .ok_or_else(|| format!("Cannot resolve metrics store address {}", metrics_addr))?;
        let store = MetricsStore::connect(store_addr, config.metrics_settings()).await?;
        serve(&config, pool, store, events_rx).await
    } else {
        info!("Metrics disabled, filling worlds in order");
        serve(&config, pool, Arc::new(LocalStore::new()), events_rx).await
    }
}

/// Runs the gateway against one population store until shutdown.
async fn serve<P: PopulationStore>(
    config: &Config,
    pool: Arc<ShardPool<World>>,
    store: Arc<P>,
    events_rx: mpsc::UnboundedReceiver<PopulationEvent>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Arc::new(PopulationReconciler::new(
        Arc::clone(&pool),
        Arc::clone(&store),
        shutdown_rx.clone(),
    ));
    let router = Arc::new(ConnectionRouter::new(Arc::clone(&pool), store));

    // Publishes the starting counters itself once the store answers
    let reconciler_handle = tokio::spawn(reconciler.run(config.population_interval(), events_rx));

    let mut server = Server::bind(
        &config.bind_address(),
        pool,
        router,
        config.client_timeout(),
        shutdown_rx,
    )
    .await?;

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_handle.await {
        error!("Population reconciler task panicked: {}", e);
    }

    Ok(())
}
