use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use market_indexer::api::latency::LatencyStats;
use market_indexer::api::routes::{router, ApiState};
use market_indexer::chain::connection::ConnectionManager;
use market_indexer::chain::feed::AlloyConnector;
use market_indexer::config::Config;
use market_indexer::db::Store;
use market_indexer::error::Result;
use market_indexer::identity::IdentityClient;
use market_indexer::indexer::Indexer;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database ---
    let store = Store::connect(&cfg.db_path, cfg.db_max_connections).await?;

    // --- Chain feed ---
    let connector = Arc::new(AlloyConnector::new(
        cfg.rpc_ws_url.clone(),
        cfg.rpc_http_url.clone(),
        cfg.multicall_address,
    ));
    let connection = ConnectionManager::connect(connector, cfg.connect_retry()).await?;
    info!(mode = %connection.mode(), factory = %cfg.factory_address, "chain feed ready");

    // --- Indexer: factory listener + startup backfill ---
    let latency = Arc::new(LatencyStats::new());
    let indexer = Indexer::new(
        Arc::new(connection),
        store.clone(),
        cfg.factory_address,
        Arc::clone(&latency),
    );
    let markets = indexer.start().await?;
    info!(markets, subscriptions = indexer.registry().len(), "startup backfill complete");

    // Health probe (every HEALTH_CHECK_INTERVAL_SECS, plus on demand)
    tokio::spawn(Arc::clone(&indexer).run_health_probe(cfg.health_check_interval));

    // Stale listener sweep (every SWEEP_INTERVAL_SECS)
    tokio::spawn(Arc::clone(&indexer).run_sweep(cfg.sweep_interval));

    // --- HTTP API ---
    let identity = IdentityClient::new(cfg.identity_api_url.clone(), cfg.identity_api_key.clone())?;
    let app = router(ApiState { store, identity, indexer, latency });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
