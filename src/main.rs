//! Application entry-point – boots the multi-chain arbitrage monitor.
//!
//! 1. Load configuration → initialise tracing.
//! 2. Connect the persistence gateway, bootstrap the schema, register chains.
//! 3. Per chain: spin up a connector, a chain monitor and a pool scanner.
//! 4. Start the broadcast hub (heartbeats), the hourly aggregator and the
//!    metrics + WebSocket server.
//! 5. Clean, cancellation-token-driven shutdown on Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use warp::Filter;

use arbmon::{
    aggregator::StatsAggregator,
    analyzer::TransactionAnalyzer,
    config::{Config, NativePriceFeed, DEFAULT_CONFIG_PATH},
    connector::{ChainRpc, RpcConnector},
    database::{DatabaseManager, Persistence},
    hub::BroadcastHub,
    metrics,
    monitor::ChainMonitor,
    profit::ProfitCalculator,
    scanner::PoolScanner,
    stream,
};

const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(5);
const CIRCUIT_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("ethers_providers=warn".parse().expect("static directive"))
        .add_directive("ethers=warn".parse().expect("static directive"))
        .add_directive("tokio_postgres=warn".parse().expect("static directive"))
        .add_directive("arbmon=info".parse().expect("static directive"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("ARBMON_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Arc::new(Config::load(&config_path).await?);
    info!(
        chains = config.chains.len(),
        config_path = %config_path,
        "Configuration loaded"
    );

    // Persistence comes up first: an unreachable store at boot is fatal,
    // the orchestrator restarts us.
    let database = Arc::new(DatabaseManager::connect(&config.database).await?);
    database.initialize_schema().await?;
    for chain in config.chains.values() {
        database.register_chain(chain).await?;
    }
    let persistence: Arc<dyn Persistence> = database.clone();

    let hub = BroadcastHub::new(config.hub.clone());
    let root_cancel = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    handles.push(tokio::spawn(
        hub.clone().run_heartbeat(root_cancel.child_token()),
    ));

    for chain_config in config.chains.values() {
        let connector = Arc::new(RpcConnector::new(chain_config)?);
        let price_feed = NativePriceFeed::new(
            chain_config.native_token_symbol.clone(),
            chain_config.native_token_usd_price,
        );

        let analyzer = TransactionAnalyzer::new(
            chain_config.chain_name.clone(),
            chain_config.router_set(),
            &chain_config.extra_swap_selectors,
        );
        let profit = ProfitCalculator::new(chain_config.chain_name.clone(), price_feed.clone());

        let monitor = ChainMonitor::new(
            chain_config.clone(),
            connector.clone(),
            analyzer,
            profit,
            persistence.clone(),
            hub.clone(),
            root_cancel.child_token(),
        );
        handles.push(tokio::spawn(monitor.run()));

        let scanner = PoolScanner::new(
            chain_config.clone(),
            connector.clone(),
            persistence.clone(),
            hub.clone(),
            root_cancel.child_token(),
        );
        handles.push(tokio::spawn(scanner.run()));

        handles.push(tokio::spawn(sample_circuit_states(
            connector,
            root_cancel.child_token(),
        )));

        info!(
            chain = %chain_config.chain_name,
            chain_id = chain_config.chain_id,
            pools = chain_config.pools.len(),
            routers = chain_config.dex_routers.len(),
            "Chain pipeline started"
        );
    }

    let aggregator = StatsAggregator::new(&config, persistence.clone(), root_cancel.child_token());
    handles.push(tokio::spawn(aggregator.run()));

    // Metrics, liveness and the subscriber stream share one server.
    let routes = metrics::metrics_route()
        .or(stream::stream_route(hub.clone()))
        .or(warp::path("health").map(|| warp::reply::json(&serde_json::json!({"status": "ok"}))));
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| eyre::eyre!("invalid server bind address: {}", e))?;
    let server_cancel = root_cancel.child_token();
    let (bound, server) = warp::serve(routes)
        .bind_with_graceful_shutdown(addr, async move { server_cancel.cancelled().await });
    info!(addr = %bound, "Serving /metrics, /health and /ws/v1/stream");
    handles.push(tokio::spawn(server));

    signal::ctrl_c().await?;
    info!("SIGINT received, shutting down");
    root_cancel.cancel();

    for handle in handles {
        if timeout(SHUTDOWN_TASK_TIMEOUT, handle).await.is_err() {
            warn!("Task did not stop within the shutdown window");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Periodically publish every endpoint's circuit state to the metrics
/// surface.
async fn sample_circuit_states(connector: Arc<RpcConnector>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(CIRCUIT_SAMPLE_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = connector.endpoint_health().await;
                metrics::record_circuit_states(connector.chain_name(), &stats);
            }
        }
    }
}
