mod api;
mod auth;
mod config;
mod error;
mod market;
mod storage;
mod trading;
mod websocket;

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::interval;
use log::{info, error};

use crate::api::{create_api_router, cors_layer, ApiState};
use crate::auth::{JwtGenerator, JwtValidator, UserStore};
use crate::config::{Config, DEFAULT_SYMBOLS, STATS_INTERVAL_SECS};
use crate::market::{PriceDriver, PriceTable};
use crate::storage::Database;
use crate::trading::OrderStore;
use crate::websocket::{run_listener, BroadcastHub, STREAM_PATH};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    // Market state and streaming fan-out
    let table = Arc::new(PriceTable::new(DEFAULT_SYMBOLS)?);
    let hub = Arc::new(BroadcastHub::new());

    // Accounts and orders
    let db_path = config.db_path.clone();
    let db = tokio::task::spawn_blocking(move || Database::open(db_path)).await??;
    let users = UserStore::new(db.clone(), bcrypt::DEFAULT_COST);
    let seed_users = users.clone();
    tokio::task::spawn_blocking(move || seed_users.seed_default()).await??;
    let orders = OrderStore::new(db);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = PriceDriver::new(
        table.clone(),
        hub.clone(),
        Duration::from_secs(config.price_tick_secs),
    ).spawn(shutdown_rx.clone());

    start_stats_task(hub.clone(), users.clone(), orders.clone());

    // Start API server
    let api_state = ApiState {
        table: table.clone(),
        users,
        orders,
        jwt_generator: Arc::new(JwtGenerator::new(&config.jwt_secret)),
        jwt_validator: Arc::new(JwtValidator::new(&config.jwt_secret)),
    };

    let api_router = create_api_router(api_state)
        .layer(cors_layer(&config.allowed_origins));

    let api_listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("🌐 HTTP API server running at http://{}", config.api_bind_address);

    let api_server = axum::serve(api_listener, api_router);

    // Start WebSocket server
    let ws_listener = TcpListener::bind(&config.bind_address).await?;
    info!("🚀 Price stream running at ws://{}{}", config.bind_address, STREAM_PATH);

    let mut websocket_server = tokio::spawn(run_listener(ws_listener, hub.clone(), table.clone(), shutdown_rx));

    tokio::select! {
        result = api_server => {
            error!("API server stopped: {:?}", result);
        }
        result = &mut websocket_server => {
            error!("WebSocket server stopped: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Stop ticking first so nothing is published into a closing hub. The
    // listener then closes every client and waits for their close frames.
    let _ = shutdown_tx.send(true);
    if let Err(e) = driver.await {
        error!("Price driver task failed: {}", e);
    }
    if !websocket_server.is_finished() {
        if let Err(e) = websocket_server.await {
            error!("WebSocket server task failed: {}", e);
        }
    }

    Ok(())
}

fn start_stats_task(hub: Arc<BroadcastHub>, users: UserStore, orders: OrderStore) {
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(STATS_INTERVAL_SECS));

        loop {
            interval_timer.tick().await;

            let (orders, users) = (orders.clone(), users.clone());
            let counts = tokio::task::spawn_blocking(move || (orders.get_stats(), users.user_count())).await;
            let ((order_count, trading_users), accounts) = match counts {
                Ok(counts) => counts,
                Err(e) => {
                    error!("Stats query failed: {}", e);
                    continue;
                }
            };

            if !hub.is_empty() || order_count > 0 {
                info!("Stats - Streaming clients: {}, Orders: {}, Trading users: {}, Accounts: {}",
                      hub.len(), order_count, trading_users, accounts);
            }
        }
    });

    info!("📈 Started stats monitoring task (every {} seconds)", STATS_INTERVAL_SECS);
}
