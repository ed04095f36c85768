// src/main.rs
mod config;
mod db;
mod error;
mod handlers;
mod identity;
mod live;
mod models;
mod poll;
mod routes;
mod services;
mod snapshot;
mod state;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use dotenvy::dotenv;
use tokio::net::TcpListener;
use tokio::signal::{self, ctrl_c};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;
use crate::live::Broadcaster;
use crate::state::AppState;
use crate::store::{MemoryStore, VoteStore};

#[tokio::main]
async fn main() {
    dotenv().ok(); // Load environment variables from .env file

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load();

    let store: Arc<dyn VoteStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::create_pool(url, config.db_max_connections)
                .await
                .expect("Failed to connect to the database");
            db::bootstrap(&pool)
                .await
                .expect("Failed to prepare the database schema");
            info!("Connected to PostgreSQL");
            Arc::new(db::PgStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, votes are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(store, config);
    let live = state.live.clone();
    let address = SocketAddr::from(([0, 0, 0, 0], state.config.port));

    let app = routes::create_routes(state);

    let listener = TcpListener::bind(address)
        .await
        .expect("Failed to bind the listen address");
    info!("Server running on {address}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(live))
        .await
        .expect("Server error");

    info!("Server stopped");
}

/// Resolves on Ctrl+C or SIGTERM. Live streams are closed first so the
/// graceful shutdown does not wait on them.
async fn shutdown_signal(live: Broadcaster) {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let subscribers = live.registry().total_subscribers();
    info!(subscribers, "closing live subscriptions");
    live.shutdown();
}
