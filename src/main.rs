mod config;
mod db;
mod frame;
mod routes;
mod services;
mod state;
mod store;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::ChatConfig;
use crate::store::{ChatStore, MemoryStore, PgStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ChatConfig::from_env();

    let store: Arc<dyn ChatStore> = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .expect("failed to create upload directory");

    let port = config.port;
    let state = state::AppState::new(store, config);

    // Expire typing entries whose clients stopped refreshing them.
    let _sweeper = services::typing::spawn_typing_sweeper(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "chatcore listening");
    axum::serve(listener, app).await.expect("server failed");
}
