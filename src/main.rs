mod config;
mod db;
mod message;
mod model;
mod puzzle;
mod registry;
mod routes;
mod services;
mod state;
mod store;

use std::sync::Arc;

use crate::puzzle::{MemoryCatalog, PuzzleCatalog};
use crate::store::Store;
use crate::store::memory::MemoryStore;
use crate::store::pg::{PgCatalog, PgStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = config::HubConfig::from_env();

    let (store, puzzles): (Arc<dyn Store>, Arc<dyn PuzzleCatalog>) = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed");
            (
                Arc::new(PgStore::new(pool.clone())) as Arc<dyn Store>,
                Arc::new(PgCatalog::new(pool)) as Arc<dyn PuzzleCatalog>,
            )
        }
        None => {
            let (catalog, demo_id) = MemoryCatalog::with_demo();
            tracing::warn!(%demo_id, "DATABASE_URL not set — in-memory store with the demo puzzle");
            (
                Arc::new(MemoryStore::new()) as Arc<dyn Store>,
                Arc::new(catalog) as Arc<dyn PuzzleCatalog>,
            )
        }
    };

    let registry = registry::spawn_registry();
    let port = config.port;
    let state = state::AppState::new(store, puzzles, registry, config);

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "crosshub listening");
    axum::serve(listener, app).await.expect("server failed");
}
