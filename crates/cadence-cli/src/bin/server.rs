//! HTTP server daemon (component M, §4.M, §6): binds `cadence_server`'s
//! router to a socket. This is the only binary that actually exposes the
//! nine §6 operations over HTTP; `cadence-scheduler` and `cadence-worker`
//! drive the store directly and never listen on a port.
//!
//! Run with:
//!   CADENCE_DATABASE_URL=./cadence.db CADENCE_BIND_ADDR=0.0.0.0:8080 \
//!     cargo run -p cadence-cli --bin cadence-server

use std::sync::Arc;

use cadence_runtime::{Config, InMemoryEventBus, SqliteStore};
use cadence_server::{build_router, AppState};

fn sqlite_path(database_url: &str) -> &str {
    database_url.strip_prefix("sqlite:").unwrap_or(database_url)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let store = Arc::new(SqliteStore::open(sqlite_path(&config.database_url))?);
    let events = Arc::new(InMemoryEventBus::new());

    let state = AppState {
        store,
        events,
        config: config.clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(bind_addr = %config.bind_addr, "HTTP server starting");
    axum::serve(listener, app).await?;

    Ok(())
}
