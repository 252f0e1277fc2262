//! relayq server binary.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use relayq::metastore::memory::MemoryMetadataStore;
use relayq::store::redis::RedisStore;
use relayq::{http, observability, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    observability::init(&config.logging);

    let store = Arc::new(
        RedisStore::connect(&config.redis, config.retention.clone())
            .context("configuring redis store")?,
    );
    let metastore = Arc::new(MemoryMetadataStore::new());

    let port = config.service.port;
    let state = AppState::build(config, store, metastore);
    state.start_background().await;

    let app = http::router(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "relayq listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving")?;

    state.graceful_shutdown().await;
    Ok(())
}
