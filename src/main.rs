use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use tablegraph_indexer::{
    api, config::Config, queue, service::IndexService, AppState,
};
use tokio::sync::{mpsc, RwLock};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tablegraph_indexer=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("Using a generated API key; set TABLEGRAPH_API_KEY to call the service");
    }

    let service = tokio::task::spawn_blocking({
        let config = config.clone();
        move || IndexService::open(&config)
    })
    .await??;
    info!(
        graph_db = %config.graph_db.display(),
        schema_dir = %config.schema_dir.display(),
        index = %service.index_path().display(),
        keys = service.index().key_count(),
        embeddings = config.embedding.is_some(),
        "Index service ready"
    );

    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    let state = AppState {
        config: config.clone(),
        jobs: Arc::new(RwLock::new(HashMap::new())),
        queue_tx,
        service: Arc::new(Mutex::new(service)),
    };

    queue::spawn_ingest_worker(state.clone(), queue_rx);
    queue::spawn_cleanup_worker(state.clone());

    let app = api::build_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("tablegraph-indexer listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
