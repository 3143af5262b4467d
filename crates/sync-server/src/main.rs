mod app_state;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::post, Router};
use sync_core::{
    committer::Committer, persistence::PersistenceManager, queue::SyncState, ConnectorConfig,
    EngineConfig, HttpCdsClient, IngestionQueue, SyncEngine,
};

use crate::app_state::AppState;
use crate::handlers::webhook::webhook_handler;

fn load_connectors(config: &EngineConfig) -> anyhow::Result<ConnectorConfig> {
    match &config.connectors_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            ConnectorConfig::from_toml_str(&raw).map_err(Into::into)
        }
        None => {
            tracing::warn!("no SYNC_CONNECTORS_FILE set, running with zero configured connectors");
            Ok(ConnectorConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::load()?;
    let connectors = load_connectors(&config)?;

    let persistence = Arc::new(PersistenceManager::new(config.data_dir.clone()));
    for connector in connectors.connectors {
        persistence.register_connector(connector);
    }
    let cds = HttpCdsClient::new(config.cds_base_url.clone());
    let sync_state = Arc::new(SyncState::new());
    let engine = Arc::new(SyncEngine::new(Arc::clone(&persistence), cds, Arc::clone(&sync_state)));

    let (queue, receiver) = IngestionQueue::new();
    let worker_engine = Arc::clone(&engine);
    let worker = tokio::spawn(async move { worker_engine.run_worker(receiver).await });
    let committer_task = tokio::spawn(Committer::new(persistence, Arc::clone(&sync_state), config.commit_interval).run());

    let state = Arc::new(AppState { queue });
    let app = Router::new()
        .route("/webhooks/cds", post(webhook_handler))
        .with_state(state);

    let addr: SocketAddr = "0.0.0.0:8787".parse().unwrap();
    tracing::info!("relay-sync-server listening on {addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    sync_state.request_stop();
    let _ = worker.await;
    let _ = committer_task.await;
    Ok(())
}
