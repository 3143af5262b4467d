use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use sync_core::resource::Resource;
use sync_core::{
    committer::Committer, persistence::PersistenceManager, queue::SyncState, ConnectorConfig,
    EngineConfig, HttpCdsClient, IngestionQueue, SyncEngine,
};

use anyhow::{Context, Result};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync worker and committer as a foreground daemon.
    Run,
    /// Enqueue a single sync request for one resource and run it to completion.
    Sync {
        relay_id: String,
        folder_id: String,
        resource_id: String,
        #[arg(short, long, value_enum)]
        kind: ResourceKindArg,
    },
}

#[derive(ValueEnum, Clone, Debug)]
enum ResourceKindArg {
    Folder,
    Document,
    Canvas,
    File,
}

fn build_resource(kind: ResourceKindArg, relay_id: String, folder_id: String, resource_id: String) -> Resource {
    match kind {
        ResourceKindArg::Folder => Resource::Folder { relay_id, folder_id: resource_id },
        ResourceKindArg::Document => Resource::Document { relay_id, folder_id, document_id: resource_id },
        ResourceKindArg::Canvas => Resource::Canvas { relay_id, folder_id, canvas_id: resource_id },
        ResourceKindArg::File => Resource::File { relay_id, folder_id, file_id: resource_id },
    }
}

fn load_connectors(config: &EngineConfig) -> Result<ConnectorConfig> {
    match &config.connectors_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read connectors file {}", path.display()))?;
            ConnectorConfig::from_toml_str(&raw).map_err(Into::into)
        }
        None => {
            tracing::warn!("no SYNC_CONNECTORS_FILE set, running with zero configured connectors");
            Ok(ConnectorConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = EngineConfig::load().context("failed to load engine configuration")?;
    let connectors = load_connectors(&config)?;

    let persistence = Arc::new(PersistenceManager::new(config.data_dir.clone()));
    let folders: Vec<(String, String)> = connectors
        .connectors
        .iter()
        .map(|c| (c.relay_id.clone(), c.shared_folder_id.clone()))
        .collect();
    for connector in connectors.connectors {
        persistence.register_connector(connector);
    }
    let cds = HttpCdsClient::new(config.cds_base_url.clone());
    let sync_state = Arc::new(SyncState::new());
    let engine = Arc::new(SyncEngine::new(Arc::clone(&persistence), cds, Arc::clone(&sync_state)));

    match args.command {
        Commands::Run => {
            let (queue, receiver) = IngestionQueue::new();

            // Startup producer (§4.2: "enqueue_sync_request, produced by
            // CLI/startup"): every configured connector gets an initial
            // folder reconciliation without waiting on a webhook.
            for (relay_id, folder_id) in folders {
                queue.enqueue_sync_request(
                    Resource::Folder { relay_id, folder_id },
                    chrono::Utc::now(),
                );
            }

            let worker_engine = Arc::clone(&engine);
            let worker = tokio::spawn(async move { worker_engine.run_worker(receiver).await });

            let committer = Committer::new(persistence, Arc::clone(&sync_state), config.commit_interval);
            let committer_task = tokio::spawn(committer.run());

            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            tracing::info!("shutdown requested");
            sync_state.request_stop();

            let _ = worker.await;
            let _ = committer_task.await;
        }
        Commands::Sync { relay_id, folder_id, resource_id, kind } => {
            let resource = build_resource(kind, relay_id, folder_id, resource_id);
            engine.process_sync_request(resource, chrono::Utc::now()).await;
            if sync_state.take_has_changes() {
                persistence.commit_all();
            }
        }
    }

    Ok(())
}
