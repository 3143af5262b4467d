//! Engine configuration (§6 environment inputs): where state lives, where
//! the connector file lives, how often the committer ticks, and where the
//! CDS lives. Sourced from the environment rather than a dotfile, since
//! this runs as a long-lived service rather than a per-invocation CLI.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::committer::DEFAULT_COMMIT_INTERVAL;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub connectors_file: Option<PathBuf>,
    pub commit_interval: Duration,
    pub cds_base_url: String,
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        let data_dir = std::env::var("SYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let connectors_file = Some(
            std::env::var("SYNC_CONNECTORS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./connectors.toml")),
        );

        let commit_interval = match std::env::var("SYNC_COMMIT_INTERVAL_SECS") {
            Ok(v) => Duration::from_secs(
                v.parse().with_context(|| format!("invalid SYNC_COMMIT_INTERVAL_SECS: {v}"))?,
            ),
            Err(_) => DEFAULT_COMMIT_INTERVAL,
        };

        let cds_base_url = std::env::var("SYNC_CDS_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:4000".to_string());

        Ok(EngineConfig {
            data_dir,
            connectors_file,
            commit_interval,
            cds_base_url,
        })
    }
}
