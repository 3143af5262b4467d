//! Core engine for materializing CDS-hosted folders, documents, canvases,
//! and files into plain Git repositories, and pushing local edits back out.
//!
//! The binaries (`sync-cli`, `sync-server`) are thin: this crate owns the
//! resource model, the persistence layer, the ingestion queue, the
//! reconciliation algorithm, and the committer.

pub mod canvas;
pub mod cds_client;
pub mod committer;
pub mod config;
pub mod connector;
pub mod error;
pub mod hash;
pub mod index;
pub mod persistence;
pub mod queue;
pub mod resource;
pub mod sync;
pub mod webhook;

pub use cds_client::{CdsClient, CdsError, HttpCdsClient};
pub use committer::Committer;
pub use connector::ConnectorConfig;
pub use config::EngineConfig;
pub use error::{SyncError, Result};
pub use persistence::PersistenceManager;
pub use queue::{IngestionQueue, QueueItem, SyncState};
pub use resource::Resource;
pub use sync::SyncEngine;
