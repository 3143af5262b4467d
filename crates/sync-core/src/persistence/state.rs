//! The three JSON-serializable maps that make up one relay's persistent
//! state, plus their load/save helpers. Kept free of any filesystem
//! knowledge beyond serde (de)serialization — `manager.rs` owns paths.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One filemeta entry, as embedded in a folder's `filemeta_v0` CRDT key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilemetaEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// `path -> metadata` for a single folder.
pub type Filemeta = BTreeMap<String, FilemetaEntry>;

/// `folder_id -> filemeta` across all folders touched on a relay.
pub type SharedFolders = BTreeMap<String, Filemeta>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalFileState {
    pub doc_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub modified_unix: f64,
}

/// `path -> state` for a single folder.
pub type FolderLocalState = BTreeMap<String, LocalFileState>;

/// `folder_id -> local state` across all folders touched on a relay.
pub type LocalState = BTreeMap<String, FolderLocalState>;

/// `resource_id -> sha256_hex` of last-materialized content, across every
/// resource kind that gets content-hashed (documents, canvases, files).
pub type DocumentHashes = BTreeMap<String, String>;

/// The full on-disk state for one relay, held in memory between
/// `load`/`save` round-trips.
#[derive(Debug, Clone, Default)]
pub struct RelayState {
    pub document_hashes: DocumentHashes,
    pub shared_folders: SharedFolders,
    pub local_state: LocalState,
}

impl RelayState {
    pub fn folder_filemeta(&self, folder_id: &str) -> Filemeta {
        self.shared_folders.get(folder_id).cloned().unwrap_or_default()
    }

    pub fn folder_local_state(&self, folder_id: &str) -> FolderLocalState {
        self.local_state.get(folder_id).cloned().unwrap_or_default()
    }
}
