//! Resource index: an in-memory derivation of persisted state, keyed by
//! bare resource id, yielding `(kind, folder_id, path)` in O(1). Never
//! maintained incrementally across call sites — always rebuilt wholesale
//! from the three state maps after a save, which is the one discipline
//! that keeps it from drifting.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::persistence::state::RelayState;
use crate::resource::{looks_like_compound_id, ResourceKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub kind: ResourceKind,
    pub folder_id: String,
    pub path: String,
}

#[derive(Default)]
struct RelayIndex {
    by_resource_id: HashMap<String, IndexEntry>,
}

/// One reader/writer lock per relay, per §4.1's concurrency note.
#[derive(Default)]
pub struct ResourceIndex {
    relays: RwLock<HashMap<String, RwLock<RelayIndex>>>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, relay_id: &str, resource_id: &str) -> Option<IndexEntry> {
        let relays = self.relays.read().expect("resource index lock poisoned");
        let relay = relays.get(relay_id)?;
        let relay = relay.read().expect("relay index lock poisoned");
        relay.by_resource_id.get(resource_id).cloned()
    }

    pub fn update(&self, relay_id: &str, resource_id: &str, entry: IndexEntry) {
        self.ensure_relay(relay_id);
        let relays = self.relays.read().expect("resource index lock poisoned");
        let relay = relays.get(relay_id).expect("relay just ensured");
        let mut relay = relay.write().expect("relay index lock poisoned");
        relay.by_resource_id.insert(resource_id.to_string(), entry);
    }

    pub fn remove(&self, relay_id: &str, resource_id: &str) {
        let relays = self.relays.read().expect("resource index lock poisoned");
        if let Some(relay) = relays.get(relay_id) {
            let mut relay = relay.write().expect("relay index lock poisoned");
            relay.by_resource_id.remove(resource_id);
        }
    }

    fn ensure_relay(&self, relay_id: &str) {
        if self.relays.read().expect("resource index lock poisoned").contains_key(relay_id) {
            return;
        }
        let mut relays = self.relays.write().expect("resource index lock poisoned");
        relays.entry(relay_id.to_string()).or_default();
    }

    /// Fully reconstruct a relay's index from its persisted state, in the
    /// build order from §4.1: folders from filemeta, then documents from
    /// local_state (authoritative for path), then documents from filemeta
    /// not yet present, then standalone entries in document_hashes. Any id
    /// matching the compound-id heuristic is discarded as legacy.
    pub fn rebuild(&self, relay_id: &str, state: &RelayState) {
        self.ensure_relay(relay_id);
        let mut fresh = RelayIndex::default();

        for (folder_id, filemeta) in &state.shared_folders {
            for entry in filemeta.values() {
                if entry.kind == "folder" && !looks_like_compound_id(&entry.id) {
                    fresh.by_resource_id.insert(
                        entry.id.clone(),
                        IndexEntry {
                            kind: ResourceKind::Folder,
                            folder_id: folder_id.clone(),
                            path: String::new(),
                        },
                    );
                }
            }
        }

        for (folder_id, local) in &state.local_state {
            for (path, entry) in local {
                if looks_like_compound_id(&entry.doc_id) {
                    continue;
                }
                let kind = crate::resource::classify_metadata_type(&entry.kind)
                    .map(|(k, _)| k)
                    .unwrap_or(ResourceKind::Document);
                fresh.by_resource_id.insert(
                    entry.doc_id.clone(),
                    IndexEntry {
                        kind,
                        folder_id: folder_id.clone(),
                        path: path.clone(),
                    },
                );
            }
        }

        for (folder_id, filemeta) in &state.shared_folders {
            for (path, entry) in filemeta {
                if entry.kind == "folder" || looks_like_compound_id(&entry.id) {
                    continue;
                }
                fresh
                    .by_resource_id
                    .entry(entry.id.clone())
                    .or_insert_with(|| {
                        let kind = crate::resource::classify_metadata_type(&entry.kind)
                            .map(|(k, _)| k)
                            .unwrap_or(ResourceKind::Document);
                        IndexEntry {
                            kind,
                            folder_id: folder_id.clone(),
                            path: path.clone(),
                        }
                    });
            }
        }

        for resource_id in state.document_hashes.keys() {
            if looks_like_compound_id(resource_id) {
                continue;
            }
            fresh.by_resource_id.entry(resource_id.clone()).or_insert_with(|| IndexEntry {
                kind: ResourceKind::Document,
                folder_id: String::new(),
                path: String::new(),
            });
        }

        let relays = self.relays.read().expect("resource index lock poisoned");
        let relay = relays.get(relay_id).expect("relay just ensured");
        let mut relay = relay.write().expect("relay index lock poisoned");
        *relay = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::state::{FilemetaEntry, LocalFileState};

    fn sample_state() -> RelayState {
        let mut state = RelayState::default();
        let mut filemeta = crate::persistence::state::Filemeta::new();
        filemeta.insert(
            "/sub".to_string(),
            FilemetaEntry {
                id: "folder-1".to_string(),
                kind: "folder".to_string(),
                hash: None,
            },
        );
        filemeta.insert(
            "/sub/a.md".to_string(),
            FilemetaEntry {
                id: "doc-1".to_string(),
                kind: "document".to_string(),
                hash: Some("h1".to_string()),
            },
        );
        state.shared_folders.insert("F1".to_string(), filemeta);

        let mut local = crate::persistence::state::FolderLocalState::new();
        local.insert(
            "/sub/a.md".to_string(),
            LocalFileState {
                doc_id: "doc-1".to_string(),
                hash: Some("h1".to_string()),
                kind: "document".to_string(),
                modified_unix: 0.0,
            },
        );
        state.local_state.insert("F1".to_string(), local);
        state
    }

    #[test]
    fn rebuild_finds_folder_and_document() {
        let index = ResourceIndex::new();
        let state = sample_state();
        index.rebuild("R1", &state);

        let folder = index.lookup("R1", "folder-1").expect("folder indexed");
        assert_eq!(folder.kind, ResourceKind::Folder);
        assert_eq!(folder.folder_id, "F1");

        let doc = index.lookup("R1", "doc-1").expect("document indexed");
        assert_eq!(doc.kind, ResourceKind::Document);
        assert_eq!(doc.path, "/sub/a.md");
    }

    #[test]
    fn rebuild_is_idempotent() {
        let index = ResourceIndex::new();
        let state = sample_state();
        index.rebuild("R1", &state);
        let first = index.lookup("R1", "doc-1");
        index.rebuild("R1", &state);
        let second = index.lookup("R1", "doc-1");
        assert_eq!(first, second);
    }

    #[test]
    fn compound_ids_are_dropped() {
        let index = ResourceIndex::new();
        let mut state = RelayState::default();
        let compound = "550e8400-e29b-41d4-a716-446655440000-660e8400-e29b-41d4-a716-446655440001";
        state
            .document_hashes
            .insert(compound.to_string(), "deadbeef".to_string());
        index.rebuild("R1", &state);
        assert!(index.lookup("R1", compound).is_none());
    }
}
