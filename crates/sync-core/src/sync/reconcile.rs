//! The four-phase folder reconciliation algorithm (§4.4.3): the pure,
//! synchronous planning half. Execution (fetching content, writing files)
//! lives in `engine.rs`, which calls into these functions and then runs
//! each planned operation.

use std::collections::{HashMap, HashSet};

use crate::persistence::state::{Filemeta, FolderLocalState};
use crate::resource::{classify_metadata_type, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Rename,
    Delete,
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    Planned,
    Completed,
    Errored(String),
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub kind: OperationKind,
    pub path: String,
    pub from_path: Option<String>,
    pub resource_id: String,
    pub resource_kind: ResourceKind,
    pub hash: Option<String>,
    pub status: OpStatus,
}

/// Phase 1: every `new_filemeta` entry typed `folder`, in no particular
/// order within the phase (the phase itself must run before phase 2).
pub fn phase1_folders(new_filemeta: &Filemeta) -> Vec<(String, String)> {
    new_filemeta
        .iter()
        .filter(|(_, meta)| meta.kind == "folder")
        .map(|(path, meta)| (path.clone(), meta.id.clone()))
        .collect()
}

/// Resolves the hash-comparison ambiguity noted in the design notes: when
/// the remote supplies a hash, compare directly; when it doesn't, always
/// require an update rather than trusting an unverifiable local match.
fn hashes_agree(remote: Option<&str>, local: Option<&str>) -> bool {
    matches!((remote, local), (Some(r), Some(l)) if r == l)
}

/// Phase 2: classify every file-bearing entry into exactly one operation.
/// UPDATE wins over RENAME when both could apply; CREATE is the fallback.
pub fn phase2_classify(
    new_filemeta: &Filemeta,
    local_state: &FolderLocalState,
) -> Vec<SyncOperation> {
    // id -> old path, for the rename lookup.
    let by_doc_id: HashMap<&str, &str> = local_state
        .iter()
        .map(|(path, entry)| (entry.doc_id.as_str(), path.as_str()))
        .collect();

    let mut ops = Vec::new();
    for (path, meta) in new_filemeta {
        let Some((kind, _sub)) = classify_metadata_type(&meta.kind) else {
            continue;
        };
        if kind == ResourceKind::Folder {
            continue;
        }

        if let Some(local) = local_state.get(path) {
            if hashes_agree(meta.hash.as_deref(), local.hash.as_deref()) {
                ops.push(SyncOperation {
                    kind: OperationKind::Noop,
                    path: path.clone(),
                    from_path: None,
                    resource_id: meta.id.clone(),
                    resource_kind: kind,
                    hash: meta.hash.clone(),
                    status: OpStatus::Planned,
                });
            } else {
                ops.push(SyncOperation {
                    kind: OperationKind::Update,
                    path: path.clone(),
                    from_path: None,
                    resource_id: meta.id.clone(),
                    resource_kind: kind,
                    hash: meta.hash.clone(),
                    status: OpStatus::Planned,
                });
            }
            continue;
        }

        if let Some(&old_path) = by_doc_id.get(meta.id.as_str()) {
            if old_path != path {
                // local_state is keyed by path, so the old entry (not the
                // new one looked up above) holds the content hash this id
                // had before the move. A rename that also changed content
                // must fetch the new bytes, not just relocate the old ones
                // — phase 4 cleans up the stale path left behind.
                let old_hash = local_state.get(old_path).and_then(|e| e.hash.as_deref());
                let op_kind = if hashes_agree(meta.hash.as_deref(), old_hash) {
                    OperationKind::Rename
                } else {
                    OperationKind::Update
                };
                ops.push(SyncOperation {
                    kind: op_kind,
                    path: path.clone(),
                    from_path: Some(old_path.to_string()),
                    resource_id: meta.id.clone(),
                    resource_kind: kind,
                    hash: meta.hash.clone(),
                    status: OpStatus::Planned,
                });
                continue;
            }
        }

        ops.push(SyncOperation {
            kind: OperationKind::Create,
            path: path.clone(),
            from_path: None,
            resource_id: meta.id.clone(),
            resource_kind: kind,
            hash: meta.hash.clone(),
            status: OpStatus::Planned,
        });
    }
    ops
}

/// Phase 3's remote path set: every path present in `new_filemeta`,
/// including folders, normalized both with and without a leading slash so
/// phase 4's comparison (which tries both forms) always hits.
pub fn remote_path_set(new_filemeta: &Filemeta) -> HashSet<String> {
    let mut set = HashSet::new();
    for path in new_filemeta.keys() {
        set.insert(path.clone());
        set.insert(normalize_leading_slash(path));
    }
    set
}

fn normalize_leading_slash(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix('/') {
        stripped.to_string()
    } else {
        format!("/{path}")
    }
}

/// Phase 4: every materialized path not present in the remote set
/// (tried both with and without a leading slash) is a deletion candidate.
pub fn phase4_deletions(materialized_paths: &[String], remote_paths: &HashSet<String>) -> Vec<String> {
    materialized_paths
        .iter()
        .filter(|p| !remote_paths.contains(p.as_str()) && !remote_paths.contains(&normalize_leading_slash(p)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::state::{FilemetaEntry, LocalFileState};

    fn entry(id: &str, kind: &str, hash: Option<&str>) -> FilemetaEntry {
        FilemetaEntry {
            id: id.to_string(),
            kind: kind.to_string(),
            hash: hash.map(|h| h.to_string()),
        }
    }

    fn local(doc_id: &str, hash: Option<&str>) -> LocalFileState {
        LocalFileState {
            doc_id: doc_id.to_string(),
            hash: hash.map(|h| h.to_string()),
            kind: "document".to_string(),
            modified_unix: 0.0,
        }
    }

    #[test]
    fn create_from_empty() {
        let mut new_filemeta = Filemeta::new();
        new_filemeta.insert("/readme.md".to_string(), entry("D1", "document", Some("H1")));
        let ops = phase2_classify(&new_filemeta, &FolderLocalState::new());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Create);
        assert_eq!(ops[0].path, "/readme.md");
    }

    #[test]
    fn pure_rename_no_content_fetch_needed() {
        let mut new_filemeta = Filemeta::new();
        new_filemeta.insert("/b.md".to_string(), entry("D1", "document", Some("H1")));
        let mut local_state = FolderLocalState::new();
        local_state.insert("/a.md".to_string(), local("D1", Some("H1")));

        let ops = phase2_classify(&new_filemeta, &local_state);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Rename);
        assert_eq!(ops[0].from_path.as_deref(), Some("/a.md"));
        assert_eq!(ops[0].path, "/b.md");
    }

    #[test]
    fn rename_with_changed_hash_becomes_update_not_rename() {
        let mut new_filemeta = Filemeta::new();
        new_filemeta.insert("/b.md".to_string(), entry("D1", "document", Some("H2")));
        let mut local_state = FolderLocalState::new();
        local_state.insert("/a.md".to_string(), local("D1", Some("H1")));

        let ops = phase2_classify(&new_filemeta, &local_state);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Update);
        assert_eq!(ops[0].from_path.as_deref(), Some("/a.md"));
        assert_eq!(ops[0].path, "/b.md");
    }

    #[test]
    fn update_wins_over_rename_on_same_path_same_id() {
        let mut new_filemeta = Filemeta::new();
        new_filemeta.insert("/a.md".to_string(), entry("D1", "document", Some("H2")));
        let mut local_state = FolderLocalState::new();
        local_state.insert("/a.md".to_string(), local("D1", Some("H1")));

        let ops = phase2_classify(&new_filemeta, &local_state);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Update);
    }

    #[test]
    fn noop_when_hash_matches() {
        let mut new_filemeta = Filemeta::new();
        new_filemeta.insert("/a.md".to_string(), entry("D1", "document", Some("H1")));
        let mut local_state = FolderLocalState::new();
        local_state.insert("/a.md".to_string(), local("D1", Some("H1")));

        let ops = phase2_classify(&new_filemeta, &local_state);
        assert_eq!(ops[0].kind, OperationKind::Noop);
    }

    #[test]
    fn deletions_match_with_or_without_leading_slash() {
        let mut remote = HashSet::new();
        remote.insert("/keep.md".to_string());
        remote.insert("keep.md".to_string());
        let materialized = vec!["/keep.md".to_string(), "/gone.md".to_string()];
        let deletions = phase4_deletions(&materialized, &remote);
        assert_eq!(deletions, vec!["/gone.md".to_string()]);
    }
}
