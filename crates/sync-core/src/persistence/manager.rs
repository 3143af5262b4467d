//! The persistence layer: the only component permitted to touch the
//! filesystem or Git. Owns per-relay state caches, per-folder working
//! directories and Git repos, and the resource index (rebuilt here, and
//! only here, after every save).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info, warn};

use crate::connector::Connector;
use crate::error::SyncError;
use crate::index::ResourceIndex;
use crate::persistence::git::{clean_stale_locks, GitRepo};
use crate::persistence::path::sanitize_path;
use crate::persistence::ssh::SshKeyGuard;
use crate::persistence::state::{LocalFileState, RelayState};
use crate::resource::{Resource, ResourceKind};

const DOCUMENT_HASHES_FILE: &str = "document_hashes.json";
const SHARED_FOLDERS_FILE: &str = "shared_folders.json";
const LOCAL_STATE_FILE: &str = "local_state.json";

pub struct PersistenceManager {
    data_dir: PathBuf,
    relay_states: Mutex<HashMap<String, RelayState>>,
    connectors: Mutex<HashMap<(String, String), Connector>>,
    repos: Mutex<HashMap<(String, String), GitRepo>>,
    git_lock: Mutex<()>,
    ssh: SshKeyGuard,
    pub index: ResourceIndex,
}

impl PersistenceManager {
    pub fn new(data_dir: PathBuf) -> Self {
        clean_stale_locks(&data_dir.join("repos"));
        PersistenceManager {
            data_dir,
            relay_states: Mutex::new(HashMap::new()),
            connectors: Mutex::new(HashMap::new()),
            repos: Mutex::new(HashMap::new()),
            git_lock: Mutex::new(()),
            ssh: SshKeyGuard::from_env(),
            index: ResourceIndex::new(),
        }
    }

    pub fn register_connector(&self, connector: Connector) {
        let key = (connector.relay_id.clone(), connector.shared_folder_id.clone());
        self.connectors.lock().expect("connectors lock poisoned").insert(key, connector);
    }

    fn connector(&self, relay_id: &str, folder_id: &str) -> Option<Connector> {
        self.connectors
            .lock()
            .expect("connectors lock poisoned")
            .get(&(relay_id.to_string(), folder_id.to_string()))
            .cloned()
    }

    fn state_dir(&self, relay_id: &str) -> PathBuf {
        self.data_dir.join("state").join(relay_id)
    }

    fn repo_dir(&self, relay_id: &str, folder_id: &str) -> PathBuf {
        self.data_dir.join("repos").join(relay_id).join(folder_id)
    }

    /// The materialized root for a folder, including any connector prefix.
    /// `Connector::validate` already rejects a `..`-bearing prefix at load
    /// time, so a sanitization failure here means a connector was
    /// registered without going through that validation — log loudly and
    /// fall back to the repo root rather than writing into nowhere.
    pub fn working_dir(&self, relay_id: &str, folder_id: &str) -> PathBuf {
        let base = self.repo_dir(relay_id, folder_id);
        match self.connector(relay_id, folder_id) {
            Some(c) if !c.prefix.is_empty() => match sanitize_path(&base, &c.prefix) {
                Ok(path) => path,
                Err(e) => {
                    error!(%relay_id, %folder_id, prefix = %c.prefix, "connector prefix failed sanitization, using repo root: {e}");
                    base
                }
            },
            _ => base,
        }
    }

    /// Load (or return the cached copy of) a relay's state. Corrupt or
    /// missing files are treated as empty state, never fatal.
    pub fn load(&self, relay_id: &str) -> RelayState {
        let mut cache = self.relay_states.lock().expect("relay state lock poisoned");
        if let Some(state) = cache.get(relay_id) {
            return state.clone();
        }

        let dir = self.state_dir(relay_id);
        let document_hashes = read_json_tolerant(&dir.join(DOCUMENT_HASHES_FILE));
        let shared_folders = read_json_tolerant(&dir.join(SHARED_FOLDERS_FILE));
        let local_state = read_json_tolerant(&dir.join(LOCAL_STATE_FILE));

        let state = RelayState {
            document_hashes: document_hashes.unwrap_or_default(),
            shared_folders: shared_folders.unwrap_or_default(),
            local_state: local_state.unwrap_or_default(),
        };
        self.index.rebuild(relay_id, &state);
        cache.insert(relay_id.to_string(), state.clone());
        state
    }

    /// Atomic JSON round-trip of the three state files, followed by a
    /// full index rebuild — the only place the index is ever rebuilt.
    pub fn save(&self, relay_id: &str) -> Result<(), SyncError> {
        let state = {
            let cache = self.relay_states.lock().expect("relay state lock poisoned");
            cache.get(relay_id).cloned().unwrap_or_default()
        };

        let dir = self.state_dir(relay_id);
        std::fs::create_dir_all(&dir)?;
        atomic_write_json(&dir.join(DOCUMENT_HASHES_FILE), &state.document_hashes)?;
        atomic_write_json(&dir.join(SHARED_FOLDERS_FILE), &state.shared_folders)?;
        atomic_write_json(&dir.join(LOCAL_STATE_FILE), &state.local_state)?;

        self.index.rebuild(relay_id, &state);
        Ok(())
    }

    fn with_state_mut<R>(&self, relay_id: &str, f: impl FnOnce(&mut RelayState) -> R) -> R {
        let mut cache = self.relay_states.lock().expect("relay state lock poisoned");
        let state = cache.entry(relay_id.to_string()).or_default();
        f(state)
    }

    pub fn set_folder_filemeta(
        &self,
        relay_id: &str,
        folder_id: &str,
        filemeta: crate::persistence::state::Filemeta,
    ) {
        self.with_state_mut(relay_id, |state| {
            state.shared_folders.insert(folder_id.to_string(), filemeta);
        });
    }

    pub fn folder_filemeta(&self, relay_id: &str, folder_id: &str) -> crate::persistence::state::Filemeta {
        self.with_state_mut(relay_id, |state| state.folder_filemeta(folder_id))
    }

    pub fn folder_local_state(
        &self,
        relay_id: &str,
        folder_id: &str,
    ) -> crate::persistence::state::FolderLocalState {
        self.with_state_mut(relay_id, |state| state.folder_local_state(folder_id))
    }

    pub fn document_hash(&self, relay_id: &str, resource_id: &str) -> Option<String> {
        self.with_state_mut(relay_id, |state| {
            state.document_hashes.get(resource_id).cloned()
        })
    }

    pub fn set_document_hash(&self, relay_id: &str, resource_id: &str, hash: String) {
        self.with_state_mut(relay_id, |state| {
            state.document_hashes.insert(resource_id.to_string(), hash);
        });
    }

    fn target_base(&self, relay_id: &str, folder_id: &str) -> PathBuf {
        self.working_dir(relay_id, folder_id)
    }

    fn classify_resource(&self, resource: &Resource) -> String {
        match resource.kind() {
            ResourceKind::Folder => "folder",
            ResourceKind::Document => "document",
            ResourceKind::Canvas => "canvas",
            ResourceKind::File => "file",
        }
        .to_string()
    }

    fn write_common(
        &self,
        resource: &Resource,
        rel_path: &str,
        hash: Option<String>,
        write: impl FnOnce(&std::path::Path) -> std::io::Result<()>,
    ) -> Result<(), SyncError> {
        let relay_id = resource.relay_id().to_string();
        let folder_id = resource.folder_id().to_string();
        let base = self.target_base(&relay_id, &folder_id);
        let target = sanitize_path(&base, rel_path)?;

        if target.is_dir() {
            return Err(SyncError::PathEscape {
                path: format!("refusing to overwrite directory at {}", target.display()),
            });
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write(&target)?;

        let modified = now_unix();
        let entry = LocalFileState {
            doc_id: resource.resource_id().to_string(),
            hash,
            kind: self.classify_resource(resource),
            modified_unix: modified,
        };
        self.with_state_mut(&relay_id, |state| {
            state
                .local_state
                .entry(folder_id.clone())
                .or_default()
                .insert(rel_path.to_string(), entry);
        });
        Ok(())
    }

    pub fn write_text(
        &self,
        resource: &Resource,
        rel_path: &str,
        content: &str,
        hash: Option<String>,
    ) -> Result<(), SyncError> {
        let owned = content.to_string();
        self.write_common(resource, rel_path, hash, move |target| {
            std::fs::write(target, owned)
        })
    }

    pub fn write_binary(
        &self,
        resource: &Resource,
        rel_path: &str,
        bytes: &[u8],
        hash: Option<String>,
    ) -> Result<(), SyncError> {
        let owned = bytes.to_vec();
        self.write_common(resource, rel_path, hash, move |target| {
            std::fs::write(target, owned)
        })
    }

    pub fn mkdir(&self, relay_id: &str, folder_id: &str, rel_path: &str) -> Result<(), SyncError> {
        let base = self.target_base(relay_id, folder_id);
        let target = sanitize_path(&base, rel_path)?;
        std::fs::create_dir_all(&target)?;
        Ok(())
    }

    /// Rename on disk, carrying the state entry at `from` forward to `to`.
    pub fn move_file(
        &self,
        relay_id: &str,
        folder_id: &str,
        from: &str,
        to: &str,
    ) -> Result<(), SyncError> {
        let base = self.target_base(relay_id, folder_id);
        let from_path = sanitize_path(&base, from)?;
        let to_path = sanitize_path(&base, to)?;

        if let Some(parent) = to_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&from_path, &to_path)?;

        self.with_state_mut(relay_id, |state| {
            let folder_state = state.local_state.entry(folder_id.to_string()).or_default();
            if let Some(mut entry) = folder_state.remove(from) {
                entry.modified_unix = now_unix();
                folder_state.insert(to.to_string(), entry);
            }
        });
        Ok(())
    }

    pub fn delete_file(&self, relay_id: &str, folder_id: &str, rel_path: &str) -> Result<(), SyncError> {
        let base = self.target_base(relay_id, folder_id);
        let target = sanitize_path(&base, rel_path)?;
        if target.exists() {
            std::fs::remove_file(&target)?;
        }
        self.with_state_mut(relay_id, |state| {
            if let Some(folder_state) = state.local_state.get_mut(folder_id) {
                folder_state.remove(rel_path);
            }
        });
        Ok(())
    }

    /// Lists every materialized file under a folder's working directory,
    /// skipping `.git` and the `.gitignore` placeholder `init` writes into
    /// an empty repo (never part of remote filemeta, so it must never be
    /// treated as an orphan), as relative POSIX paths with a leading `/`.
    pub fn list_materialized_paths(&self, relay_id: &str, folder_id: &str) -> Vec<String> {
        let base = self.target_base(relay_id, folder_id);
        if !base.exists() {
            return Vec::new();
        }
        walkdir::WalkDir::new(&base)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.file_name() != ".gitignore")
            .filter_map(|e| {
                let rel = e.path().strip_prefix(&base).ok()?;
                let rel_str = rel.to_str()?.replace('\\', "/");
                Some(format!("/{rel_str}"))
            })
            .collect()
    }

    fn repo_for(&self, relay_id: &str, folder_id: &str) -> PathBuf {
        self.repo_dir(relay_id, folder_id)
    }

    pub fn init_repo(&self, relay_id: &str, folder_id: &str) -> Result<(), SyncError> {
        let dir = self.repo_for(relay_id, folder_id);
        let repo = GitRepo::new(dir);
        repo.init()?;
        self.repos
            .lock()
            .expect("repos lock poisoned")
            .insert((relay_id.to_string(), folder_id.to_string()), repo);
        Ok(())
    }

    pub fn configure_remote(
        &self,
        relay_id: &str,
        folder_id: &str,
        url: &str,
        remote_name: &str,
    ) -> Result<(), SyncError> {
        self.ensure_repo(relay_id, folder_id)?;
        let repos = self.repos.lock().expect("repos lock poisoned");
        let repo = repos
            .get(&(relay_id.to_string(), folder_id.to_string()))
            .expect("repo just ensured");
        repo.configure_remote(remote_name, url)
    }

    fn ensure_repo(&self, relay_id: &str, folder_id: &str) -> Result<(), SyncError> {
        let key = (relay_id.to_string(), folder_id.to_string());
        if self.repos.lock().expect("repos lock poisoned").contains_key(&key) {
            return Ok(());
        }
        self.init_repo(relay_id, folder_id)
    }

    /// For every known folder repo, if dirty or has untracked files: stage,
    /// commit with an `Auto-sync: ...` message, and push. Returns whether
    /// any repo actually produced a commit. Held under the global git lock
    /// for the whole per-repo sequence (the lock never wraps filesystem
    /// writes — only git subprocess invocations).
    pub fn commit_all(&self) -> bool {
        let _guard = self.git_lock.lock().expect("git lock poisoned");
        let repos: Vec<((String, String), PathBuf)> = self
            .repos
            .lock()
            .expect("repos lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.dir.clone()))
            .collect();

        let mut any_committed = false;
        for ((relay_id, folder_id), dir) in repos {
            let repo = GitRepo::new(dir);
            match self.commit_and_push_one(&repo, &relay_id, &folder_id) {
                Ok(committed) => any_committed |= committed,
                Err(e) => warn!(%relay_id, %folder_id, "commit/push failed: {e}"),
            }
        }
        any_committed
    }

    fn commit_and_push_one(
        &self,
        repo: &GitRepo,
        relay_id: &str,
        folder_id: &str,
    ) -> Result<bool, SyncError> {
        let dirty = repo.is_dirty()?;
        let untracked = repo.has_untracked()?;
        if !dirty && !untracked {
            return Ok(false);
        }

        if let Err(e) = repo.wait_for_lock_clear() {
            clean_stale_locks(&self.data_dir.join("repos"));
            if repo.wait_for_lock_clear().is_err() {
                return Err(e);
            }
        }

        repo.stage_all()?;
        let message = format!(
            "Auto-sync: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        repo.commit(&message)?;
        info!(%relay_id, %folder_id, "committed changes: {message}");

        if let Some(connector) = self.connector(relay_id, folder_id) {
            if let Err(e) = repo.push(&connector.remote_name, &connector.branch, &self.ssh) {
                warn!(%relay_id, %folder_id, "push failed, will retry next tick: {e}");
            }
        } else {
            warn!(%relay_id, %folder_id, "no connector registered, skipping push");
        }
        Ok(true)
    }

    /// Logged-loudly bug path: a path supplied by our own stored state
    /// fails sanitization. This should never happen; if it does, the
    /// corresponding filemeta entry is almost certainly malformed upstream.
    pub fn report_own_state_path_escape(&self, context: &str, path: &str) {
        error!("own-state path escape in {context}: {path}");
    }
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn read_json_tolerant<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("state file {} is corrupt, treating as empty: {e}", path.display());
            None
        }
    }
}

fn atomic_write_json<T: serde::Serialize>(path: &std::path::Path, value: &T) -> Result<(), SyncError> {
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::state::FilemetaEntry;

    fn manager() -> (tempfile::TempDir, PersistenceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path().to_path_buf());
        (dir, manager)
    }

    #[test]
    fn write_text_then_move_round_trips() {
        let (_dir, manager) = manager();
        manager.init_repo("R1", "F1").unwrap();
        let resource = Resource::Document {
            relay_id: "R1".into(),
            folder_id: "F1".into(),
            document_id: "D1".into(),
        };
        manager
            .write_text(&resource, "/a.md", "hello", Some("h1".into()))
            .unwrap();
        manager.move_file("R1", "F1", "/a.md", "/b.md").unwrap();
        manager.move_file("R1", "F1", "/b.md", "/a.md").unwrap();

        let base = manager.working_dir("R1", "F1");
        assert_eq!(std::fs::read_to_string(base.join("a.md")).unwrap(), "hello");
        let local = manager.folder_local_state("R1", "F1");
        assert_eq!(local.get("/a.md").unwrap().doc_id, "D1");
        assert!(!local.contains_key("/b.md"));
    }

    #[test]
    fn load_missing_state_is_empty_not_fatal() {
        let (_dir, manager) = manager();
        let state = manager.load("unknown-relay");
        assert!(state.document_hashes.is_empty());
        assert!(state.shared_folders.is_empty());
    }

    #[test]
    fn save_rebuilds_index() {
        let (_dir, manager) = manager();
        let mut filemeta = crate::persistence::state::Filemeta::new();
        filemeta.insert(
            "/a.md".to_string(),
            FilemetaEntry {
                id: "D1".to_string(),
                kind: "document".to_string(),
                hash: Some("h1".to_string()),
            },
        );
        manager.set_folder_filemeta("R1", "F1", filemeta);
        manager.save("R1").unwrap();
        let entry = manager.index.lookup("R1", "D1").expect("indexed");
        assert_eq!(entry.path, "/a.md");
    }

    #[test]
    fn write_refuses_path_escape() {
        let (_dir, manager) = manager();
        manager.init_repo("R1", "F1").unwrap();
        let resource = Resource::Document {
            relay_id: "R1".into(),
            folder_id: "F1".into(),
            document_id: "D1".into(),
        };
        let err = manager
            .write_text(&resource, "../../etc/passwd", "pwned", None)
            .unwrap_err();
        assert!(matches!(err, SyncError::PathEscape { .. }));
    }
}
