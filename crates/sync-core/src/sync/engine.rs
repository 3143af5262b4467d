//! The sync engine (§4.4): the async orchestration layer. Consumes the pure
//! planning functions in `reconcile` and performs the actual CDS fetches and
//! persistence writes they imply. Generic over `CdsClient` so the HTTP
//! implementation never has to be `dyn`-dispatched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cds_client::CdsClient;
use crate::hash::sha256_hex;
use crate::persistence::state::Filemeta;
use crate::persistence::PersistenceManager;
use crate::queue::{QueueItem, SyncState};
use crate::resource::{Resource, ResourceKind};
use crate::sync::reconcile::{self, OperationKind, OpStatus, SyncOperation};
use crate::{canvas, index::IndexEntry};

/// Orchestrates folder reconciliation and single-resource sync, holding the
/// per-folder keyed locks (§5) and the shared change-tracking flag consumed
/// by the committer.
pub struct SyncEngine<C: CdsClient> {
    persistence: Arc<PersistenceManager>,
    cds: C,
    sync_state: Arc<SyncState>,
    folder_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<C: CdsClient> SyncEngine<C> {
    pub fn new(persistence: Arc<PersistenceManager>, cds: C, sync_state: Arc<SyncState>) -> Self {
        SyncEngine {
            persistence,
            cds,
            sync_state,
            folder_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_folder(&self, folder_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.folder_locks.lock().expect("folder locks poisoned");
            locks
                .entry(folder_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// §4.4.1: a webhook-derived change notification. `resource_id` is
    /// either the id of a known shared folder (a folder's own filemeta
    /// changed) or the id of some resource living inside one.
    pub async fn process_change_notification(
        &self,
        relay_id: &str,
        resource_id: &str,
        _timestamp: DateTime<Utc>,
    ) {
        let state = self.persistence.load(relay_id);

        if state.shared_folders.contains_key(resource_id) {
            self.sync_folder(relay_id, resource_id).await;
        } else {
            match self.persistence.index.lookup(relay_id, resource_id) {
                None => {
                    warn!(%relay_id, %resource_id, "change notification for unknown resource, awaiting folder snapshot");
                }
                Some(entry) => self.sync_indexed_resource(relay_id, resource_id, &entry).await,
            }
        }

        if let Err(e) = self.persistence.save(relay_id) {
            error!(%relay_id, "failed to save relay state: {e}");
        }
    }

    /// §4.4.2: an explicit sync request naming a resource directly. Folders
    /// go through full reconciliation; documents and canvases resolve to a
    /// single compare-and-update; files aren't independently syncable.
    pub async fn process_sync_request(&self, resource: Resource, _timestamp: DateTime<Utc>) {
        let relay_id = resource.relay_id().to_string();
        self.persistence.load(&relay_id);

        match resource.kind() {
            ResourceKind::Folder => {
                self.sync_folder(&relay_id, resource.resource_id()).await;
            }
            ResourceKind::Document | ResourceKind::Canvas => {
                match self.persistence.index.lookup(&relay_id, resource.resource_id()) {
                    None => {
                        warn!(resource = ?resource, "sync request for resource with no known path yet");
                    }
                    Some(entry) => {
                        self.sync_single_document_or_canvas(&relay_id, &resource, &entry.path).await;
                    }
                }
            }
            ResourceKind::File => {
                warn!(resource = ?resource, "files aren't independently syncable, driven by folder filemeta");
            }
        }

        if let Err(e) = self.persistence.save(&relay_id) {
            error!(%relay_id, "failed to save relay state: {e}");
        }
    }

    /// Pulls a folder's filemeta, swaps it into state, and runs full
    /// four-phase reconciliation against it, under that folder's lock.
    async fn sync_folder(&self, relay_id: &str, folder_id: &str) {
        let doc = match self.cds.get_folder_doc(&Resource::Folder {
            relay_id: relay_id.to_string(),
            folder_id: folder_id.to_string(),
        }).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                warn!(%relay_id, %folder_id, "folder doc missing (possibly deleted)");
                return;
            }
            Err(e) => {
                warn!(%relay_id, %folder_id, "transport error fetching folder doc: {e}");
                return;
            }
        };

        if let Err(e) = self.persistence.init_repo(relay_id, folder_id) {
            error!(%relay_id, %folder_id, "failed to init repo: {e}");
            return;
        }

        // Populate the in-memory cache from disk before mutating it — the
        // cache is per-relay, and another folder under this relay may never
        // have been touched yet this process.
        self.persistence.load(relay_id);

        self.persistence.set_folder_filemeta(relay_id, folder_id, doc.filemeta.clone());
        let refreshed = self.persistence.load(relay_id);
        self.persistence.index.rebuild(relay_id, &refreshed);

        let ops = self.reconcile_folder(relay_id, folder_id, doc.filemeta).await;
        let errored = ops.iter().filter(|op| matches!(op.status, OpStatus::Errored(_))).count();
        if errored > 0 {
            warn!(%relay_id, %folder_id, "{errored} of {} operations errored during reconciliation", ops.len());
        }
    }

    /// The four-phase reconciliation itself (§4.4.3): create folders, plan
    /// create/update/rename/noop for every file entry, execute the plan,
    /// then delete anything materialized that's no longer in the remote set.
    async fn reconcile_folder(
        &self,
        relay_id: &str,
        folder_id: &str,
        new_filemeta: Filemeta,
    ) -> Vec<SyncOperation> {
        let _guard = self.lock_folder(folder_id).await;

        for (path, _id) in reconcile::phase1_folders(&new_filemeta) {
            if let Err(e) = self.persistence.mkdir(relay_id, folder_id, &path) {
                error!(%relay_id, %folder_id, %path, "phase1 mkdir failed: {e}");
            }
        }

        let local_state = self.persistence.folder_local_state(relay_id, folder_id);
        let mut ops = reconcile::phase2_classify(&new_filemeta, &local_state);

        for op in ops.iter_mut() {
            if op.kind == OperationKind::Noop {
                op.status = OpStatus::Completed;
                continue;
            }
            op.status = self.execute_operation(relay_id, folder_id, op).await;
            if matches!(op.status, OpStatus::Completed) {
                self.sync_state.mark_changed();
            }
        }

        let remote_paths = reconcile::remote_path_set(&new_filemeta);
        let materialized = self.persistence.list_materialized_paths(relay_id, folder_id);
        for path in reconcile::phase4_deletions(&materialized, &remote_paths) {
            let status = match self.persistence.delete_file(relay_id, folder_id, &path) {
                Ok(()) => {
                    self.sync_state.mark_changed();
                    OpStatus::Completed
                }
                Err(e) => {
                    self.report_if_own_state(&e, "phase4 deletion path", &path);
                    OpStatus::Errored(e.to_string())
                }
            };
            ops.push(SyncOperation {
                kind: OperationKind::Delete,
                path,
                from_path: None,
                resource_id: String::new(),
                resource_kind: ResourceKind::Document,
                hash: None,
                status,
            });
        }

        ops
    }

    /// Paths drawn from our own previously-stored state (a rename source, a
    /// materialized path we enumerated, a delete target) should never fail
    /// sanitization — if one does, it's logged loudly as a bug rather than
    /// treated as a routine per-operation failure.
    fn report_if_own_state(&self, error: &crate::error::SyncError, context: &str, path: &str) {
        if matches!(error, crate::error::SyncError::PathEscape { .. }) {
            self.persistence.report_own_state_path_escape(context, path);
        }
    }

    async fn execute_operation(&self, relay_id: &str, folder_id: &str, op: &SyncOperation) -> OpStatus {
        match op.kind {
            OperationKind::Noop => OpStatus::Completed,
            OperationKind::Create | OperationKind::Update => {
                self.execute_create_or_update(relay_id, folder_id, op).await
            }
            OperationKind::Rename => {
                let from = match &op.from_path {
                    Some(p) => p,
                    None => return OpStatus::Errored("rename operation missing from_path".into()),
                };
                match self.persistence.move_file(relay_id, folder_id, from, &op.path) {
                    Ok(()) => OpStatus::Completed,
                    Err(e) => {
                        self.report_if_own_state(&e, "rename source path", from);
                        OpStatus::Errored(e.to_string())
                    }
                }
            }
            OperationKind::Delete => match self.persistence.delete_file(relay_id, folder_id, &op.path) {
                Ok(()) => OpStatus::Completed,
                Err(e) => {
                    self.report_if_own_state(&e, "delete path", &op.path);
                    OpStatus::Errored(e.to_string())
                }
            },
        }
    }

    async fn execute_create_or_update(&self, relay_id: &str, folder_id: &str, op: &SyncOperation) -> OpStatus {
        let resource = build_resource(relay_id, folder_id, &op.resource_id, op.resource_kind);

        match op.resource_kind {
            ResourceKind::Document => match self.cds.get_document_text(&resource).await {
                Ok(Some(text)) => {
                    let hash = op.hash.clone();
                    match self.persistence.write_text(&resource, &op.path, &text, hash.clone()) {
                        Ok(()) => {
                            if let Some(hash) = hash {
                                self.persistence.set_document_hash(relay_id, &op.resource_id, hash);
                            }
                            OpStatus::Completed
                        }
                        Err(e) => OpStatus::Errored(e.to_string()),
                    }
                }
                Ok(None) => OpStatus::Skipped("document content missing, possibly deleted".into()),
                Err(e) => OpStatus::Errored(e.to_string()),
            },
            ResourceKind::Canvas => match self.cds.get_canvas(&resource).await {
                Ok(Some(doc)) => {
                    let serialized = canvas::serialize_canvas(&doc);
                    let hash = op.hash.clone();
                    match self.persistence.write_text(&resource, &op.path, &serialized, hash.clone()) {
                        Ok(()) => {
                            if let Some(hash) = hash {
                                self.persistence.set_document_hash(relay_id, &op.resource_id, hash);
                            }
                            OpStatus::Completed
                        }
                        Err(e) => OpStatus::Errored(e.to_string()),
                    }
                }
                Ok(None) => OpStatus::Skipped("canvas content missing, possibly deleted".into()),
                Err(e) => OpStatus::Errored(e.to_string()),
            },
            ResourceKind::File => {
                let Some(hash) = op.hash.clone() else {
                    return OpStatus::Errored("file entry is missing required hash metadata".into());
                };
                match self.cds.get_file_download_url(&resource, &hash).await {
                    Ok(Some(url)) => match self.cds.download_bytes(&url).await {
                        Ok(bytes) => match self.persistence.write_binary(&resource, &op.path, &bytes, Some(hash)) {
                            Ok(()) => OpStatus::Completed,
                            Err(e) => OpStatus::Errored(e.to_string()),
                        },
                        Err(e) => OpStatus::Errored(e.to_string()),
                    },
                    Ok(None) => OpStatus::Skipped("file content missing, possibly deleted".into()),
                    Err(e) => OpStatus::Errored(e.to_string()),
                }
            }
            ResourceKind::Folder => OpStatus::Errored("folder entries aren't fetched through this path".into()),
        }
    }

    /// Fetches and, if the hash changed, writes a single document or canvas
    /// at its already-known path. Used by both the single-resource branch of
    /// a change notification and a direct sync request.
    async fn sync_single_document_or_canvas(&self, relay_id: &str, resource: &Resource, known_path: &str) {
        let resource_id = resource.resource_id().to_string();
        match resource.kind() {
            ResourceKind::Document => match self.cds.get_document_text(resource).await {
                Ok(Some(text)) => {
                    let hash = sha256_hex(text.as_bytes());
                    if self.persistence.document_hash(relay_id, &resource_id).as_deref() != Some(hash.as_str()) {
                        match self.persistence.write_text(resource, known_path, &text, Some(hash.clone())) {
                            Ok(()) => {
                                self.persistence.set_document_hash(relay_id, &resource_id, hash);
                                self.sync_state.mark_changed();
                            }
                            Err(e) => error!(%relay_id, %resource_id, "failed writing document update: {e}"),
                        }
                    }
                }
                Ok(None) => warn!(%relay_id, %resource_id, "document content missing, possibly deleted"),
                Err(e) => warn!(%relay_id, %resource_id, "transport error fetching document: {e}"),
            },
            ResourceKind::Canvas => match self.cds.get_canvas(resource).await {
                Ok(Some(doc)) => {
                    let serialized = canvas::serialize_canvas(&doc);
                    let hash = sha256_hex(serialized.as_bytes());
                    if self.persistence.document_hash(relay_id, &resource_id).as_deref() != Some(hash.as_str()) {
                        match self.persistence.write_text(resource, known_path, &serialized, Some(hash.clone())) {
                            Ok(()) => {
                                self.persistence.set_document_hash(relay_id, &resource_id, hash);
                                self.sync_state.mark_changed();
                            }
                            Err(e) => error!(%relay_id, %resource_id, "failed writing canvas update: {e}"),
                        }
                    }
                }
                Ok(None) => warn!(%relay_id, %resource_id, "canvas content missing, possibly deleted"),
                Err(e) => warn!(%relay_id, %resource_id, "transport error fetching canvas: {e}"),
            },
            _ => {}
        }
    }

    async fn sync_indexed_resource(&self, relay_id: &str, resource_id: &str, entry: &IndexEntry) {
        match entry.kind {
            ResourceKind::Document | ResourceKind::Canvas => {
                let resource = build_resource(relay_id, &entry.folder_id, resource_id, entry.kind);
                self.sync_single_document_or_canvas(relay_id, &resource, &entry.path).await;
            }
            ResourceKind::File => {
                // File content is never independently fetched; it's driven
                // by the owning folder's filemeta hash during reconciliation.
            }
            ResourceKind::Folder => {
                self.sync_folder(relay_id, resource_id).await;
            }
        }
    }

    /// The queue-consuming loop (§4.3): drains items until told to stop,
    /// isolating a panicking item's failure behind a spawned task so it
    /// can't take the whole worker down.
    pub async fn run_worker(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<QueueItem>) {
        loop {
            if self.sync_state.should_stop() {
                break;
            }
            match tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await {
                Ok(Some(item)) => {
                    let engine = Arc::clone(&self);
                    let handle = tokio::spawn(async move { engine.dispatch(item).await });
                    if let Err(e) = handle.await {
                        error!("queue worker item panicked: {e}");
                    }
                }
                Ok(None) => break,
                Err(_timeout) => continue,
            }
        }
        info!("sync worker stopped");
    }

    async fn dispatch(&self, item: QueueItem) {
        match item {
            QueueItem::SyncRequest { resource, timestamp } => {
                self.process_sync_request(resource, timestamp).await;
            }
            QueueItem::ChangeNotification {
                relay_id,
                resource_id,
                timestamp,
            } => {
                self.process_change_notification(&relay_id, &resource_id, timestamp).await;
            }
        }
    }
}

fn build_resource(relay_id: &str, folder_id: &str, resource_id: &str, kind: ResourceKind) -> Resource {
    match kind {
        ResourceKind::Folder => Resource::Folder {
            relay_id: relay_id.to_string(),
            folder_id: resource_id.to_string(),
        },
        ResourceKind::Document => Resource::Document {
            relay_id: relay_id.to_string(),
            folder_id: folder_id.to_string(),
            document_id: resource_id.to_string(),
        },
        ResourceKind::Canvas => Resource::Canvas {
            relay_id: relay_id.to_string(),
            folder_id: folder_id.to_string(),
            canvas_id: resource_id.to_string(),
        },
        ResourceKind::File => Resource::File {
            relay_id: relay_id.to_string(),
            folder_id: folder_id.to_string(),
            file_id: resource_id.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cds_client::CdsError;
    use crate::persistence::state::{Filemeta, FilemetaEntry};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeCds {
        documents: StdMutex<HashMap<String, String>>,
    }

    impl CdsClient for FakeCds {
        async fn get_folder_doc(&self, resource: &Resource) -> Result<Option<crate::cds_client::FolderDoc>, CdsError> {
            let _ = resource;
            let mut filemeta = Filemeta::new();
            filemeta.insert(
                "/a.md".to_string(),
                FilemetaEntry {
                    id: "D1".to_string(),
                    kind: "document".to_string(),
                    hash: Some("remote-hash-1".to_string()),
                },
            );
            Ok(Some(crate::cds_client::FolderDoc { filemeta }))
        }

        async fn get_document_text(&self, resource: &Resource) -> Result<Option<String>, CdsError> {
            Ok(self.documents.lock().unwrap().get(resource.resource_id()).cloned())
        }

        async fn get_canvas(&self, _resource: &Resource) -> Result<Option<crate::cds_client::CanvasDoc>, CdsError> {
            Ok(None)
        }

        async fn get_file_download_url(&self, _resource: &Resource, _hash: &str) -> Result<Option<String>, CdsError> {
            Ok(None)
        }

        async fn download_bytes(&self, _url: &str) -> Result<Vec<u8>, CdsError> {
            Ok(Vec::new())
        }
    }

    fn engine() -> (tempfile::TempDir, SyncEngine<FakeCds>) {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceManager::new(dir.path().to_path_buf()));
        let mut cds = FakeCds::default();
        cds.documents.lock().unwrap().insert("D1".to_string(), "hello world".to_string());
        let sync_state = Arc::new(SyncState::new());
        (dir, SyncEngine::new(persistence, cds, sync_state))
    }

    #[tokio::test]
    async fn sync_folder_creates_document_from_empty_state() {
        let (_dir, engine) = engine();
        engine.sync_folder("R1", "F1").await;

        let path = engine.persistence.working_dir("R1", "F1").join("a.md");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello world");
        assert!(engine.sync_state.take_has_changes());
        // The stored hash must be the one the remote filemeta asserted, not
        // a value recomputed from the fetched bytes.
        assert_eq!(
            engine.persistence.document_hash("R1", "D1").as_deref(),
            Some("remote-hash-1")
        );
    }

    #[tokio::test]
    async fn process_change_notification_for_known_folder_triggers_reconciliation() {
        let (_dir, engine) = engine();
        let mut filemeta = Filemeta::new();
        filemeta.insert(
            "/a.md".to_string(),
            FilemetaEntry {
                id: "D1".to_string(),
                kind: "document".to_string(),
                hash: None,
            },
        );
        engine.persistence.set_folder_filemeta("R1", "F1", filemeta);
        engine.persistence.save("R1").unwrap();

        engine.process_change_notification("R1", "F1", Utc::now()).await;

        let path = engine.persistence.working_dir("R1", "F1").join("a.md");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn unknown_resource_id_is_a_noop() {
        let (_dir, engine) = engine();
        engine.process_change_notification("R1", "unknown-doc", Utc::now()).await;
        assert!(!engine.sync_state.take_has_changes());
    }
}
