//! The committer (§4.5): a ticking background task, independent of the sync
//! worker, that stages/commits/pushes every known repo on an interval when
//! anything has changed since the last tick.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::persistence::PersistenceManager;
use crate::queue::SyncState;

pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(10);

pub struct Committer {
    persistence: Arc<PersistenceManager>,
    sync_state: Arc<SyncState>,
    interval: Duration,
}

impl Committer {
    pub fn new(persistence: Arc<PersistenceManager>, sync_state: Arc<SyncState>, interval: Duration) -> Self {
        Committer {
            persistence,
            sync_state,
            interval,
        }
    }

    /// Runs until `SyncState::should_stop` is set, checked between ticks so
    /// a commit in progress is allowed to finish.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if self.sync_state.should_stop() {
                break;
            }
            if !self.sync_state.take_has_changes() {
                continue;
            }
            let committed = self.persistence.commit_all();
            if committed {
                self.sync_state.record_commit(chrono::Utc::now());
                info!("committer flushed pending changes");
            }
        }
        info!("committer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stops_promptly_when_no_changes_are_pending() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceManager::new(dir.path().to_path_buf()));
        let sync_state = Arc::new(SyncState::new());
        sync_state.request_stop();

        let committer = Committer::new(persistence, sync_state, Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(1), committer.run())
            .await
            .expect("committer should stop within the timeout");
    }
}
