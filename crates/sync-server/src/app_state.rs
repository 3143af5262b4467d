use sync_core::IngestionQueue;

#[derive(Clone)]
pub struct AppState {
    pub queue: IngestionQueue,
}
