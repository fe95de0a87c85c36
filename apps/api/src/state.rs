use std::sync::Arc;

use crate::config::Config;
use crate::queue::JobQueue;
use crate::records::ResumeStore;
use crate::storage::ArtifactStore;
use crate::worker::PoolHealth;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn ResumeStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub queue: Arc<dyn JobQueue>,
    /// Counters of the in-process worker pool, reported by `/health`.
    pub workers: Arc<PoolHealth>,
    pub config: Config,
}
