//! Customization State Machine.
//!
//! Drives one resume through `pending → processing → {completed, failed}`:
//!
//! 1. load the record; terminal records short-circuit (redelivery is a no-op)
//! 2. take the per-resume lock, enter `processing`, bump `attempt_count`
//! 3. fetch + extract the original (failure is terminal)
//! 4. customize, bounded by the configured timeout
//! 5. transient failures are released for redelivery while budget remains
//! 6. render, retried once within the attempt
//! 7. upload the rendered artifact
//! 8. `completed` with the artifact ref, `completed_at` and progress 100
//!
//! Nothing in here talks to the queue. Every outcome is returned as a
//! [`Disposition`] and the worker turns it into an ack or a nack.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::customize::Customizer;
use crate::extract::{TextExtractor, MIME_PDF};
use crate::models::resume::{ResumeRecord, ResumeUpdate};
use crate::queue::{CustomizationJob, LockToken, QueueError, ResumeLocks};
use crate::records::{ResumeStore, StoreError};
use crate::render::Renderer;
use crate::storage::{customized_key, ArtifactStore};

pub mod backoff;
pub mod error;

pub use backoff::Backoff;
pub use error::{ErrorKind, JobError};

const PROGRESS_FETCHED: u8 = 10;
const PROGRESS_EXTRACTED: u8 = 30;
const PROGRESS_CUSTOMIZED: u8 = 70;
const PROGRESS_RENDERED: u8 = 90;

// ────────────────────────────────────────────────────────────────────────────
// Settings & outcomes
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub customization_timeout: Duration,
    pub max_retries: u32,
    /// Extra render attempts within one job attempt.
    pub render_retries: u32,
    pub backoff: Backoff,
    /// How long a resume lock lives without a heartbeat.
    pub lock_ttl: Duration,
    /// Redelivery delay for a job whose resume is locked by another worker.
    pub busy_requeue_delay: Duration,
}

impl PipelineSettings {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// The result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Failed,
    /// Record already terminal; nothing was touched.
    AlreadyTerminal,
    /// Record deleted since the job was enqueued.
    Missing,
    /// Transient failure with budget left; redeliver after the delay.
    RetryLater(Duration),
    /// Another worker holds the resume lock; redeliver unprocessed.
    Busy(Duration),
    /// Record store or queue unreachable; redeliver without a transition.
    Infrastructure(Duration),
    /// Cancelled by shutdown mid-attempt.
    Interrupted,
}

/// Queue operation a disposition maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack(Duration),
}

impl Disposition {
    pub fn settlement(&self) -> Settlement {
        match self {
            Disposition::Completed
            | Disposition::Failed
            | Disposition::AlreadyTerminal
            | Disposition::Missing => Settlement::Ack,
            Disposition::RetryLater(delay)
            | Disposition::Busy(delay)
            | Disposition::Infrastructure(delay) => Settlement::Nack(*delay),
            Disposition::Interrupted => Settlement::Nack(Duration::ZERO),
        }
    }
}

/// Result of steps 1–2: either a locked record ready to run, or a
/// disposition reached without holding the lock.
#[derive(Debug)]
pub enum Claim {
    Ready {
        record: ResumeRecord,
        lock: LockToken,
    },
    Skip(Disposition),
}

// ────────────────────────────────────────────────────────────────────────────
// Pipeline
// ────────────────────────────────────────────────────────────────────────────

/// Every collaborator the pipeline drives, injected at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn ResumeStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub customizer: Arc<dyn Customizer>,
    pub renderer: Arc<dyn Renderer>,
    pub locks: Arc<dyn ResumeLocks>,
}

pub struct Pipeline {
    deps: Collaborators,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(deps: Collaborators, settings: PipelineSettings) -> Self {
        Self { deps, settings }
    }

    fn infrastructure_delay(&self) -> Duration {
        self.settings.backoff.delay(1)
    }

    /// Steps 1–2 up to the lock: terminal short-circuit and mutual exclusion.
    pub async fn claim(&self, job: &CustomizationJob) -> Claim {
        let id = job.resume_id;

        match self.deps.records.load(id).await {
            Ok(record) if record.status.is_terminal() => {
                debug!(resume_id = %id, status = record.status.as_str(), "Record already terminal");
                return Claim::Skip(Disposition::AlreadyTerminal);
            }
            Ok(_) => {}
            Err(e) => return Claim::Skip(self.load_failed(id, e)),
        }

        let lock = match self.deps.locks.try_acquire(id, self.settings.lock_ttl).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!(resume_id = %id, job_id = %job.job_id, "Resume locked by another worker; releasing job");
                return Claim::Skip(Disposition::Busy(self.settings.busy_requeue_delay));
            }
            Err(e) => {
                error!(resume_id = %id, "Lock service unavailable: {e}");
                return Claim::Skip(Disposition::Infrastructure(self.infrastructure_delay()));
            }
        };

        // Re-read under the lock: another worker may have finished in between.
        match self.deps.records.load(id).await {
            Ok(record) if record.status.is_terminal() => {
                self.release(&lock).await;
                Claim::Skip(Disposition::AlreadyTerminal)
            }
            Ok(record) => Claim::Ready { record, lock },
            Err(e) => {
                self.release(&lock).await;
                Claim::Skip(self.load_failed(id, e))
            }
        }
    }

    fn load_failed(&self, id: Uuid, e: StoreError) -> Disposition {
        match e {
            StoreError::NotFound(_) => {
                warn!(resume_id = %id, "Job references a deleted resume; dropping");
                Disposition::Missing
            }
            e => {
                error!(resume_id = %id, "Record store unavailable: {e}");
                Disposition::Infrastructure(self.infrastructure_delay())
            }
        }
    }

    /// `Ok(false)` means the lock expired and may already belong to another
    /// worker.
    pub async fn extend_lock(&self, lock: &LockToken) -> Result<bool, QueueError> {
        self.deps.locks.extend(lock, self.settings.lock_ttl).await
    }

    pub async fn release(&self, lock: &LockToken) {
        match self.deps.locks.release(lock).await {
            Ok(true) => {}
            Ok(false) => warn!(resume_id = %lock.resume_id, "Resume lock expired before release"),
            Err(e) => warn!(resume_id = %lock.resume_id, "Failed to release resume lock: {e}"),
        }
    }

    /// Steps 2–8 for a claimed record. The caller holds the lock.
    pub async fn run_attempt(&self, record: ResumeRecord) -> Disposition {
        let id = record.id;
        let max_attempts = self.settings.max_attempts();

        // Redelivered after a crash with the budget already spent.
        if record.attempt_count >= max_attempts {
            warn!(resume_id = %id, attempts = record.attempt_count, "Attempt budget exhausted before start");
            let last = record
                .error
                .unwrap_or_else(|| "Processing did not finish.".to_string());
            return self
                .fail(id, format!("{last} (gave up after {} attempts)", record.attempt_count))
                .await;
        }

        let attempt = record.attempt_count + 1;
        if let Err(e) = self
            .deps
            .records
            .update(id, ResumeUpdate::start_attempt(attempt))
            .await
        {
            return self.on_failure(id, attempt, e.into()).await;
        }
        info!(resume_id = %id, attempt, max_attempts, "Customization attempt started");

        match self.execute(&record).await {
            Ok(artifact_ref) => {
                match self
                    .deps
                    .records
                    .update(id, ResumeUpdate::completed(artifact_ref, Utc::now()))
                    .await
                {
                    Ok(()) => {
                        info!(resume_id = %id, attempt, "Customization completed");
                        Disposition::Completed
                    }
                    Err(e) => self.on_failure(id, attempt, e.into()).await,
                }
            }
            Err(e) => self.on_failure(id, attempt, e).await,
        }
    }

    async fn execute(&self, record: &ResumeRecord) -> Result<String, JobError> {
        let id = record.id;

        let original = self.deps.artifacts.get(&record.original_artifact_ref).await?;
        self.checkpoint(id, PROGRESS_FETCHED).await?;

        // Parsing is CPU-bound; keep it off the async workers.
        let extractor = Arc::clone(&self.deps.extractor);
        let mime = record.mime_type.clone();
        let text = tokio::task::spawn_blocking(move || extractor.extract(&original, &mime))
            .await
            .map_err(|e| {
                JobError::new(
                    ErrorKind::Resource,
                    "We couldn't read your resume file.",
                    format!("extraction task failed: {e}"),
                )
            })??;
        debug!(resume_id = %id, chars = text.len(), "Extracted resume text");
        self.checkpoint(id, PROGRESS_EXTRACTED).await?;

        let customized = self
            .deps
            .customizer
            .customize(&text, &record.job_context, self.settings.customization_timeout)
            .await?;
        self.checkpoint(id, PROGRESS_CUSTOMIZED).await?;

        let pdf = self.render_with_retry(id, &customized).await?;
        self.checkpoint(id, PROGRESS_RENDERED).await?;

        let key = customized_key(id);
        let url = self.deps.artifacts.upload(pdf, &key, MIME_PDF).await?;
        debug!(resume_id = %id, %url, "Customized artifact stored");

        Ok(key)
    }

    async fn render_with_retry(
        &self,
        id: Uuid,
        text: &str,
    ) -> Result<Bytes, JobError> {
        let tries = self.settings.render_retries + 1;
        let mut try_no = 1;
        loop {
            match self.deps.renderer.render(text).await {
                Ok(pdf) => return Ok(pdf),
                Err(e) if try_no < tries => {
                    warn!(resume_id = %id, try_no, "Render failed, retrying: {e}");
                    try_no += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn checkpoint(&self, id: Uuid, progress: u8) -> Result<(), JobError> {
        self.deps
            .records
            .update(id, ResumeUpdate::progress(progress))
            .await?;
        Ok(())
    }

    async fn on_failure(&self, id: Uuid, attempt: u32, err: JobError) -> Disposition {
        let max_attempts = self.settings.max_attempts();
        match err.kind {
            ErrorKind::Fatal => {
                error!(resume_id = %id, attempt, "Infrastructure failure: {}", err.detail);
                Disposition::Infrastructure(self.infrastructure_delay())
            }
            ErrorKind::Superseded => {
                warn!(resume_id = %id, attempt, "Record settled by another attempt; abandoning");
                Disposition::AlreadyTerminal
            }
            ErrorKind::Transient if attempt < max_attempts => {
                let delay = self.settings.backoff.delay(attempt);
                warn!(
                    resume_id = %id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, will retry: {}",
                    err.detail
                );
                match self
                    .deps
                    .records
                    .update(id, ResumeUpdate::retry_scheduled(err.message))
                    .await
                {
                    Ok(()) => Disposition::RetryLater(delay),
                    Err(e) => self.write_failed(id, e),
                }
            }
            ErrorKind::Transient => {
                warn!(resume_id = %id, attempt, "Retries exhausted: {}", err.detail);
                self.fail(
                    id,
                    format!("{} (gave up after {attempt} attempts)", err.message),
                )
                .await
            }
            ErrorKind::Input | ErrorKind::Resource => {
                warn!(resume_id = %id, attempt, kind = ?err.kind, "Non-retryable failure: {}", err.detail);
                self.fail(id, err.message).await
            }
        }
    }

    async fn fail(&self, id: Uuid, message: String) -> Disposition {
        match self
            .deps
            .records
            .update(id, ResumeUpdate::failed(message))
            .await
        {
            Ok(()) => Disposition::Failed,
            Err(e) => self.write_failed(id, e),
        }
    }

    fn write_failed(&self, id: Uuid, e: StoreError) -> Disposition {
        match e {
            StoreError::Conflict(_) => {
                warn!(resume_id = %id, "Record settled by another attempt; abandoning");
                Disposition::AlreadyTerminal
            }
            e => {
                error!(resume_id = %id, "Record store unavailable: {e}");
                Disposition::Infrastructure(self.infrastructure_delay())
            }
        }
    }
}
