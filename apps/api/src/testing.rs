//! In-memory collaborators for pipeline, worker and handler tests.
//!
//! Time-based state (leases, lock TTLs, delayed jobs) uses `tokio::time`, so
//! tests running with a paused clock control expiry deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::customize::{CustomizeError, Customizer};
use crate::extract::{ExtractError, TextExtractor};
use crate::models::resume::{JobContext, NewResume, ResumeRecord, ResumeUpdate};
use crate::pipeline::{Backoff, Collaborators, Pipeline, PipelineSettings};
use crate::queue::{
    CustomizationJob, Delivery, JobHandle, JobQueue, LockToken, QueueError, ResumeLocks,
};
use crate::records::{ResumeStore, StoreError};
use crate::render::{RenderError, Renderer};
use crate::storage::{original_key, ArtifactStore, StorageError};

pub const FAKE_PDF: &[u8] = b"%PDF-1.4 customized";

// ────────────────────────────────────────────────────────────────────────────
// Queue
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    ready: VecDeque<CustomizationJob>,
    leased: HashMap<String, (CustomizationJob, Instant)>,
    delayed: Vec<(Instant, CustomizationJob)>,
    next_receipt: u64,
    acked: Vec<Uuid>,
    nacked: Vec<(Uuid, Duration)>,
}

/// Same delivery rules as the Redis queue: FIFO ready list, expired leases
/// requeued at the head, delayed jobs promoted once due.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    failing_dequeues: AtomicU32,
    dequeue_errors: AtomicU32,
    down: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` dequeues fail as if the broker were unreachable.
    pub fn fail_next_dequeues(&self, n: u32) {
        self.failing_dequeues.store(n, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn dequeue_errors(&self) -> u32 {
        self.dequeue_errors.load(Ordering::SeqCst)
    }

    /// Jobs not yet acked, in any state.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.ready.len() + state.leased.len() + state.delayed.len()
    }

    pub fn acked(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(Uuid, Duration)> {
        self.state.lock().unwrap().nacked.clone()
    }

    /// Puts a raw message straight onto the ready list.
    pub fn push(&self, job: CustomizationJob) {
        self.state.lock().unwrap().ready.push_back(job);
    }

    fn check_up(&self) -> Result<(), QueueError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: CustomizationJob) -> Result<JobHandle, QueueError> {
        self.check_up()?;
        let handle = JobHandle {
            job_id: job.job_id,
            resume_id: job.resume_id,
        };
        self.push(job);
        Ok(handle)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        self.check_up()?;
        let failing = self.failing_dequeues.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_dequeues.store(failing - 1, Ordering::SeqCst);
            self.dequeue_errors.fetch_add(1, Ordering::SeqCst);
            return Err(QueueError::Unavailable("connection reset".to_string()));
        }

        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        let (due, waiting): (Vec<_>, Vec<_>) =
            state.delayed.drain(..).partition(|(at, _)| *at <= now);
        state.delayed = waiting;
        for (_, job) in due {
            state.ready.push_back(job);
        }

        let expired: Vec<String> = state
            .leased
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((job, _)) = state.leased.remove(&receipt) {
                state.ready.push_front(job);
            }
        }

        let Some(job) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.next_receipt += 1;
        let receipt = format!("lease-{}", state.next_receipt);
        state
            .leased
            .insert(receipt.clone(), (job.clone(), now + lease));
        Ok(Some(Delivery { job, receipt }))
    }

    async fn extend_lease(&self, delivery: &Delivery, lease: Duration) -> Result<bool, QueueError> {
        self.check_up()?;
        let mut state = self.state.lock().unwrap();
        match state.leased.get_mut(&delivery.receipt) {
            Some((_, deadline)) => {
                *deadline = Instant::now() + lease;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        self.check_up()?;
        let mut state = self.state.lock().unwrap();
        let removed = state.leased.remove(&delivery.receipt).is_some();
        if removed {
            state.acked.push(delivery.job.resume_id);
        }
        Ok(removed)
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<bool, QueueError> {
        self.check_up()?;
        let mut state = self.state.lock().unwrap();
        if state.leased.remove(&delivery.receipt).is_none() {
            return Ok(false);
        }
        state
            .delayed
            .push((Instant::now() + delay, delivery.job.redelivery()));
        state.nacked.push((delivery.job.resume_id, delay));
        Ok(true)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check_up()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Locks
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<Uuid, (String, Instant)>>,
    next_token: AtomicU32,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock as some other worker would.
    pub fn hold(&self, resume_id: Uuid, ttl: Duration) {
        self.held
            .lock()
            .unwrap()
            .insert(resume_id, ("elsewhere".to_string(), Instant::now() + ttl));
    }

    pub fn is_held(&self, resume_id: Uuid) -> bool {
        self.held
            .lock()
            .unwrap()
            .get(&resume_id)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }
}

#[async_trait]
impl ResumeLocks for MemoryLocks {
    async fn try_acquire(
        &self,
        resume_id: Uuid,
        ttl: Duration,
    ) -> Result<Option<LockToken>, QueueError> {
        let now = Instant::now();
        let mut held = self.held.lock().unwrap();
        if let Some((_, expires)) = held.get(&resume_id) {
            if *expires > now {
                return Ok(None);
            }
        }
        let token = format!("token-{}", self.next_token.fetch_add(1, Ordering::SeqCst));
        held.insert(resume_id, (token.clone(), now + ttl));
        Ok(Some(LockToken { resume_id, token }))
    }

    async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<bool, QueueError> {
        let now = Instant::now();
        let mut held = self.held.lock().unwrap();
        match held.get_mut(&token.resume_id) {
            Some((owner, expires)) if *owner == token.token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, token: &LockToken) -> Result<bool, QueueError> {
        let mut held = self.held.lock().unwrap();
        match held.get(&token.resume_id) {
            Some((owner, _)) if *owner == token.token => {
                held.remove(&token.resume_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Records
// ────────────────────────────────────────────────────────────────────────────

/// Record store that keeps every post-update snapshot for invariant checks.
#[derive(Default)]
pub struct MemoryRecords {
    records: Mutex<HashMap<Uuid, ResumeRecord>>,
    history: Mutex<Vec<ResumeRecord>>,
    failing: AtomicBool,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ResumeRecord) {
        self.records.lock().unwrap().insert(record.id, record);
    }

    pub fn get(&self, id: Uuid) -> Option<ResumeRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    /// Every state any record has been in, in write order.
    pub fn history(&self) -> Vec<ResumeRecord> {
        self.history.lock().unwrap().clone()
    }

    /// While set, every call fails as if the database were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl ResumeStore for MemoryRecords {
    async fn create(&self, resume: NewResume) -> Result<ResumeRecord, StoreError> {
        self.check_up()?;
        let record = resume.into_record(Utc::now());
        self.insert(record.clone());
        Ok(record)
    }

    async fn load(&self, id: Uuid) -> Result<ResumeRecord, StoreError> {
        self.check_up()?;
        self.get(id).ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: Uuid, update: ResumeUpdate) -> Result<(), StoreError> {
        self.check_up()?;
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !record.accepts(&update) {
            return Err(StoreError::Conflict(id));
        }
        record.apply(&update, Utc::now());
        self.history.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn list(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ResumeRecord>, StoreError> {
        self.check_up()?;
        let mut records: Vec<ResumeRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| user_id.is_none() || r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check_up()?;
        Ok(self.records.lock().unwrap().remove(&id).is_some())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Artifacts
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryArtifacts {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    failing_gets: AtomicU32,
}

impl MemoryArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, bytes: impl Into<Bytes>, mime_type: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes.into(), mime_type.to_string()));
    }

    pub fn object(&self, key: &str) -> Option<(Bytes, String)> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// The next `n` gets fail with a transport error.
    pub fn fail_next_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn upload(&self, bytes: Bytes, key: &str, mime_type: &str) -> Result<String, StorageError> {
        self.put(key, bytes, mime_type);
        Ok(format!("memory://{key}"))
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let failing = self.failing_gets.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_gets.store(failing - 1, Ordering::SeqCst);
            return Err(StorageError::Transport("connection reset".to_string()));
        }
        self.object(key)
            .map(|(bytes, _)| bytes)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().unwrap().remove(key).is_some())
    }

    async fn presigned_upload_url(
        &self,
        key: &str,
        _mime_type: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        Ok(format!("memory://{key}?expires={}", expires_in.as_secs()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Customizer / renderer / extractor
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(CustomizeError),
    /// Never answers; only the timeout ends the call.
    Hang,
}

/// Plays back scripted steps, then echoes once the script runs out.
/// Tracks how many calls overlap.
#[derive(Default)]
pub struct ScriptedCustomizer {
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Option<Step>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedCustomizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
        let customizer = Self::new();
        customizer.script.lock().unwrap().extend(steps);
        customizer
    }

    /// Step used for every call once the script is exhausted.
    pub fn always(step: Step) -> Self {
        let customizer = Self::new();
        *customizer.fallback.lock().unwrap() = Some(step);
        customizer
    }

    /// Time each call takes before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Customizer for ScriptedCustomizer {
    async fn request(&self, resume_text: &str, job: &JobContext) -> Result<String, CustomizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.lock().unwrap().clone());
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match step {
            Some(Step::Reply(text)) => Ok(text),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Ok(format!("# Tailored for {}\n\n{resume_text}", job.job_title)),
        }
    }
}

/// Fails the first `failures` renders, then returns [`FAKE_PDF`].
#[derive(Default)]
pub struct ScriptedRenderer {
    failures: AtomicU32,
    calls: AtomicUsize,
}

impl ScriptedRenderer {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn render(&self, _text: &str) -> Result<Bytes, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(RenderError::Engine {
                status: "exit status: 1".to_string(),
                stderr: "out of memory".to_string(),
            });
        }
        Ok(Bytes::from_static(FAKE_PDF))
    }
}

/// Stands in for PDF parsing: the "PDF" is its own text after the magic.
pub struct StubPdfExtractor;

impl TextExtractor for StubPdfExtractor {
    fn extract(&self, bytes: &[u8], _declared_mime: &str) -> Result<String, ExtractError> {
        let body = bytes.strip_prefix(b"%PDF-1.4\n").ok_or(ExtractError::Parse {
            kind: crate::extract::DocumentKind::Pdf,
            message: "missing header".to_string(),
        })?;
        let text = String::from_utf8_lossy(body).trim().to_string();
        if text.is_empty() {
            return Err(ExtractError::Empty(crate::extract::DocumentKind::Pdf));
        }
        Ok(text)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────────────────

pub fn test_config() -> crate::config::Config {
    crate::config::Config::from_lookup(|key| {
        let value = match key {
            "DATABASE_URL" => "postgres://localhost/tailor_test",
            "REDIS_URL" => "redis://localhost:6379",
            "S3_BUCKET" => "resumes",
            "AWS_ACCESS_KEY_ID" => "test",
            "AWS_SECRET_ACCESS_KEY" => "test",
            "ANTHROPIC_API_KEY" => "test",
            _ => return None,
        };
        Some(value.to_string())
    })
    .expect("test config is complete")
}

pub fn job_context() -> JobContext {
    JobContext {
        job_title: "Backend Engineer".to_string(),
        company_name: "Acme".to_string(),
        job_description: "Build reliable Rust services for payments.".to_string(),
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        customization_timeout: Duration::from_secs(5),
        max_retries: 2,
        render_retries: 1,
        backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(2)),
        lock_ttl: Duration::from_secs(30),
        busy_requeue_delay: Duration::from_millis(250),
    }
}

/// Every in-memory collaborator plus the pipeline wired over them.
pub struct Harness {
    pub records: Arc<MemoryRecords>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub locks: Arc<MemoryLocks>,
    pub queue: Arc<MemoryQueue>,
    pub customizer: Arc<ScriptedCustomizer>,
    pub renderer: Arc<ScriptedRenderer>,
    pub pipeline: Arc<Pipeline>,
}

impl Harness {
    pub fn new(customizer: ScriptedCustomizer, renderer: ScriptedRenderer) -> Self {
        Self::build(
            customizer,
            renderer,
            Arc::new(crate::extract::DocumentExtractor),
            settings(),
        )
    }

    pub fn build(
        customizer: ScriptedCustomizer,
        renderer: ScriptedRenderer,
        extractor: Arc<dyn TextExtractor>,
        settings: PipelineSettings,
    ) -> Self {
        let records = Arc::new(MemoryRecords::new());
        let artifacts = Arc::new(MemoryArtifacts::new());
        let locks = Arc::new(MemoryLocks::new());
        let customizer = Arc::new(customizer);
        let renderer = Arc::new(renderer);

        let pipeline = Pipeline::new(
            Collaborators {
                records: records.clone(),
                artifacts: artifacts.clone(),
                extractor,
                customizer: customizer.clone(),
                renderer: renderer.clone(),
                locks: locks.clone(),
            },
            settings,
        );

        Self {
            records,
            artifacts,
            locks,
            queue: Arc::new(MemoryQueue::new()),
            customizer,
            renderer,
            pipeline: Arc::new(pipeline),
        }
    }

    /// Stores a plain-text original and a `pending` record for it.
    pub fn seed_text_resume(&self, text: &str) -> ResumeRecord {
        self.seed(text.as_bytes().to_vec(), "resume.txt", crate::extract::MIME_TEXT)
    }

    pub fn seed(&self, bytes: Vec<u8>, file_name: &str, mime_type: &str) -> ResumeRecord {
        let id = Uuid::new_v4();
        let extension = crate::extract::DocumentKind::from_mime(mime_type)
            .map(|k| k.extension())
            .unwrap_or("bin");
        let key = original_key(id, extension);
        self.artifacts.put(&key, bytes, mime_type);

        let record = NewResume {
            id,
            user_id: None,
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            original_artifact_ref: key,
            job_context: job_context(),
        }
        .into_record(Utc::now());
        self.records.insert(record.clone());
        record
    }

    pub fn record(&self, id: Uuid) -> ResumeRecord {
        self.records.get(id).expect("record exists")
    }
}
