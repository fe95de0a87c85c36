//! Resume records — the durable source of truth for a customization job.
//!
//! Workers never write arbitrary columns. Every mutation is one of the
//! transition updates built by [`ResumeUpdate`]'s constructors, so the
//! "customized artifact iff completed" invariant holds for every write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Status
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ResumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResumeStatus::Pending => "pending",
            ResumeStatus::Processing => "processing",
            ResumeStatus::Completed => "completed",
            ResumeStatus::Failed => "failed",
        }
    }

    /// `completed` and `failed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResumeStatus::Completed | ResumeStatus::Failed)
    }
}

impl std::str::FromStr for ResumeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ResumeStatus::Pending),
            "processing" => Ok(ResumeStatus::Processing),
            "completed" => Ok(ResumeStatus::Completed),
            "failed" => Ok(ResumeStatus::Failed),
            other => Err(format!("unknown resume status '{other}'")),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Records
// ────────────────────────────────────────────────────────────────────────────

/// The job the resume is being tailored for. Immutable once the record exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_title: String,
    pub company_name: String,
    pub job_description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub file_name: String,
    pub mime_type: String,
    pub original_artifact_ref: String,
    pub customized_artifact_ref: Option<String>,
    pub status: ResumeStatus,
    pub progress: u8,
    pub attempt_count: u32,
    pub error: Option<String>,
    pub job_context: JobContext,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row shape of the `resumes` table.
#[derive(Debug, Clone, FromRow)]
pub struct ResumeRow {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub file_name: String,
    pub mime_type: String,
    pub original_artifact_ref: String,
    pub customized_artifact_ref: Option<String>,
    pub status: String,
    pub progress: i16,
    pub attempt_count: i32,
    pub error: Option<String>,
    pub job_title: String,
    pub company_name: String,
    pub job_description: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ResumeRow> for ResumeRecord {
    type Error = String;

    fn try_from(row: ResumeRow) -> Result<Self, Self::Error> {
        Ok(ResumeRecord {
            id: row.id,
            user_id: row.user_id,
            file_name: row.file_name,
            mime_type: row.mime_type,
            original_artifact_ref: row.original_artifact_ref,
            customized_artifact_ref: row.customized_artifact_ref,
            status: row.status.parse()?,
            progress: row.progress.clamp(0, 100) as u8,
            attempt_count: row.attempt_count.max(0) as u32,
            error: row.error,
            job_context: JobContext {
                job_title: row.job_title,
                company_name: row.company_name,
                job_description: row.job_description,
            },
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Input for creating a record at upload time. The record starts `pending`.
#[derive(Debug, Clone)]
pub struct NewResume {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub file_name: String,
    pub mime_type: String,
    pub original_artifact_ref: String,
    pub job_context: JobContext,
}

impl NewResume {
    pub fn into_record(self, now: DateTime<Utc>) -> ResumeRecord {
        ResumeRecord {
            id: self.id,
            user_id: self.user_id,
            file_name: self.file_name,
            mime_type: self.mime_type,
            original_artifact_ref: self.original_artifact_ref,
            customized_artifact_ref: None,
            status: ResumeStatus::Pending,
            progress: 0,
            attempt_count: 0,
            error: None,
            job_context: self.job_context,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transition updates
// ────────────────────────────────────────────────────────────────────────────

/// A partial update applied to a record as a single atomic write.
///
/// Fields are private; the only way to build one is through the transition
/// constructors below.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeUpdate {
    status: Option<ResumeStatus>,
    progress: Option<u8>,
    attempt_count: Option<u32>,
    /// `Some(None)` clears the column.
    error: Option<Option<String>>,
    customized_artifact_ref: Option<String>,
    completed_at: Option<DateTime<Utc>>,
}

impl ResumeUpdate {
    fn empty() -> Self {
        Self {
            status: None,
            progress: None,
            attempt_count: None,
            error: None,
            customized_artifact_ref: None,
            completed_at: None,
        }
    }

    /// Enter `processing` for a fresh attempt: progress reset, error cleared.
    pub fn start_attempt(attempt_count: u32) -> Self {
        Self {
            status: Some(ResumeStatus::Processing),
            progress: Some(0),
            attempt_count: Some(attempt_count),
            error: Some(None),
            ..Self::empty()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress.min(100)),
            ..Self::empty()
        }
    }

    /// The attempt failed but will be redelivered. Status stays `processing`.
    pub fn retry_scheduled(message: impl Into<String>) -> Self {
        Self {
            error: Some(Some(message.into())),
            ..Self::empty()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(ResumeStatus::Failed),
            error: Some(Some(message.into())),
            ..Self::empty()
        }
    }

    pub fn completed(customized_artifact_ref: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(ResumeStatus::Completed),
            progress: Some(100),
            customized_artifact_ref: Some(customized_artifact_ref.into()),
            completed_at: Some(at),
            error: Some(None),
            ..Self::empty()
        }
    }

    /// Statuses a record must be in for this update to apply. Terminal
    /// records accept nothing, and only `start_attempt` leaves `pending`.
    pub fn allowed_from(&self) -> &'static [ResumeStatus] {
        if self.attempt_count.is_some() {
            &[ResumeStatus::Pending, ResumeStatus::Processing]
        } else {
            &[ResumeStatus::Processing]
        }
    }

    pub fn status(&self) -> Option<ResumeStatus> {
        self.status
    }

    pub fn progress_value(&self) -> Option<u8> {
        self.progress
    }

    pub fn attempt_count(&self) -> Option<u32> {
        self.attempt_count
    }

    pub fn error(&self) -> Option<Option<&str>> {
        self.error.as_ref().map(|e| e.as_deref())
    }

    pub fn customized_artifact_ref(&self) -> Option<&str> {
        self.customized_artifact_ref.as_deref()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

impl ResumeRecord {
    pub fn accepts(&self, update: &ResumeUpdate) -> bool {
        update.allowed_from().contains(&self.status)
    }

    /// Applies an update in place without checking [`ResumeRecord::accepts`].
    /// Stores that keep records in memory use this to get the same semantics
    /// as the SQL `UPDATE`.
    pub fn apply(&mut self, update: &ResumeUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(attempts) = update.attempt_count {
            self.attempt_count = attempts;
        }
        if let Some(error) = &update.error {
            self.error = error.clone();
        }
        if let Some(artifact) = &update.customized_artifact_ref {
            self.customized_artifact_ref = Some(artifact.clone());
        }
        if let Some(at) = update.completed_at {
            self.completed_at = Some(at);
        }
        self.updated_at = now;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Status projection
// ────────────────────────────────────────────────────────────────────────────

/// Payload returned to polling clients.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub id: Uuid,
    pub status: ResumeStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub can_download: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl From<&ResumeRecord> for StatusView {
    fn from(record: &ResumeRecord) -> Self {
        let completed = record.status == ResumeStatus::Completed;
        StatusView {
            id: record.id,
            status: record.status,
            progress: record.progress,
            error: record.error.clone(),
            completed_at: record.completed_at,
            can_download: completed,
            download_url: completed.then(|| {
                format!("/api/v1/resumes/{}/download?version=customized", record.id)
            }),
        }
    }
}
