//! Resume Record Store — durable status/progress/result fields.
//!
//! Reads and writes are strongly consistent: a completed `update` is visible
//! to the next `load`. Each `update` is one SQL statement guarded by the
//! statuses the transition may leave, so readers never observe half of a
//! transition and terminal rows never change.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use uuid::Uuid;

use crate::models::resume::{NewResume, ResumeRecord, ResumeRow, ResumeUpdate};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resume {0} not found")]
    NotFound(Uuid),

    /// The record's status doesn't accept the transition. In practice it
    /// already reached `completed` or `failed` through another attempt.
    #[error("resume {0} no longer accepts this transition")]
    Conflict(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt resume row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn create(&self, resume: NewResume) -> Result<ResumeRecord, StoreError>;

    async fn load(&self, id: Uuid) -> Result<ResumeRecord, StoreError>;

    async fn update(&self, id: Uuid, update: ResumeUpdate) -> Result<(), StoreError>;

    /// Newest first. `user_id = None` lists every record.
    async fn list(&self, user_id: Option<Uuid>, limit: i64)
        -> Result<Vec<ResumeRecord>, StoreError>;

    /// Returns `false` when the record did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// PostgreSQL-backed store over the `resumes` table.
#[derive(Clone)]
pub struct PgResumeStore {
    pool: PgPool,
}

impl PgResumeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_record(row: ResumeRow) -> Result<ResumeRecord, StoreError> {
    ResumeRecord::try_from(row).map_err(StoreError::Corrupt)
}

#[async_trait]
impl ResumeStore for PgResumeStore {
    async fn create(&self, resume: NewResume) -> Result<ResumeRecord, StoreError> {
        let row: ResumeRow = sqlx::query_as(
            r#"
            INSERT INTO resumes
                (id, user_id, file_name, mime_type, original_artifact_ref,
                 job_title, company_name, job_description, status, progress, attempt_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0, 0)
            RETURNING *
            "#,
        )
        .bind(resume.id)
        .bind(resume.user_id)
        .bind(&resume.file_name)
        .bind(&resume.mime_type)
        .bind(&resume.original_artifact_ref)
        .bind(&resume.job_context.job_title)
        .bind(&resume.job_context.company_name)
        .bind(&resume.job_context.job_description)
        .fetch_one(&self.pool)
        .await?;

        to_record(row)
    }

    async fn load(&self, id: Uuid) -> Result<ResumeRecord, StoreError> {
        let row: Option<ResumeRow> = sqlx::query_as("SELECT * FROM resumes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(StoreError::NotFound(id)).and_then(to_record)
    }

    async fn update(&self, id: Uuid, update: ResumeUpdate) -> Result<(), StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE resumes SET updated_at = ");
        qb.push_bind(Utc::now());

        if let Some(status) = update.status() {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(progress) = update.progress_value() {
            qb.push(", progress = ").push_bind(progress as i16);
        }
        if let Some(attempts) = update.attempt_count() {
            qb.push(", attempt_count = ").push_bind(attempts as i32);
        }
        if let Some(error) = update.error() {
            qb.push(", error = ").push_bind(error.map(str::to_string));
        }
        if let Some(artifact) = update.customized_artifact_ref() {
            qb.push(", customized_artifact_ref = ")
                .push_bind(artifact.to_string());
        }
        if let Some(at) = update.completed_at() {
            qb.push(", completed_at = ").push_bind(at);
        }

        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" AND status IN (");
        let mut statuses = qb.separated(", ");
        for status in update.allowed_from() {
            statuses.push_bind(status.as_str());
        }
        statuses.push_unseparated(")");

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM resumes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StoreError::Conflict(id)),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn list(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ResumeRecord>, StoreError> {
        let rows: Vec<ResumeRow> = sqlx::query_as(
            r#"
            SELECT * FROM resumes
            WHERE $1::uuid IS NULL OR user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(to_record).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM resumes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
