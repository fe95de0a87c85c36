//! Artifact Store — object storage for original and customized resumes.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

pub mod s3;

pub use s3::S3ArtifactStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("storage transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` under `key` and returns an addressable URL for it.
    async fn upload(&self, bytes: Bytes, key: &str, mime_type: &str)
        -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Returns `false` when nothing was stored under `key`.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn presigned_upload_url(
        &self,
        key: &str,
        mime_type: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError>;
}

/// Key of the uploaded original, e.g. `resumes/<id>/original.pdf`.
pub fn original_key(resume_id: Uuid, extension: &str) -> String {
    format!("resumes/{resume_id}/original.{extension}")
}

/// Key of the rendered output. Stable per resume, so a re-upload after a
/// crashed attempt overwrites instead of leaking objects.
pub fn customized_key(resume_id: Uuid) -> String {
    format!("resumes/{resume_id}/customized.pdf")
}
