use thiserror::Error;

use crate::customize::CustomizeError;
use crate::extract::ExtractError;
use crate::queue::QueueError;
use crate::records::StoreError;
use crate::render::RenderError;
use crate::storage::StorageError;

/// How a failed attempt is treated by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad upload or job context. Never retried.
    Input,
    /// Timeout or transport failure. Retried while the attempt budget lasts.
    Transient,
    /// Render engine failure, already retried within the attempt.
    Resource,
    /// Record store or queue unreachable. Not the job's fault: the delivery is
    /// released without a terminal transition.
    Fatal,
    /// Another attempt already settled the record; this one writes nothing more.
    Superseded,
}

/// A per-job failure. `message` is safe to show users and is what lands on
/// the record; `detail` is for logs only.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} error: {detail}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: detail.into(),
        }
    }
}

impl From<ExtractError> for JobError {
    fn from(e: ExtractError) -> Self {
        let message = match &e {
            ExtractError::Unsupported(_) => {
                "This file type is not supported. Upload a PDF, DOC or DOCX resume."
            }
            ExtractError::Parse { .. } => {
                "We couldn't read your resume file. Check that it opens correctly and upload it again."
            }
            ExtractError::Empty(_) => {
                "Your resume file doesn't contain any readable text. Scanned images are not supported."
            }
        };
        JobError::new(ErrorKind::Input, message, e.to_string())
    }
}

impl From<CustomizeError> for JobError {
    fn from(e: CustomizeError) -> Self {
        match &e {
            CustomizeError::Timeout(_) => JobError::new(
                ErrorKind::Transient,
                "The customization service took too long to respond.",
                e.to_string(),
            ),
            CustomizeError::Transport(_) => JobError::new(
                ErrorKind::Transient,
                "The customization service is temporarily unavailable.",
                e.to_string(),
            ),
            CustomizeError::Rejected(reason) => JobError::new(
                ErrorKind::Input,
                format!("The resume could not be customized for this job: {reason}"),
                e.to_string(),
            ),
        }
    }
}

impl From<RenderError> for JobError {
    fn from(e: RenderError) -> Self {
        JobError::new(
            ErrorKind::Resource,
            "We couldn't produce the customized document.",
            e.to_string(),
        )
    }
}

impl From<StorageError> for JobError {
    fn from(e: StorageError) -> Self {
        match &e {
            StorageError::NotFound(_) => JobError::new(
                ErrorKind::Input,
                "The uploaded resume file is no longer available. Upload it again.",
                e.to_string(),
            ),
            StorageError::Transport(_) => JobError::new(
                ErrorKind::Transient,
                "File storage is temporarily unavailable.",
                e.to_string(),
            ),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        if let StoreError::Conflict(_) = e {
            return JobError::new(
                ErrorKind::Superseded,
                "Processing already finished.",
                e.to_string(),
            );
        }
        JobError::new(
            ErrorKind::Fatal,
            "Processing was interrupted and will resume shortly.",
            e.to_string(),
        )
    }
}

impl From<QueueError> for JobError {
    fn from(e: QueueError) -> Self {
        JobError::new(
            ErrorKind::Fatal,
            "Processing was interrupted and will resume shortly.",
            e.to_string(),
        )
    }
}
