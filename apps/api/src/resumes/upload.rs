use axum::extract::Multipart;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::extract::{is_supported, DocumentKind};
use crate::models::resume::{JobContext, NewResume, ResumeRecord};
use crate::queue::enqueue_customization;
use crate::records::StoreError;
use crate::state::AppState;
use crate::storage::{original_key, StorageError};

/// Largest accepted original.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// A parsed `POST /api/v1/resumes` request.
#[derive(Debug, Clone)]
pub struct UploadForm {
    pub file_name: String,
    pub declared_mime: Option<String>,
    pub bytes: Bytes,
    pub job_context: JobContext,
    pub user_id: Option<Uuid>,
}

pub async fn read_form(mut multipart: Multipart) -> Result<UploadForm, AppError> {
    let mut file: Option<(String, Option<String>, Bytes)> = None;
    let mut job_title = String::new();
    let mut company_name = String::new();
    let mut job_description = String::new();
    let mut user_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("resume").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("Failed to read file: {e}")))?;
                file = Some((file_name, content_type, bytes));
            }
            "job_title" | "company_name" | "job_description" | "user_id" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("Failed to read '{name}': {e}")))?;
                match name.as_str() {
                    "job_title" => job_title = value,
                    "company_name" => company_name = value,
                    "job_description" => job_description = value,
                    _ if value.trim().is_empty() => {}
                    _ => {
                        user_id = Some(value.trim().parse::<Uuid>().map_err(|_| {
                            AppError::Validation("user_id must be a UUID".to_string())
                        })?)
                    }
                }
            }
            other => warn!("Ignoring unexpected multipart field '{other}'"),
        }
    }

    let (file_name, declared_mime, bytes) =
        file.ok_or_else(|| AppError::Validation("No file provided".to_string()))?;

    Ok(UploadForm {
        file_name,
        declared_mime,
        bytes,
        job_context: JobContext {
            job_title: job_title.trim().to_string(),
            company_name: company_name.trim().to_string(),
            job_description: job_description.trim().to_string(),
        },
        user_id,
    })
}

/// Declared content type, falling back to the file extension when the client
/// sent none or a generic one.
pub fn resolve_mime(declared: Option<&str>, file_name: &str) -> Option<(String, DocumentKind)> {
    if let Some(mime) = declared {
        if is_supported(mime) {
            return DocumentKind::from_mime(mime).map(|kind| (mime.to_string(), kind));
        }
        if !mime.starts_with("application/octet-stream") {
            return None;
        }
    }

    let extension = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "pdf" => crate::extract::MIME_PDF,
        "docx" => crate::extract::MIME_DOCX,
        "doc" => crate::extract::MIME_DOC,
        "txt" => crate::extract::MIME_TEXT,
        "md" => crate::extract::MIME_MARKDOWN,
        _ => return None,
    };
    DocumentKind::from_mime(mime).map(|kind| (mime.to_string(), kind))
}

/// Validates, stores the original, creates the record and enqueues the job.
///
/// Nothing is written before validation passes. When enqueueing fails the
/// record and the stored original are removed again so no `pending` record
/// is left without a job.
pub async fn submit(state: &AppState, form: UploadForm) -> Result<ResumeRecord, AppError> {
    let (mime_type, kind) = resolve_mime(form.declared_mime.as_deref(), &form.file_name)
        .ok_or_else(|| unsupported(form.declared_mime.as_deref().unwrap_or(&form.file_name)))?;
    check_size(form.bytes.len())?;
    crate::customize::validate_job_context(&form.job_context)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let id = Uuid::new_v4();
    let key = original_key(id, kind.extension());
    state
        .artifacts
        .upload(form.bytes, &key, &mime_type)
        .await?;

    let new = NewResume {
        id,
        user_id: form.user_id,
        file_name: form.file_name,
        mime_type,
        original_artifact_ref: key.clone(),
        job_context: form.job_context,
    };
    match admit(state, new, kind).await {
        Ok(record) => Ok(record),
        Err(e) => {
            remove_original(state, &key).await;
            Err(e)
        }
    }
}

/// A `POST /api/v1/resumes/from-upload` body: an original the client already
/// PUT to a presigned URL, plus the job it is tailored for.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedResume {
    pub resume_id: Uuid,
    pub artifact_ref: String,
    pub file_name: String,
    pub mime_type: String,
    pub job_title: String,
    #[serde(default)]
    pub company_name: String,
    pub job_description: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

/// Creates the record and job for an original uploaded through a presigned
/// URL.
///
/// `artifact_ref` must be the key issued for `resume_id`, the id must be
/// unused, and the object must exist within the upload size limit. The
/// client's object is kept when enqueueing fails so the call can be retried.
pub async fn submit_uploaded(
    state: &AppState,
    req: UploadedResume,
) -> Result<ResumeRecord, AppError> {
    let (mime_type, kind) = resolve_mime(Some(&req.mime_type), &req.file_name)
        .ok_or_else(|| unsupported(&req.mime_type))?;
    let key = original_key(req.resume_id, kind.extension());
    if req.artifact_ref != key {
        return Err(AppError::Validation(format!(
            "artifact_ref was not issued for resume {}",
            req.resume_id
        )));
    }
    let job_context = JobContext {
        job_title: req.job_title.trim().to_string(),
        company_name: req.company_name.trim().to_string(),
        job_description: req.job_description.trim().to_string(),
    };
    crate::customize::validate_job_context(&job_context)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    match state.records.load(req.resume_id).await {
        Ok(_) => {
            return Err(AppError::Conflict(format!(
                "Resume {} was already submitted",
                req.resume_id
            )))
        }
        Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let bytes = match state.artifacts.get(&key).await {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound(_)) => {
            return Err(AppError::Validation(
                "Nothing has been uploaded to artifact_ref yet".to_string(),
            ))
        }
        Err(e) => return Err(e.into()),
    };
    check_size(bytes.len())?;

    let new = NewResume {
        id: req.resume_id,
        user_id: req.user_id,
        file_name: req.file_name,
        mime_type,
        original_artifact_ref: key,
        job_context,
    };
    admit(state, new, kind).await
}

/// Creates the record, then enqueues its job. The record is removed again
/// when enqueueing fails.
async fn admit(
    state: &AppState,
    new: NewResume,
    kind: DocumentKind,
) -> Result<ResumeRecord, AppError> {
    let id = new.id;
    let record = state.records.create(new).await?;

    if let Err(e) = enqueue_customization(state.queue.as_ref(), id).await {
        error!(resume_id = %id, "Enqueue failed, rolling back upload: {e}");
        if let Err(e) = state.records.delete(id).await {
            error!(resume_id = %id, "Failed to remove record after enqueue failure: {e}");
        }
        return Err(e.into());
    }

    info!(resume_id = %id, kind = %kind, "Resume accepted for customization");
    Ok(record)
}

fn unsupported(declared: &str) -> AppError {
    AppError::UnsupportedMediaType(format!(
        "'{declared}' is not a supported resume format. Upload a PDF, DOC or DOCX file."
    ))
}

fn check_size(len: usize) -> Result<(), AppError> {
    if len == 0 {
        return Err(AppError::Validation("The uploaded file is empty".to_string()));
    }
    if len > MAX_UPLOAD_BYTES {
        return Err(AppError::Validation(format!(
            "The uploaded file exceeds {} MB",
            MAX_UPLOAD_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

async fn remove_original(state: &AppState, key: &str) {
    if let Err(e) = state.artifacts.delete(key).await {
        error!("Failed to remove stored original '{key}': {e}");
    }
}
