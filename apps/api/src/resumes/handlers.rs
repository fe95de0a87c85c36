use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::extract::MIME_PDF;
use crate::models::resume::{ResumeRecord, ResumeStatus, StatusView};
use crate::resumes::upload::{read_form, resolve_mime, submit, submit_uploaded, UploadedResume};
use crate::state::AppState;
use crate::storage::original_key;

const LIST_LIMIT: i64 = 100;

#[derive(Deserialize)]
pub struct ListQuery {
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Version {
    Original,
    #[default]
    Customized,
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub version: Version,
}

#[derive(Deserialize)]
pub struct UploadUrlRequest {
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Serialize)]
pub struct UploadUrlResponse {
    pub resume_id: Uuid,
    pub artifact_ref: String,
    pub upload_url: String,
    pub expires_in: u64,
}

/// POST /api/v1/resumes
pub async fn handle_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<StatusView>), AppError> {
    let form = read_form(multipart).await?;
    let record = submit(&state, form).await?;
    Ok((StatusCode::ACCEPTED, Json(StatusView::from(&record))))
}

/// POST /api/v1/resumes/from-upload
///
/// Second step of the presigned flow: the client PUT the original to the URL
/// from `upload-url` and now names the job it is for.
pub async fn handle_submit_uploaded(
    State(state): State<AppState>,
    Json(req): Json<UploadedResume>,
) -> Result<(StatusCode, Json<StatusView>), AppError> {
    let record = submit_uploaded(&state, req).await?;
    Ok((StatusCode::ACCEPTED, Json(StatusView::from(&record))))
}

/// GET /api/v1/resumes
pub async fn handle_list(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<ResumeRecord>>, AppError> {
    let records = state.records.list(params.user_id, LIST_LIMIT).await?;
    Ok(Json(records))
}

/// GET /api/v1/resumes/:id
pub async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResumeRecord>, AppError> {
    Ok(Json(state.records.load(id).await?))
}

/// GET /api/v1/resumes/:id/status
pub async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusView>, AppError> {
    let record = state.records.load(id).await?;
    Ok(Json(StatusView::from(&record)))
}

/// GET /api/v1/resumes/:id/download?version=original|customized
pub async fn handle_download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let record = state.records.load(id).await?;

    let (key, mime_type, file_name) = match params.version {
        Version::Original => (
            record.original_artifact_ref.clone(),
            record.mime_type.clone(),
            record.file_name.clone(),
        ),
        Version::Customized => {
            let key = match (&record.status, &record.customized_artifact_ref) {
                (ResumeStatus::Completed, Some(key)) => key.clone(),
                _ => {
                    return Err(AppError::Conflict(format!(
                        "Customized resume is not available (status: {})",
                        record.status.as_str()
                    )))
                }
            };
            (key, MIME_PDF.to_string(), customized_file_name(&record.file_name))
        }
    };

    let bytes = state.artifacts.get(&key).await?;
    Ok((
        [
            (header::CONTENT_TYPE, mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name.replace('"', "")),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// POST /api/v1/resumes/upload-url
pub async fn handle_upload_url(
    State(state): State<AppState>,
    Json(req): Json<UploadUrlRequest>,
) -> Result<Json<UploadUrlResponse>, AppError> {
    let (mime_type, kind) = resolve_mime(Some(&req.mime_type), &req.file_name).ok_or_else(|| {
        AppError::UnsupportedMediaType(format!(
            "'{}' is not a supported resume format",
            req.mime_type
        ))
    })?;

    let resume_id = Uuid::new_v4();
    let key = original_key(resume_id, kind.extension());
    let expiry = state.config.presign_expiry;
    let upload_url = state
        .artifacts
        .presigned_upload_url(&key, &mime_type, expiry)
        .await?;

    Ok(Json(UploadUrlResponse {
        resume_id,
        artifact_ref: key,
        upload_url,
        expires_in: expiry.as_secs(),
    }))
}

/// DELETE /api/v1/resumes/:id
pub async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let record = state.records.load(id).await?;
    if record.status == ResumeStatus::Processing {
        return Err(AppError::Conflict(
            "Resume is being customized; try again when processing finishes".to_string(),
        ));
    }

    let mut keys = vec![record.original_artifact_ref.clone()];
    keys.extend(record.customized_artifact_ref.clone());
    for key in &keys {
        if !state.artifacts.delete(key).await? {
            warn!(resume_id = %id, "Artifact '{key}' was already gone");
        }
    }

    if !state.records.delete(id).await? {
        return Err(AppError::NotFound(format!("Resume {id} not found")));
    }
    info!(resume_id = %id, "Resume deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `cv.docx` → `cv-customized.pdf`.
fn customized_file_name(original: &str) -> String {
    let stem = original
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .filter(|stem| !stem.is_empty())
        .unwrap_or(original);
    format!("{stem}-customized.pdf")
}
