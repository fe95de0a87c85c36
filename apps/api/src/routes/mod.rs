pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::resumes::handlers;
use crate::resumes::upload::MAX_UPLOAD_BYTES;
use crate::state::AppState;

/// Room for the form fields around the file.
const FORM_OVERHEAD_BYTES: usize = 256 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/api/v1/resumes",
            post(handlers::handle_upload)
                .get(handlers::handle_list)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + FORM_OVERHEAD_BYTES)),
        )
        .route(
            "/api/v1/resumes/upload-url",
            post(handlers::handle_upload_url),
        )
        .route(
            "/api/v1/resumes/from-upload",
            post(handlers::handle_submit_uploaded),
        )
        .route(
            "/api/v1/resumes/:id",
            get(handlers::handle_get).delete(handlers::handle_delete),
        )
        .route("/api/v1/resumes/:id/status", get(handlers::handle_status))
        .route(
            "/api/v1/resumes/:id/download",
            get(handlers::handle_download),
        )
        .with_state(state)
}
