use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::warn;

use crate::state::AppState;

/// GET /health
/// Service version plus queue reachability and worker pool counters.
/// Responds 503 while the queue is unreachable. Broker error detail only
/// goes to the log.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (status, queue) = match state.queue.ping().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => {
            warn!("Health check: queue unreachable: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "unreachable".to_string())
        }
    };

    let workers = state.workers.snapshot();
    let overall = if status != StatusCode::OK {
        "unavailable"
    } else if workers.stopping {
        "stopping"
    } else {
        "ok"
    };

    (
        status,
        Json(json!({
            "status": overall,
            "version": env!("CARGO_PKG_VERSION"),
            "service": "tailor",
            "queue": queue,
            "workers": workers,
        })),
    )
}
