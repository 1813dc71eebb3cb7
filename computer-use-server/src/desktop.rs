use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use computer_use_shared::{DesktopRequest, DesktopSession};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{ApiError, NativeError};
use crate::AppState;

/// Create a desktop, or reconnect to `sandboxId` when the body names one.
pub async fn create_desktop(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DesktopSession>, NativeError> {
    let request: DesktopRequest = if body.is_empty() {
        DesktopRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::MalformedRequest(e.to_string()))?
    };

    let limit = state.request_timeout;
    let handle = timeout(limit, state.sandbox.connect(request.sandbox_id.as_deref()))
        .await
        .map_err(|_| ApiError::TimedOut(limit))??;
    info!("Desktop {} ready", handle.id);

    Ok(Json(DesktopSession {
        sandbox_id: handle.id,
        stream_url: handle.stream_url,
    }))
}

pub async fn destroy_desktop(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    match state.sandbox.kill(&id).await {
        Ok(()) => info!("Desktop {} destroyed", id),
        Err(e) => warn!("Failed to destroy desktop {}: {}", id, e),
    }
    StatusCode::NO_CONTENT
}
