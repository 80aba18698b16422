//! REST API handlers.
//!
//! Each handler calls one supervisor operation and returns the JSON
//! envelope `{ success, data, error }`.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use modelroll_core::{MetricSample, RolloutPolicy, RolloutTarget};
use modelroll_rollout::RolloutError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for a supervisor error.
pub fn status_for(err: &RolloutError) -> StatusCode {
    match err {
        RolloutError::Conflict { .. } => StatusCode::CONFLICT,
        RolloutError::PolicyViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RolloutError::NotFound(_) => StatusCode::NOT_FOUND,
        RolloutError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rollout_error(err: RolloutError) -> Response {
    error_response(&err.to_string(), status_for(&err))
}

// ── Rollouts ───────────────────────────────────────────────────

/// Request body to start a rollout.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartRolloutRequest {
    pub target: RolloutTarget,
    /// Falls back to the daemon's default policy.
    #[serde(default)]
    pub policy: Option<RolloutPolicy>,
}

/// Optional body for an abort.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AbortRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/rollouts
pub async fn start_rollout(
    State(state): State<ApiState>,
    Json(req): Json<StartRolloutRequest>,
) -> Response {
    let policy = req.policy.unwrap_or_else(|| state.default_policy.clone());
    match state.supervisor.start(req.target, policy).await {
        Ok(snapshot) => {
            info!(rollout_id = %snapshot.id, service = %snapshot.target.service, "rollout started via API");
            (StatusCode::CREATED, ApiResponse::ok(snapshot)).into_response()
        }
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.supervisor.list().await).into_response()
}

/// GET /api/v1/rollouts/:id
pub async fn get_rollout(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.supervisor.status(&id).await {
        Ok(snapshot) => ApiResponse::ok(snapshot).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/rollouts/:id/abort
///
/// The body is optional; an empty body aborts with a generic reason.
pub async fn abort_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let req = if body.is_empty() {
        AbortRequest::default()
    } else {
        match serde_json::from_slice::<AbortRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return error_response(&format!("invalid abort body: {e}"), StatusCode::BAD_REQUEST)
            }
        }
    };
    let reason = req.reason.unwrap_or_else(|| "operator request".to_string());

    match state.supervisor.abort(&id, &reason).await {
        Ok(snapshot) => (StatusCode::ACCEPTED, ApiResponse::ok(snapshot)).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/rollouts/:id/audit
pub async fn get_audit(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.supervisor.audit(&id).await {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => rollout_error(e),
    }
}

// ── Samples ────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestSummary {
    pub accepted: usize,
}

/// POST /api/v1/samples
pub async fn ingest_samples(
    State(state): State<ApiState>,
    Json(samples): Json<Vec<MetricSample>>,
) -> Response {
    if let Some(bad) = samples.iter().find(|s| !s.value.is_finite()) {
        return error_response(
            &format!("non-finite value for {} on {}", bad.metric, bad.model_version),
            StatusCode::UNPROCESSABLE_ENTITY,
        );
    }
    let accepted = samples.len();
    state.samples.push_many(samples).await;
    debug!(accepted, "metric samples ingested");
    (StatusCode::ACCEPTED, ApiResponse::ok(IngestSummary { accepted })).into_response()
}
