//! modelroll-api — REST control surface for ModelRoll.
//!
//! Thin axum layer over the rollout [`Supervisor`]: every route maps to
//! one supervisor operation, plus an ingestion endpoint that feeds the
//! in-process metric store.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/rollouts` | List active and finished rollouts |
//! | POST | `/api/v1/rollouts` | Start a rollout |
//! | GET | `/api/v1/rollouts/{id}` | Rollout snapshot |
//! | POST | `/api/v1/rollouts/{id}/abort` | Force a rollback |
//! | GET | `/api/v1/rollouts/{id}/audit` | Ordered audit trail |
//! | POST | `/api/v1/samples` | Ingest metric samples |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use modelroll_core::RolloutPolicy;
use modelroll_rollout::{InMemoryMetrics, Supervisor};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Supervisor,
    /// Store behind the metric source; `POST /samples` writes here.
    pub samples: Arc<InMemoryMetrics>,
    /// Used when a start request carries no policy.
    pub default_policy: RolloutPolicy,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/rollouts", get(handlers::list_rollouts).post(handlers::start_rollout))
        .route("/rollouts/{id}", get(handlers::get_rollout))
        .route("/rollouts/{id}/abort", post(handlers::abort_rollout))
        .route("/rollouts/{id}/audit", get(handlers::get_audit))
        .route("/samples", post(handlers::ingest_samples))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(|| async { "ok" }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use modelroll_rollout::{
        Adapters, AuditConfig, AuditRecorder, InMemoryRouter, MemoryAuditLog, TokioClock,
    };

    use super::*;

    fn test_router() -> Router {
        let samples = Arc::new(InMemoryMetrics::new());
        let (audit, _writer) =
            AuditRecorder::spawn(Arc::new(MemoryAuditLog::new()), AuditConfig::default());
        let supervisor = Supervisor::new(Adapters {
            metrics: samples.clone(),
            router: Arc::new(InMemoryRouter::new()),
            audit,
            clock: Arc::new(TokioClock::new()),
        });
        build_router(ApiState {
            supervisor,
            samples,
            default_policy: RolloutPolicy::default(),
        })
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let resp = test_router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn routes_are_nested_under_api_v1() {
        let resp = test_router()
            .oneshot(Request::builder().uri("/api/v1/rollouts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = test_router()
            .oneshot(Request::builder().uri("/rollouts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_method_is_rejected() {
        let resp = test_router()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/rollouts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
