//! Operator client for a running modelrolld.

use std::time::Duration;

use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use modelroll_api::handlers::{AbortRequest, StartRolloutRequest};
use modelroll_core::{AuditRecord, RolloutSnapshot};

use crate::transport::{self, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: StatusCode, message: String },

    #[error("cannot reach modelrolld: {0}")]
    Transport(#[from] TransportError),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Process exit code: 2 for conflicts and rejected requests, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            ClientError::Conflict(_) | ClientError::Rejected { .. } => 2,
            _ => 1,
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    address: String,
    timeout: Duration,
}

impl ApiClient {
    /// `address` is the daemon's `host:port`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub async fn start(&self, req: &StartRolloutRequest) -> Result<RolloutSnapshot, ClientError> {
        let body = serde_json::to_vec(req).map_err(|e| ClientError::Decode(e.to_string()))?;
        self.call(Method::POST, "/api/v1/rollouts", Some(body)).await
    }

    pub async fn abort(&self, id: &str, reason: Option<String>) -> Result<RolloutSnapshot, ClientError> {
        let body = serde_json::to_vec(&AbortRequest { reason })
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        self.call(Method::POST, &rollout_path(id, "/abort"), Some(body))
            .await
    }

    pub async fn status(&self, id: &str) -> Result<RolloutSnapshot, ClientError> {
        self.call(Method::GET, &rollout_path(id, ""), None).await
    }

    pub async fn list(&self) -> Result<Vec<RolloutSnapshot>, ClientError> {
        self.call(Method::GET, "/api/v1/rollouts", None).await
    }

    pub async fn audit(&self, id: &str) -> Result<Vec<AuditRecord>, ClientError> {
        self.call(Method::GET, &rollout_path(id, "/audit"), None)
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, ClientError> {
        let (status, bytes) =
            transport::request(method, &self.address, path, body, self.timeout).await?;

        if status.is_success() {
            let envelope: Envelope<T> = serde_json::from_slice(&bytes)
                .map_err(|e| ClientError::Decode(format!("{status}: {e}")))?;
            return envelope
                .data
                .ok_or_else(|| ClientError::Decode(format!("{status}: response has no data")));
        }

        // Extractor rejections come back as plain text, not the envelope.
        let message = serde_json::from_slice::<Envelope<serde_json::Value>>(&bytes)
            .ok()
            .and_then(|e| e.error)
            .unwrap_or_else(|| String::from_utf8_lossy(&bytes).trim().to_string());

        Err(match status {
            StatusCode::CONFLICT => ClientError::Conflict(message),
            s if s.is_client_error() => ClientError::Rejected { status: s, message },
            s => ClientError::Server { status: s, message },
        })
    }
}

/// `/api/v1/rollouts/{id}{suffix}` with the id escaped as one path segment.
fn rollout_path(id: &str, suffix: &str) -> String {
    format!("/api/v1/rollouts/{}{suffix}", urlencoding::encode(id))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use modelroll_api::{build_router, ApiState};
    use modelroll_core::{RolloutPolicy, RolloutState, RolloutTarget};
    use modelroll_rollout::{
        Adapters, AuditConfig, AuditRecorder, InMemoryMetrics, InMemoryRouter, MemoryAuditLog,
        Supervisor, TokioClock,
    };

    use super::*;

    async fn spawn_daemon() -> (ApiClient, Supervisor) {
        let samples = Arc::new(InMemoryMetrics::new());
        let (audit, _writer) =
            AuditRecorder::spawn(Arc::new(MemoryAuditLog::new()), AuditConfig::default());
        let supervisor = Supervisor::new(Adapters {
            metrics: samples.clone(),
            router: Arc::new(InMemoryRouter::new()),
            audit,
            clock: Arc::new(TokioClock::new()),
        });
        let app = build_router(ApiState {
            supervisor: supervisor.clone(),
            samples,
            default_policy: RolloutPolicy::default(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (ApiClient::new(addr.to_string()), supervisor)
    }

    fn request(service: &str) -> StartRolloutRequest {
        StartRolloutRequest {
            target: RolloutTarget::new(service, "v1", "v2"),
            policy: None,
        }
    }

    #[tokio::test]
    async fn start_status_abort_audit() {
        let (client, supervisor) = spawn_daemon().await;

        let started = client.start(&request("ranker")).await.unwrap();
        assert_eq!(client.status(&started.id).await.unwrap().id, started.id);
        assert_eq!(client.list().await.unwrap().len(), 1);

        client
            .abort(&started.id, Some("manual".into()))
            .await
            .unwrap();
        let done = supervisor.wait_terminal(&started.id).await.unwrap();
        assert_eq!(done.state, RolloutState::RolledBack);

        let trail = client.audit(&started.id).await;
        // Records are written asynchronously; the call itself must succeed.
        assert!(trail.is_ok());
    }

    #[tokio::test]
    async fn conflict_maps_to_exit_code_two() {
        let (client, _supervisor) = spawn_daemon().await;
        client.start(&request("ranker")).await.unwrap();

        let err = client.start(&request("ranker")).await.unwrap_err();
        assert!(matches!(err, ClientError::Conflict(_)), "{err}");
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn not_found_is_a_rejection() {
        let (client, _supervisor) = spawn_daemon().await;
        let err = client.status("missing").await.unwrap_err();
        assert!(
            matches!(err, ClientError::Rejected { status: StatusCode::NOT_FOUND, .. }),
            "{err}"
        );
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn rollout_ids_are_escaped_as_one_segment() {
        assert_eq!(rollout_path("r-1", ""), "/api/v1/rollouts/r-1");
        assert_eq!(
            rollout_path("a/b c", "/audit"),
            "/api/v1/rollouts/a%2Fb%20c/audit"
        );
    }

    #[tokio::test]
    async fn odd_ids_are_not_found_rather_than_transport_errors() {
        let (client, _supervisor) = spawn_daemon().await;
        for id in ["has space", "a/b", "50%", "q?x=1"] {
            let err = client.status(id).await.unwrap_err();
            assert!(
                matches!(err, ClientError::Rejected { status: StatusCode::NOT_FOUND, .. }),
                "{id}: {err}"
            );
            assert_eq!(err.exit_code(), 2);

            let err = client.abort(id, None).await.unwrap_err();
            assert_eq!(err.exit_code(), 2, "{id}: {err}");
            let err = client.audit(id).await.unwrap_err();
            assert_eq!(err.exit_code(), 2, "{id}: {err}");
        }
    }

    #[tokio::test]
    async fn unreachable_daemon_exits_one() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ApiClient::new(addr.to_string()).list().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)), "{err}");
        assert_eq!(err.exit_code(), 1);
    }
}
