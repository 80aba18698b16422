//! `modelrolld serve` — assembles the controller and serves the API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use modelroll_api::{build_router, ApiState};
use modelroll_core::format_duration;
use modelroll_rollout::{
    Adapters, AuditRecorder, InMemoryMetrics, InMemoryRouter, Supervisor, TokioClock,
    TrafficRouter,
};
use modelroll_state::StateStore;

use crate::config::{DaemonConfig, RouterKind};
use crate::router::HttpTrafficRouter;

pub async fn run_serve(config: DaemonConfig) -> anyhow::Result<()> {
    info!("ModelRoll daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.server.data_dir)
        .with_context(|| format!("creating {}", config.server.data_dir.display()))?;
    let db_path = config.server.data_dir.join("modelroll.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let (audit, audit_handle) = AuditRecorder::spawn(Arc::new(store), config.audit.clone());
    info!(
        queue_capacity = config.audit.queue_capacity,
        "audit recorder started"
    );

    let clock = Arc::new(TokioClock::new());
    let samples = Arc::new(InMemoryMetrics::with_retention(
        config.server.sample_retention,
        clock.clone(),
    ));
    info!(
        retention = %format_duration(config.server.sample_retention),
        "metric store initialized"
    );

    let router: Arc<dyn TrafficRouter> = match config.router.kind {
        RouterKind::Memory => {
            info!("using in-memory traffic router");
            Arc::new(InMemoryRouter::new())
        }
        RouterKind::Http => {
            let endpoint = config.router.endpoint.as_deref().unwrap_or_default();
            info!(%endpoint, "using HTTP traffic router");
            Arc::new(HttpTrafficRouter::new(endpoint, config.router.timeout)?)
        }
    };

    let supervisor = Supervisor::new(Adapters {
        metrics: samples.clone(),
        router,
        audit,
        clock,
    });
    info!("supervisor initialized");

    // ── Start API server ───────────────────────────────────────

    let app = build_router(ApiState {
        supervisor: supervisor.clone(),
        samples,
        default_policy: config.policy.clone(),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    // Halt live rollouts as FAILED and archive them.
    supervisor.shutdown().await;
    drop(supervisor);
    match tokio::time::timeout(Duration::from_secs(5), audit_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "audit writer ended abnormally"),
        Err(_) => warn!("audit writer still busy at exit"),
    }

    info!("ModelRoll daemon stopped");
    Ok(())
}
