//! Adapter seams to the outside world: the metric source and the traffic router.
//!
//! Both are potentially blocking I/O. The controller bounds every call
//! with a timeout and treats an expired call like any other failure.
//! In-memory implementations back tests and the standalone daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use modelroll_core::{
    duration_ms, MetricKind, MetricSample, RolloutTarget, TimeRange, TrafficSplit,
};

use crate::clock::Clock;
use crate::error::AdapterError;

/// Source of health samples for a model version.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Samples for `model_version`/`metric` inside `range`, ordered by timestamp.
    async fn query(
        &self,
        model_version: &str,
        metric: MetricKind,
        range: TimeRange,
    ) -> Result<Vec<MetricSample>, AdapterError>;
}

/// Routing layer that splits traffic between stable and candidate versions.
///
/// Implementations must be idempotent on repeated identical calls.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    async fn set_weights(
        &self,
        target: &RolloutTarget,
        split: TrafficSplit,
    ) -> Result<(), AdapterError>;
}

// ── In-memory metric store ─────────────────────────────────────────

/// Push-based metric store. Samples are received (e.g. over the REST API)
/// and queried by the controller.
pub struct InMemoryMetrics {
    samples: Mutex<Vec<MetricSample>>,
    retention: Option<Retention>,
    unavailable: AtomicBool,
}

/// Samples older than `clock.now - window` are dropped on push.
struct Retention {
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            retention: None,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Store that forgets samples older than `window`, measured against
    /// `clock` so that future-dated samples cannot push real ones out.
    pub fn with_retention(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            retention: Some(Retention { window, clock }),
            ..Self::new()
        }
    }

    pub async fn push(&self, sample: MetricSample) {
        self.push_many(vec![sample]).await;
    }

    pub async fn push_many(&self, batch: Vec<MetricSample>) {
        let mut samples = self.samples.lock().await;
        samples.extend(batch);
        if let Some(retention) = &self.retention {
            let cutoff = retention
                .clock
                .now_ms()
                .saturating_sub(duration_ms(retention.window));
            samples.retain(|s| s.timestamp_ms >= cutoff);
        }
    }

    pub async fn len(&self) -> usize {
        self.samples.lock().await.len()
    }

    /// Simulate an outage: queries fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Default for InMemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for InMemoryMetrics {
    async fn query(
        &self,
        model_version: &str,
        metric: MetricKind,
        range: TimeRange,
    ) -> Result<Vec<MetricSample>, AdapterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable("metric store offline".into()));
        }
        let samples = self.samples.lock().await;
        let mut out: Vec<MetricSample> = samples
            .iter()
            .filter(|s| {
                s.model_version == model_version && s.metric == metric && range.contains(s.timestamp_ms)
            })
            .cloned()
            .collect();
        out.sort_by_key(|s| s.timestamp_ms);
        Ok(out)
    }
}

// ── In-memory traffic router ───────────────────────────────────────

/// Traffic router that keeps the applied split per service in memory.
///
/// Supports scripted failures and latency for exercising retry paths.
#[derive(Debug, Default)]
pub struct InMemoryRouter {
    applied: Mutex<HashMap<String, TrafficSplit>>,
    calls: Mutex<Vec<(String, TrafficSplit)>>,
    fail_next: AtomicU32,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().await = latency;
    }

    /// Split currently applied for a service.
    pub async fn applied(&self, service: &str) -> Option<TrafficSplit> {
        self.applied.lock().await.get(service).copied()
    }

    /// Every call received, including failed ones.
    pub async fn calls(&self) -> Vec<(String, TrafficSplit)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl TrafficRouter for InMemoryRouter {
    async fn set_weights(
        &self,
        target: &RolloutTarget,
        split: TrafficSplit,
    ) -> Result<(), AdapterError> {
        let latency = *self.latency.lock().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.calls
            .lock()
            .await
            .push((target.service.clone(), split));

        if !split.is_valid() {
            return Err(AdapterError::Rejected(format!(
                "weights {}/{} do not sum to 100",
                split.stable, split.candidate
            )));
        }

        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            debug!(service = %target.service, remaining = remaining - 1, "scripted router failure");
            return Err(AdapterError::Unavailable("router refused connection".into()));
        }

        self.applied
            .lock()
            .await
            .insert(target.service.clone(), split);
        info!(
            service = %target.service,
            stable = %target.stable_version,
            candidate = %target.candidate_version,
            stable_weight = split.stable,
            candidate_weight = split.candidate,
            "traffic split applied"
        );
        Ok(())
    }
}
