//! Domain types shared by the controller, the state store and the API.
//!
//! Timestamps are Unix epoch milliseconds (`u64`) throughout.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PolicyViolation;
use crate::policy::RolloutPolicy;

/// Unique identifier for a rollout.
pub type RolloutId = String;

// ── Target ─────────────────────────────────────────────────────────

/// A service plus the stable and candidate model versions being rolled.
///
/// Immutable once a rollout starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct RolloutTarget {
    pub service: String,
    pub stable_version: String,
    pub candidate_version: String,
}

impl RolloutTarget {
    pub fn new(service: &str, stable_version: &str, candidate_version: &str) -> Self {
        Self {
            service: service.to_string(),
            stable_version: stable_version.to_string(),
            candidate_version: candidate_version.to_string(),
        }
    }

    /// Registry key. The routing layer splits traffic per service, so at
    /// most one rollout may be active per service.
    pub fn registry_key(&self) -> &str {
        &self.service
    }

    pub fn validate(&self) -> Result<(), PolicyViolation> {
        if self.service.trim().is_empty() {
            return Err(PolicyViolation::InvalidTarget("service is empty".into()));
        }
        if self.stable_version.trim().is_empty() || self.candidate_version.trim().is_empty() {
            return Err(PolicyViolation::InvalidTarget(
                "model versions must be non-empty".into(),
            ));
        }
        if self.stable_version == self.candidate_version {
            return Err(PolicyViolation::InvalidTarget(format!(
                "candidate `{}` is already the stable version",
                self.candidate_version
            )));
        }
        Ok(())
    }
}

impl fmt::Display for RolloutTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} -> {})",
            self.service, self.stable_version, self.candidate_version
        )
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// The closed set of metrics a policy can put thresholds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// p95 request latency in milliseconds.
    LatencyP95Ms,
    /// Fraction of failed requests (0.0-1.0).
    ErrorRate,
    /// Distribution drift against the reference baseline.
    DriftScore,
    /// Online accuracy proxy (higher is better).
    AccuracyProxy,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::LatencyP95Ms,
        MetricKind::ErrorRate,
        MetricKind::DriftScore,
        MetricKind::AccuracyProxy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::LatencyP95Ms => "latency_p95_ms",
            MetricKind::ErrorRate => "error_rate",
            MetricKind::DriftScore => "drift_score",
            MetricKind::AccuracyProxy => "accuracy_proxy",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One time-stamped health observation for a model version.
///
/// Produced externally and never mutated by the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub timestamp_ms: u64,
    pub model_version: String,
    pub metric: MetricKind,
    pub value: f64,
}

impl MetricSample {
    pub fn new(timestamp_ms: u64, model_version: &str, metric: MetricKind, value: f64) -> Self {
        Self {
            timestamp_ms,
            model_version: model_version.to_string(),
            metric,
            value,
        }
    }
}

/// Half-open time range `[start_ms, end_ms]` used for metric queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeRange {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn contains(&self, ts: u64) -> bool {
        ts >= self.start_ms && ts <= self.end_ms
    }
}

/// Aggregate of one metric over an evaluation window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricAggregate {
    pub value: f64,
    pub samples: usize,
    pub breached: bool,
}

/// Per-metric aggregates captured alongside a decision.
pub type MetricSnapshot = BTreeMap<MetricKind, MetricAggregate>;

// ── Traffic ────────────────────────────────────────────────────────

/// Weight split between the stable and candidate versions. Sums to 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub stable: u8,
    pub candidate: u8,
}

impl TrafficSplit {
    /// All traffic on the stable version.
    pub const ALL_STABLE: TrafficSplit = TrafficSplit {
        stable: 100,
        candidate: 0,
    };

    /// All traffic on the candidate version.
    pub const ALL_CANDIDATE: TrafficSplit = TrafficSplit {
        stable: 0,
        candidate: 100,
    };

    /// Split giving the candidate `weight` percent (clamped to 100).
    pub fn candidate(weight: u8) -> Self {
        let candidate = weight.min(100);
        Self {
            stable: 100 - candidate,
            candidate,
        }
    }

    pub fn is_valid(&self) -> bool {
        u16::from(self.stable) + u16::from(self.candidate) == 100
    }
}

// ── Decisions ──────────────────────────────────────────────────────

/// Outcome of one evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Stay at the current step.
    Continue,
    /// Move to the next step, or finish if this was the last one.
    Advance,
    /// Send all traffic back to the stable version.
    Rollback,
    /// Not enough fresh evidence; stay put without an actuator call.
    Hold,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Continue => "CONTINUE",
            Verdict::Advance => "ADVANCE",
            Verdict::Rollback => "ROLLBACK",
            Verdict::Hold => "HOLD",
        })
    }
}

/// A verdict plus the reasoning and evidence that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: String,
    pub evaluated_at_ms: u64,
    #[serde(default)]
    pub samples: Vec<MetricSample>,
}

impl Decision {
    pub fn new(verdict: Verdict, reason: impl Into<String>, evaluated_at_ms: u64) -> Self {
        Self {
            verdict,
            reason: reason.into(),
            evaluated_at_ms,
            samples: Vec::new(),
        }
    }

    pub fn with_samples(mut self, samples: Vec<MetricSample>) -> Self {
        self.samples = samples;
        self
    }
}

// ── Rollout lifecycle ──────────────────────────────────────────────

/// Lifecycle state of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutState {
    Pending,
    /// Candidate at the first step.
    Canarying,
    /// Candidate at a later step.
    Advancing,
    RollingBack,
    RolledBack,
    Stable,
    Failed,
}

impl RolloutState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutState::Stable | RolloutState::RolledBack | RolloutState::Failed
        )
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RolloutState::Pending => "PENDING",
            RolloutState::Canarying => "CANARYING",
            RolloutState::Advancing => "ADVANCING",
            RolloutState::RollingBack => "ROLLING_BACK",
            RolloutState::RolledBack => "ROLLED_BACK",
            RolloutState::Stable => "STABLE",
            RolloutState::Failed => "FAILED",
        })
    }
}

/// How a rollout ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminalResult {
    pub state: RolloutState,
    pub reason: String,
    pub finished_at_ms: u64,
}

/// Read-only copy of a rollout execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutSnapshot {
    pub id: RolloutId,
    pub target: RolloutTarget,
    pub policy: RolloutPolicy,
    pub state: RolloutState,
    pub step_index: usize,
    /// Candidate weight last confirmed by the traffic router.
    pub candidate_weight: u8,
    pub consecutive_breaches: u32,
    /// Ticks that ended in CONTINUE or HOLD.
    #[serde(default)]
    pub idle_ticks: u64,
    pub started_at_ms: u64,
    pub last_transition_at_ms: u64,
    pub decisions: Vec<Decision>,
    pub result: Option<TerminalResult>,
}

impl RolloutSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of recorded decisions with the given verdict.
    pub fn count_verdicts(&self, verdict: Verdict) -> usize {
        self.decisions.iter().filter(|d| d.verdict == verdict).count()
    }
}

// ── Audit ──────────────────────────────────────────────────────────

/// One entry of the append-only audit trail.
///
/// `seq` is assigned by the rollout's own tick loop and gives a total
/// order per rollout id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub rollout_id: RolloutId,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub from_state: RolloutState,
    pub to_state: RolloutState,
    pub candidate_weight: u8,
    pub decision: Decision,
    #[serde(default)]
    pub metrics: MetricSnapshot,
}

impl AuditRecord {
    /// Storage key: `{rollout_id}:{seq}` with a zero-padded sequence so
    /// lexicographic order equals append order.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.rollout_id, self.seq)
    }

    pub fn is_transition(&self) -> bool {
        self.from_state != self.to_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_split_sums_to_hundred() {
        for w in [0u8, 5, 25, 50, 100] {
            let split = TrafficSplit::candidate(w);
            assert!(split.is_valid());
            assert_eq!(split.candidate, w);
        }
        assert_eq!(TrafficSplit::candidate(150), TrafficSplit::ALL_CANDIDATE);
    }

    #[test]
    fn terminal_states() {
        assert!(RolloutState::Stable.is_terminal());
        assert!(RolloutState::RolledBack.is_terminal());
        assert!(RolloutState::Failed.is_terminal());
        assert!(!RolloutState::RollingBack.is_terminal());
        assert!(!RolloutState::Pending.is_terminal());
    }

    #[test]
    fn target_rejects_same_versions() {
        let target = RolloutTarget::new("ranker", "v3", "v3");
        assert!(matches!(
            target.validate(),
            Err(PolicyViolation::InvalidTarget(_))
        ));
        assert!(RolloutTarget::new("ranker", "v3", "v4").validate().is_ok());
    }

    #[test]
    fn audit_keys_sort_by_sequence() {
        let decision = Decision::new(Verdict::Hold, "no data", 0);
        let rec = |seq| AuditRecord {
            rollout_id: "r1".into(),
            seq,
            timestamp_ms: 0,
            from_state: RolloutState::Canarying,
            to_state: RolloutState::Canarying,
            candidate_weight: 5,
            decision: decision.clone(),
            metrics: MetricSnapshot::new(),
        };
        assert!(rec(9).table_key() < rec(10).table_key());
    }

    #[test]
    fn verdict_and_state_serialize_upper_case() {
        assert_eq!(serde_json::to_string(&Verdict::Rollback).unwrap(), "\"ROLLBACK\"");
        assert_eq!(
            serde_json::to_string(&RolloutState::RolledBack).unwrap(),
            "\"ROLLED_BACK\""
        );
        assert_eq!(
            serde_json::to_string(&MetricKind::LatencyP95Ms).unwrap(),
            "\"latency_p95_ms\""
        );
    }
}
