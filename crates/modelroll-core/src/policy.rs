//! Rollout policy — traffic steps, dwell, thresholds, hysteresis, timeouts.
//!
//! A policy is loaded once per rollout and never changes while that
//! rollout runs. Unknown fields are rejected at load time.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::PolicyViolation;
use crate::types::MetricKind;

/// How consecutive breaches are counted across metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachCounting {
    /// One counter: any breaching metric increments it, a clean tick resets it.
    #[default]
    Combined,
    /// One counter per metric; any single metric reaching the limit rolls back.
    PerMetric,
}

/// Metric thresholds. Unset thresholds are not tracked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency_p95_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_error_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_drift_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_accuracy_proxy: Option<f64>,
}

/// Which side of a threshold is a breach.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdBound {
    Max(f64),
    Min(f64),
}

impl ThresholdBound {
    pub fn limit(&self) -> f64 {
        match self {
            ThresholdBound::Max(v) | ThresholdBound::Min(v) => *v,
        }
    }

    pub fn breached_by(&self, value: f64) -> bool {
        match self {
            ThresholdBound::Max(limit) => value > *limit,
            ThresholdBound::Min(limit) => value < *limit,
        }
    }
}

impl Thresholds {
    pub fn bound(&self, metric: MetricKind) -> Option<ThresholdBound> {
        match metric {
            MetricKind::LatencyP95Ms => self.max_latency_p95_ms.map(ThresholdBound::Max),
            MetricKind::ErrorRate => self.max_error_rate.map(ThresholdBound::Max),
            MetricKind::DriftScore => self.max_drift_score.map(ThresholdBound::Max),
            MetricKind::AccuracyProxy => self.min_accuracy_proxy.map(ThresholdBound::Min),
        }
    }

    /// Metrics with a threshold, in a stable order.
    pub fn tracked(&self) -> Vec<(MetricKind, ThresholdBound)> {
        MetricKind::ALL
            .iter()
            .filter_map(|m| self.bound(*m).map(|b| (*m, b)))
            .collect()
    }
}

/// Retry behaviour for traffic router calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActuatorPolicy {
    /// Per-call bound; an expired call counts as a failed attempt.
    #[serde(with = "serde_str")]
    pub call_timeout: Duration,
    /// Attempts per transition before the rollout is marked FAILED.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    #[serde(with = "serde_str")]
    pub backoff_base: Duration,
    #[serde(with = "serde_str")]
    pub backoff_max: Duration,
}

impl Default for ActuatorPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Configuration for one canary rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RolloutPolicy {
    /// Candidate traffic percentages, strictly increasing (e.g. 5, 25, 50, 100).
    pub steps: Vec<u8>,
    /// Minimum clean observation time per step before advancing.
    #[serde(with = "serde_str")]
    pub dwell: Duration,
    #[serde(default = "default_tick_interval", with = "serde_str")]
    pub tick_interval: Duration,
    /// Overall bound; exceeding it before STABLE forces a rollback.
    #[serde(with = "serde_str")]
    pub timeout: Duration,
    /// Samples older than this do not count as evidence.
    #[serde(default = "default_staleness", with = "serde_str")]
    pub staleness: Duration,
    /// Aggregation window for each evaluation.
    #[serde(default = "default_window", with = "serde_str")]
    pub window: Duration,
    /// Samples required per tracked metric inside the window.
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    /// Consecutive breaching ticks required before rolling back.
    pub breach_limit: u32,
    #[serde(default)]
    pub breach_counting: BreachCounting,
    pub thresholds: Thresholds,
    #[serde(default)]
    pub actuator: ActuatorPolicy,
    /// Per-call bound on metric source queries.
    #[serde(default = "default_metrics_timeout", with = "serde_str")]
    pub metrics_timeout: Duration,
}

/// Upper bound for every policy duration.
pub const MAX_POLICY_DURATION: Duration = Duration::from_secs(30 * 24 * 3600);

fn default_tick_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_staleness() -> Duration {
    Duration::from_secs(120)
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_min_samples() -> u32 {
    1
}

fn default_metrics_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            steps: vec![5, 25, 50, 100],
            dwell: Duration::from_secs(300),
            tick_interval: default_tick_interval(),
            timeout: Duration::from_secs(2 * 3600),
            staleness: default_staleness(),
            window: default_window(),
            min_samples: default_min_samples(),
            breach_limit: 3,
            breach_counting: BreachCounting::Combined,
            thresholds: Thresholds {
                max_latency_p95_ms: Some(250.0),
                max_error_rate: Some(0.02),
                max_drift_score: Some(0.3),
                min_accuracy_proxy: None,
            },
            actuator: ActuatorPolicy::default(),
            metrics_timeout: default_metrics_timeout(),
        }
    }
}

impl RolloutPolicy {
    pub fn from_toml_str(s: &str) -> Result<Self, PolicyViolation> {
        let policy: RolloutPolicy =
            toml::from_str(s).map_err(|e| PolicyViolation::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_json_str(s: &str) -> Result<Self, PolicyViolation> {
        let policy: RolloutPolicy =
            serde_json::from_str(s).map_err(|e| PolicyViolation::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load a policy file; `.json` is parsed as JSON, anything else as TOML.
    pub fn from_file(path: &Path) -> Result<Self, PolicyViolation> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PolicyViolation::Parse(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn validate(&self) -> Result<(), PolicyViolation> {
        if self.steps.is_empty() {
            return Err(PolicyViolation::EmptySteps);
        }
        for (index, &weight) in self.steps.iter().enumerate() {
            if weight == 0 || weight > 100 {
                return Err(PolicyViolation::StepOutOfRange { index, weight });
            }
            if index > 0 && weight <= self.steps[index - 1] {
                return Err(PolicyViolation::NonMonotonicSteps {
                    index,
                    prev: self.steps[index - 1],
                    next: weight,
                });
            }
        }

        let tracked = self.thresholds.tracked();
        if tracked.is_empty() {
            return Err(PolicyViolation::NoThresholds);
        }
        for (metric, bound) in tracked {
            let value = bound.limit();
            if !value.is_finite() || value < 0.0 {
                return Err(PolicyViolation::InvalidThreshold { metric, value });
            }
        }

        if self.breach_limit == 0 {
            return Err(PolicyViolation::ZeroBreachLimit);
        }
        if self.min_samples == 0 {
            return Err(PolicyViolation::ZeroMinSamples);
        }
        if self.actuator.max_attempts == 0 {
            return Err(PolicyViolation::ZeroAttempts);
        }

        for (field, d) in [
            ("dwell", self.dwell),
            ("tick_interval", self.tick_interval),
            ("timeout", self.timeout),
            ("staleness", self.staleness),
            ("window", self.window),
            ("metrics_timeout", self.metrics_timeout),
            ("actuator.call_timeout", self.actuator.call_timeout),
        ] {
            if d.is_zero() {
                return Err(PolicyViolation::ZeroDuration { field });
            }
        }
        for (field, d) in [
            ("dwell", self.dwell),
            ("tick_interval", self.tick_interval),
            ("timeout", self.timeout),
            ("metrics_timeout", self.metrics_timeout),
            ("actuator.call_timeout", self.actuator.call_timeout),
            ("actuator.backoff_max", self.actuator.backoff_max),
        ] {
            if d > MAX_POLICY_DURATION {
                return Err(PolicyViolation::DurationTooLong {
                    field,
                    max_hours: MAX_POLICY_DURATION.as_secs() / 3600,
                });
            }
        }
        for (field, d) in [
            ("tick_interval", self.tick_interval),
            ("staleness", self.staleness),
            ("window", self.window),
        ] {
            if d > self.timeout {
                return Err(PolicyViolation::ExceedsTimeout { field });
            }
        }
        Ok(())
    }

    /// Candidate weight at a step index.
    pub fn weight_at(&self, step_index: usize) -> u8 {
        self.steps.get(step_index).copied().unwrap_or(0)
    }

    pub fn last_step(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
steps = [5, 25, 50, 100]
dwell = "60s"
tick_interval = "15s"
timeout = "1h"
staleness = "2m"
breach_limit = 3
breach_counting = "per_metric"

[thresholds]
max_latency_p95_ms = 250.0
max_error_rate = 0.01

[actuator]
max_attempts = 4
"#;

    #[test]
    fn default_policy_is_valid() {
        assert!(RolloutPolicy::default().validate().is_ok());
    }

    #[test]
    fn parses_toml_with_defaults() {
        let policy = RolloutPolicy::from_toml_str(SAMPLE).unwrap();
        assert_eq!(policy.steps, vec![5, 25, 50, 100]);
        assert_eq!(policy.dwell, Duration::from_secs(60));
        assert_eq!(policy.tick_interval, Duration::from_secs(15));
        assert_eq!(policy.timeout, Duration::from_secs(3600));
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.min_samples, 1);
        assert_eq!(policy.breach_counting, BreachCounting::PerMetric);
        assert_eq!(policy.actuator.max_attempts, 4);
        assert_eq!(policy.actuator.call_timeout, Duration::from_secs(5));
        assert_eq!(policy.thresholds.tracked().len(), 2);
    }

    #[test]
    fn rejects_unknown_fields() {
        let toml = SAMPLE.replace("breach_limit = 3", "breach_limit = 3\nsurprise = true");
        assert!(matches!(
            RolloutPolicy::from_toml_str(&toml),
            Err(PolicyViolation::Parse(_))
        ));

        let toml = SAMPLE.replace("max_error_rate", "max_cpu");
        assert!(matches!(
            RolloutPolicy::from_toml_str(&toml),
            Err(PolicyViolation::Parse(_))
        ));
    }

    #[test]
    fn rejects_non_monotonic_steps() {
        let policy = RolloutPolicy {
            steps: vec![5, 50, 25, 100],
            ..Default::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyViolation::NonMonotonicSteps {
                index: 2,
                prev: 50,
                next: 25
            })
        );

        let policy = RolloutPolicy {
            steps: vec![10, 10],
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyViolation::NonMonotonicSteps { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_and_empty_steps() {
        let policy = RolloutPolicy {
            steps: vec![0, 50],
            ..Default::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyViolation::StepOutOfRange { index: 0, weight: 0 })
        );

        let policy = RolloutPolicy {
            steps: vec![50, 101],
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyViolation::StepOutOfRange { index: 1, .. })
        ));

        let policy = RolloutPolicy {
            steps: vec![],
            ..Default::default()
        };
        assert_eq!(policy.validate(), Err(PolicyViolation::EmptySteps));
    }

    #[test]
    fn rejects_missing_thresholds_and_zero_limits() {
        let policy = RolloutPolicy {
            thresholds: Thresholds::default(),
            ..Default::default()
        };
        assert_eq!(policy.validate(), Err(PolicyViolation::NoThresholds));

        let policy = RolloutPolicy {
            breach_limit: 0,
            ..Default::default()
        };
        assert_eq!(policy.validate(), Err(PolicyViolation::ZeroBreachLimit));

        let policy = RolloutPolicy {
            dwell: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyViolation::ZeroDuration { field: "dwell" })
        );
    }

    #[test]
    fn rejects_unbounded_durations() {
        let policy = RolloutPolicy {
            tick_interval: Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyViolation::DurationTooLong {
                field: "tick_interval",
                max_hours: 720
            })
        );

        let policy = RolloutPolicy {
            timeout: Duration::from_secs(31 * 24 * 3600),
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyViolation::DurationTooLong { field: "timeout", .. })
        ));
    }

    #[test]
    fn tick_interval_must_fit_in_timeout() {
        let policy = RolloutPolicy {
            tick_interval: Duration::from_secs(3 * 3600),
            ..Default::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyViolation::ExceedsTimeout {
                field: "tick_interval"
            })
        );
    }

    #[test]
    fn rejects_negative_threshold() {
        let policy = RolloutPolicy {
            thresholds: Thresholds {
                max_error_rate: Some(-0.1),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyViolation::InvalidThreshold {
                metric: MetricKind::ErrorRate,
                ..
            })
        ));
    }

    #[test]
    fn json_roundtrip_keeps_duration_strings() {
        let policy = RolloutPolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"dwell\":\"5m\""));
        let back = RolloutPolicy::from_json_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn accuracy_is_a_lower_bound() {
        let bound = ThresholdBound::Min(0.9);
        assert!(bound.breached_by(0.85));
        assert!(!bound.breached_by(0.95));
        let bound = ThresholdBound::Max(250.0);
        assert!(bound.breached_by(251.0));
        assert!(!bound.breached_by(250.0));
    }
}
