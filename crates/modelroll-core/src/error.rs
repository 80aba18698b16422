//! Validation errors for rollout targets and policies.

use thiserror::Error;

use crate::types::MetricKind;

/// A malformed policy or target. Rejected at `start()`, never reaches a tick loop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyViolation {
    #[error("policy has no traffic steps")]
    EmptySteps,

    #[error("step {index} has weight {weight}, expected 1..=100")]
    StepOutOfRange { index: usize, weight: u8 },

    #[error("steps must strictly increase: step {index} ({next}%) follows {prev}%")]
    NonMonotonicSteps { index: usize, prev: u8, next: u8 },

    #[error("policy tracks no metric thresholds")]
    NoThresholds,

    #[error("threshold for {metric} must be a finite non-negative number, got {value}")]
    InvalidThreshold { metric: MetricKind, value: f64 },

    #[error("breach_limit must be at least 1")]
    ZeroBreachLimit,

    #[error("min_samples must be at least 1")]
    ZeroMinSamples,

    #[error("actuator max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("duration `{field}` must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("duration `{field}` must not exceed {max_hours}h")]
    DurationTooLong { field: &'static str, max_hours: u64 },

    #[error("`{field}` must not exceed the overall timeout")]
    ExceedsTimeout { field: &'static str },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("failed to parse policy: {0}")]
    Parse(String),
}
