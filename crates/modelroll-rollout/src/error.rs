//! Error taxonomy for the rollout controller.

use modelroll_core::{PolicyViolation, RolloutId};
use thiserror::Error;

/// Failure of a metric source or traffic router call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    /// The call exceeded its per-call bound.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Errors surfaced by the supervisor's control surface.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// Another rollout is already active for this service.
    #[error("rollout {active} is already active for service `{service}`")]
    Conflict { service: String, active: RolloutId },

    #[error("policy violation: {0}")]
    PolicyViolation(#[from] PolicyViolation),

    #[error("rollout not found: {0}")]
    NotFound(RolloutId),

    #[error("internal error: {0}")]
    Internal(String),
}
