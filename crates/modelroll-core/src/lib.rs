//! modelroll-core — shared data model for the ModelRoll canary controller.
//!
//! Everything that crosses a crate boundary lives here: rollout targets,
//! the validated rollout policy, metric samples, decisions, rollout
//! snapshots and audit records. All types are serde-serializable so the
//! state store, the REST API and the CLI speak the same JSON.

pub mod duration;
pub mod error;
pub mod policy;
pub mod types;

pub use duration::{duration_ms, format_duration, parse_duration};
pub use error::PolicyViolation;
pub use policy::{ActuatorPolicy, BreachCounting, RolloutPolicy, ThresholdBound, Thresholds};
pub use types::*;
