//! ModelRoll rollout engine — canary promotion with automatic rollback.
//!
//! This crate drives a candidate model version from a small traffic share
//! to 100% in policy-defined steps, evaluating health metrics between
//! steps and rolling back to the stable version when thresholds are
//! breached.
//!
//! # Components
//!
//! - **`adapters`** — Metric source and traffic router traits, in-memory doubles
//! - **`evaluator`** — Pure policy evaluation (aggregation, hysteresis, staleness)
//! - **`controller`** — Per-rollout state machine (begin, tick, advance, rollback)
//! - **`supervisor`** — Registry of active rollouts and their tick loops
//! - **`audit`** — Append-only audit trail with a non-blocking recorder
//! - **`retry`** — Bounded exponential backoff for actuator calls
//! - **`clock`** — Time sources

pub mod adapters;
pub mod audit;
pub mod clock;
pub mod controller;
pub mod error;
pub mod evaluator;
pub mod retry;
pub mod supervisor;

pub use adapters::{InMemoryMetrics, InMemoryRouter, MetricSource, TrafficRouter};
pub use audit::{AuditConfig, AuditError, AuditRecorder, AuditSink, MemoryAuditLog};
pub use clock::{Clock, ManualClock, TokioClock};
pub use controller::{Adapters, Command, RolloutExecution, RolloutMachine};
pub use error::{AdapterError, RolloutError};
pub use evaluator::{evaluate, BreachCounters, Evaluation, EvaluationInput, StaleData};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use supervisor::Supervisor;
