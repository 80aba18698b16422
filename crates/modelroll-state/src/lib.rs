//! modelroll-state — embedded audit store for ModelRoll.
//!
//! Backed by [redb](https://docs.rs/redb), keeps the append-only audit
//! trail of every rollout and the final snapshot of finished rollouts.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Audit
//! keys are `{rollout_id}:{seq:020}`, so a prefix range scan returns a
//! rollout's trail in append order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult, StoreOp};
pub use store::StateStore;
