//! redb table definitions for the ModelRoll state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Audit records keyed by `{rollout_id}:{seq:020}`.
pub const AUDIT: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");

/// Final snapshots of finished rollouts keyed by `{rollout_id}`.
pub const ARCHIVE: TableDefinition<&str, &[u8]> = TableDefinition::new("archive");
