//! StateStore — redb-backed persistence for the audit trail.
//!
//! Provides append/query operations over audit records and the archive of
//! finished rollouts. The store supports both on-disk and in-memory
//! backends (the latter for testing and standalone demos).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use modelroll_core::{AuditRecord, RolloutSnapshot};

use crate::error::{StateError, StateResult, StoreOp};
use crate::tables::*;

/// Closure mapping a redb or serde error into the matching `StateError`.
macro_rules! map_err {
    (Open) => {
        |e| StateError::Open(e.to_string())
    };
    (Encode) => {
        |e| StateError::Encode(e.to_string())
    };
    (Corrupt) => {
        |e| StateError::Corrupt(e.to_string())
    };
    ($op:ident) => {
        |e| StateError::Storage {
            op: StoreOp::$op,
            detail: e.to_string(),
        }
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(AUDIT).map_err(map_err!(Table))?;
        txn.open_table(ARCHIVE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Audit ──────────────────────────────────────────────────────

    /// Append an audit record.
    ///
    /// Writing the same `(rollout_id, seq)` twice overwrites the entry, so a
    /// retried append after an ambiguous failure does not duplicate it.
    pub fn append_audit(&self, record: &AuditRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "audit record stored");
        Ok(())
    }

    /// All audit records for a rollout, in append order.
    pub fn list_audit(&self, rollout_id: &str) -> StateResult<Vec<AuditRecord>> {
        let prefix = format!("{rollout_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let record: AuditRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Corrupt))?;
            results.push(record);
        }
        Ok(results)
    }

    // ── Archive ────────────────────────────────────────────────────

    /// Store the final snapshot of a finished rollout.
    pub fn put_snapshot(&self, snapshot: &RolloutSnapshot) -> StateResult<()> {
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ARCHIVE).map_err(map_err!(Table))?;
            table
                .insert(snapshot.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout_id = %snapshot.id, state = %snapshot.state, "rollout archived");
        Ok(())
    }

    /// Get an archived rollout by id.
    pub fn get_snapshot(&self, rollout_id: &str) -> StateResult<Option<RolloutSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ARCHIVE).map_err(map_err!(Table))?;
        match table.get(rollout_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: RolloutSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Corrupt))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// List all archived rollouts.
    pub fn list_snapshots(&self) -> StateResult<Vec<RolloutSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ARCHIVE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: RolloutSnapshot =
                serde_json::from_slice(value.value()).map_err(map_err!(Corrupt))?;
            results.push(snapshot);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelroll_core::*;

    fn test_record(rollout_id: &str, seq: u64, to: RolloutState) -> AuditRecord {
        AuditRecord {
            rollout_id: rollout_id.to_string(),
            seq,
            timestamp_ms: 1_000 + seq,
            from_state: RolloutState::Canarying,
            to_state: to,
            candidate_weight: 5,
            decision: Decision::new(Verdict::Continue, "within thresholds", 1_000 + seq),
            metrics: MetricSnapshot::new(),
        }
    }

    fn test_snapshot(id: &str, state: RolloutState) -> RolloutSnapshot {
        RolloutSnapshot {
            id: id.to_string(),
            target: RolloutTarget::new("ranker", "v1", "v2"),
            policy: RolloutPolicy::default(),
            state,
            step_index: 0,
            candidate_weight: 0,
            consecutive_breaches: 0,
            idle_ticks: 0,
            started_at_ms: 1_000,
            last_transition_at_ms: 2_000,
            decisions: vec![Decision::new(Verdict::Rollback, "aborted", 2_000)],
            result: Some(TerminalResult {
                state,
                reason: "aborted".to_string(),
                finished_at_ms: 2_000,
            }),
        }
    }

    #[test]
    fn audit_append_and_list_in_order() {
        let store = StateStore::open_in_memory().unwrap();
        // Insert out of order; keys sort by sequence.
        for seq in [2, 0, 11, 1] {
            store
                .append_audit(&test_record("r1", seq, RolloutState::Canarying))
                .unwrap();
        }

        let records = store.list_audit("r1").unwrap();
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 11]);
    }

    #[test]
    fn audit_is_scoped_per_rollout() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_audit(&test_record("r1", 0, RolloutState::Canarying))
            .unwrap();
        store
            .append_audit(&test_record("r10", 0, RolloutState::Canarying))
            .unwrap();
        store
            .append_audit(&test_record("r2", 0, RolloutState::Canarying))
            .unwrap();

        assert_eq!(store.list_audit("r1").unwrap().len(), 1);
        assert_eq!(store.list_audit("r10").unwrap().len(), 1);
        assert!(store.list_audit("r3").unwrap().is_empty());
    }

    #[test]
    fn audit_reappend_same_seq_does_not_duplicate() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = test_record("r1", 4, RolloutState::RollingBack);
        store.append_audit(&rec).unwrap();
        store.append_audit(&rec).unwrap();

        let records = store.list_audit("r1").unwrap();
        assert_eq!(records, vec![rec]);
    }

    #[test]
    fn snapshot_put_get_list() {
        let store = StateStore::open_in_memory().unwrap();
        let snap = test_snapshot("r1", RolloutState::RolledBack);
        store.put_snapshot(&snap).unwrap();
        store
            .put_snapshot(&test_snapshot("r2", RolloutState::Stable))
            .unwrap();

        assert_eq!(store.get_snapshot("r1").unwrap(), Some(snap));
        assert!(store.get_snapshot("nope").unwrap().is_none());
        assert_eq!(store.list_snapshots().unwrap().len(), 2);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modelroll.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store
                .append_audit(&test_record("r1", 0, RolloutState::Stable))
                .unwrap();
            store
                .put_snapshot(&test_snapshot("r1", RolloutState::Stable))
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_audit("r1").unwrap().len(), 1);
        assert!(store.get_snapshot("r1").unwrap().is_some());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_audit("r1").unwrap().is_empty());
        assert!(store.list_snapshots().unwrap().is_empty());
    }
}
