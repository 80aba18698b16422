//! Audit recorder — best-effort, append-only trail of every tick.
//!
//! The tick loop hands records to a bounded queue and moves on; a single
//! background worker writes them to the sink in order, retrying with
//! backoff. A write that keeps failing is logged and dropped. Audit is
//! never a gate on rollout progression.
//!
//! ```text
//! tick loop --record()--> [bounded mpsc] --> worker --retry--> AuditSink
//!                          (enqueue_timeout)        (write_timeout, max_attempts)
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use modelroll_core::duration::serde_str;
use modelroll_core::{AuditRecord, RolloutSnapshot};
use modelroll_state::StateStore;

use crate::retry::{retry_with_backoff, RetryPolicy};

/// Failure of an audit backend.
#[derive(Debug, Clone, Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),

    #[error("audit recorder has shut down")]
    Closed,
}

/// Durable destination for audit records and archived rollouts.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;

    async fn archive(&self, snapshot: &RolloutSnapshot) -> Result<(), AuditError>;

    /// Audit trail of one rollout, in append order.
    async fn history(&self, rollout_id: &str) -> Result<Vec<AuditRecord>, AuditError>;

    /// Archived final snapshot of a finished rollout.
    async fn archived(&self, rollout_id: &str) -> Result<Option<RolloutSnapshot>, AuditError>;

    /// Every archived snapshot.
    async fn archived_all(&self) -> Result<Vec<RolloutSnapshot>, AuditError>;
}

// ── Sinks ──────────────────────────────────────────────────────────

/// redb-backed sink. Store calls are blocking and run on the blocking pool.
#[async_trait]
impl AuditSink for StateStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let store = self.clone();
        let record = record.clone();
        blocking(move || store.append_audit(&record)).await
    }

    async fn archive(&self, snapshot: &RolloutSnapshot) -> Result<(), AuditError> {
        let store = self.clone();
        let snapshot = snapshot.clone();
        blocking(move || store.put_snapshot(&snapshot)).await
    }

    async fn history(&self, rollout_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let store = self.clone();
        let id = rollout_id.to_string();
        blocking(move || store.list_audit(&id)).await
    }

    async fn archived(&self, rollout_id: &str) -> Result<Option<RolloutSnapshot>, AuditError> {
        let store = self.clone();
        let id = rollout_id.to_string();
        blocking(move || store.get_snapshot(&id)).await
    }

    async fn archived_all(&self) -> Result<Vec<RolloutSnapshot>, AuditError> {
        let store = self.clone();
        blocking(move || store.list_snapshots()).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, AuditError>
where
    T: Send + 'static,
    F: FnOnce() -> modelroll_state::StateResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuditError::Storage(format!("audit task panicked: {e}")))?
        .map_err(|e| AuditError::Storage(e.to_string()))
}

/// In-memory sink with scriptable failures.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
    snapshots: Mutex<Vec<RolloutSnapshot>>,
    fail_next: AtomicU32,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` appends.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(AuditError::Storage("disk full".into()));
        }
        let mut records = self.records.lock().await;
        let duplicate = records
            .iter()
            .any(|r| r.rollout_id == record.rollout_id && r.seq == record.seq);
        if !duplicate {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn archive(&self, snapshot: &RolloutSnapshot) -> Result<(), AuditError> {
        let mut snapshots = self.snapshots.lock().await;
        snapshots.retain(|s| s.id != snapshot.id);
        snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn history(&self, rollout_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let mut out: Vec<AuditRecord> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.rollout_id == rollout_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.seq);
        Ok(out)
    }

    async fn archived(&self, rollout_id: &str) -> Result<Option<RolloutSnapshot>, AuditError> {
        Ok(self
            .snapshots
            .lock()
            .await
            .iter()
            .find(|s| s.id == rollout_id)
            .cloned())
    }

    async fn archived_all(&self) -> Result<Vec<RolloutSnapshot>, AuditError> {
        Ok(self.snapshots.lock().await.clone())
    }
}

// ── Recorder ───────────────────────────────────────────────────────

/// Queue and retry settings for the audit worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    pub queue_capacity: usize,
    /// Longest a tick may wait for queue space before the record is dropped.
    #[serde(with = "serde_str")]
    pub enqueue_timeout: Duration,
    #[serde(with = "serde_str")]
    pub write_timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "serde_str")]
    pub backoff_base: Duration,
    #[serde(with = "serde_str")]
    pub backoff_max: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_millis(250),
            write_timeout: Duration::from_secs(2),
            max_attempts: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl AuditConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            call_timeout: self.write_timeout,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        }
    }
}

enum AuditEntry {
    Record(Box<AuditRecord>),
    Archive(Box<RolloutSnapshot>),
    Flush(oneshot::Sender<()>),
}

/// Handle for submitting audit entries. Cheap to clone.
#[derive(Clone)]
pub struct AuditRecorder {
    tx: mpsc::Sender<AuditEntry>,
    sink: Arc<dyn AuditSink>,
    enqueue_timeout: Duration,
}

impl AuditRecorder {
    /// Start the background writer. The worker exits once every recorder
    /// clone has been dropped and the queue is drained.
    pub fn spawn(sink: Arc<dyn AuditSink>, config: AuditConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run_writer(Arc::clone(&sink), config.retry_policy(), rx));
        let recorder = Self {
            tx,
            sink,
            enqueue_timeout: config.enqueue_timeout,
        };
        (recorder, handle)
    }

    /// Queue a record. Waits at most `enqueue_timeout` for queue space.
    pub async fn record(&self, record: AuditRecord) {
        let key = record.table_key();
        if let Err(e) = self
            .tx
            .send_timeout(AuditEntry::Record(Box::new(record)), self.enqueue_timeout)
            .await
        {
            warn!(%key, error = %e, "audit queue unavailable, record dropped");
        }
    }

    /// Queue the final snapshot of a finished rollout.
    pub async fn archive(&self, snapshot: RolloutSnapshot) {
        let id = snapshot.id.clone();
        if let Err(e) = self
            .tx
            .send_timeout(AuditEntry::Archive(Box::new(snapshot)), self.enqueue_timeout)
            .await
        {
            warn!(rollout_id = %id, error = %e, "audit queue unavailable, archive dropped");
        }
    }

    /// Wait until everything queued before this call has been handled.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(AuditEntry::Flush(done_tx))
            .await
            .map_err(|_| AuditError::Closed)?;
        done_rx.await.map_err(|_| AuditError::Closed)
    }

    pub async fn history(&self, rollout_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        self.sink.history(rollout_id).await
    }

    pub async fn archived(&self, rollout_id: &str) -> Result<Option<RolloutSnapshot>, AuditError> {
        self.sink.archived(rollout_id).await
    }

    pub async fn archived_all(&self) -> Result<Vec<RolloutSnapshot>, AuditError> {
        self.sink.archived_all().await
    }
}

async fn run_writer(
    sink: Arc<dyn AuditSink>,
    retry: RetryPolicy,
    mut rx: mpsc::Receiver<AuditEntry>,
) {
    debug!("audit writer started");
    while let Some(entry) = rx.recv().await {
        match entry {
            AuditEntry::Record(record) => {
                let result =
                    retry_with_backoff(&retry, "audit append", || sink.append(&record)).await;
                if let Err(e) = result {
                    error!(key = %record.table_key(), error = %e, "audit record lost");
                }
            }
            AuditEntry::Archive(snapshot) => {
                let result =
                    retry_with_backoff(&retry, "audit archive", || sink.archive(&snapshot)).await;
                if let Err(e) = result {
                    error!(rollout_id = %snapshot.id, error = %e, "rollout archive lost");
                }
            }
            AuditEntry::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("audit writer stopped");
}
