//! Rollout supervisor — registry of active rollouts and their tick loops.
//!
//! Every started rollout gets its own background task that owns the
//! [`RolloutMachine`]. The supervisor only keeps a command sender and a
//! `watch` receiver of the latest snapshot per rollout, so `status` never
//! touches live state and `abort` never mutates it directly.
//!
//! At most one rollout is active per service. Starts are checked and
//! registered under a single registry lock; a conflicting start fails
//! instead of queueing.
//!
//! A rollout leaves the registry only in a terminal state. Shutdown halts
//! live loops as FAILED, and a loop that dies is marked FAILED by the task
//! watching it, so no service stays locked by a rollout nobody drives.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use modelroll_core::{
    format_duration, AuditRecord, Decision, MetricSnapshot, RolloutId, RolloutPolicy,
    RolloutSnapshot, RolloutState, RolloutTarget, TerminalResult, Verdict,
};

use crate::controller::{Adapters, Command, RolloutMachine};
use crate::error::RolloutError;

/// Commands buffered per rollout. Aborts beyond this collapse into the
/// ones already queued.
const COMMAND_QUEUE: usize = 16;

/// Per-rollout registry slot.
struct RolloutSlot {
    id: RolloutId,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<RolloutSnapshot>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    /// service → active rollout.
    active: HashMap<String, RolloutSlot>,
    /// rollout id → service, for active rollouts.
    services: HashMap<RolloutId, String>,
    /// Final snapshots of rollouts that reached a terminal state.
    finished: HashMap<RolloutId, RolloutSnapshot>,
}

impl Registry {
    fn slot(&self, rollout_id: &str) -> Option<&RolloutSlot> {
        self.services
            .get(rollout_id)
            .and_then(|service| self.active.get(service))
    }
}

struct Inner {
    adapters: Adapters,
    registry: Mutex<Registry>,
}

/// Control surface over all rollouts in this process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(adapters: Adapters) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapters,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Validate and start a rollout. Returns its initial snapshot.
    pub async fn start(
        &self,
        target: RolloutTarget,
        policy: RolloutPolicy,
    ) -> Result<RolloutSnapshot, RolloutError> {
        target.validate()?;
        policy.validate()?;

        let mut registry = self.inner.registry.lock().await;
        if let Some(slot) = registry.active.get(target.registry_key()) {
            warn!(
                service = %target.service,
                active = %slot.id,
                "rejected start: rollout already active"
            );
            return Err(RolloutError::Conflict {
                service: target.service.clone(),
                active: slot.id.clone(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let service = target.registry_key().to_string();
        let machine = RolloutMachine::new(
            id.clone(),
            target,
            policy,
            self.inner.adapters.clone(),
        );
        let initial = machine.snapshot();

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshot_tx, snapshot_rx) = watch::channel(initial.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::downgrade(&self.inner);
        let mut last_seen = snapshot_tx.subscribe();
        let handle = tokio::spawn(async move {
            let tick_loop = tokio::spawn(run_rollout(
                machine,
                commands_rx,
                snapshot_tx,
                shutdown_rx,
                inner.clone(),
            ));
            if let Err(e) = tick_loop.await {
                let snapshot = last_seen.borrow_and_update().clone();
                loop_crashed(&inner, snapshot, e).await;
            }
        });

        registry.services.insert(id.clone(), service.clone());
        registry.active.insert(
            service.clone(),
            RolloutSlot {
                id: id.clone(),
                commands: commands_tx,
                snapshot: snapshot_rx,
                shutdown_tx,
                handle: Some(handle),
            },
        );

        info!(rollout_id = %id, %service, "rollout registered");
        Ok(initial)
    }

    /// Request a rollback. Observed by the rollout's next tick.
    ///
    /// Aborting a finished rollout is a no-op and returns its final snapshot.
    pub async fn abort(&self, rollout_id: &str, reason: &str) -> Result<RolloutSnapshot, RolloutError> {
        {
            let registry = self.inner.registry.lock().await;
            if let Some(slot) = registry.slot(rollout_id) {
                let command = Command::Abort {
                    reason: reason.to_string(),
                };
                match slot.commands.try_send(command) {
                    Ok(()) => info!(%rollout_id, %reason, "abort requested"),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(%rollout_id, "command queue full, abort already pending")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(%rollout_id, "rollout loop already finished")
                    }
                }
                return Ok(slot.snapshot.borrow().clone());
            }
            if let Some(snapshot) = registry.finished.get(rollout_id) {
                debug!(%rollout_id, state = %snapshot.state, "abort on finished rollout ignored");
                return Ok(snapshot.clone());
            }
        }
        self.archived(rollout_id).await
    }

    /// Read-only snapshot of a rollout, active or finished.
    pub async fn status(&self, rollout_id: &str) -> Result<RolloutSnapshot, RolloutError> {
        {
            let registry = self.inner.registry.lock().await;
            if let Some(slot) = registry.slot(rollout_id) {
                return Ok(slot.snapshot.borrow().clone());
            }
            if let Some(snapshot) = registry.finished.get(rollout_id) {
                return Ok(snapshot.clone());
            }
        }
        self.archived(rollout_id).await
    }

    /// Snapshots of every known rollout, oldest first: live ones plus
    /// everything in the archive, including previous runs of the daemon.
    pub async fn list(&self) -> Vec<RolloutSnapshot> {
        let mut by_id: HashMap<RolloutId, RolloutSnapshot> =
            match self.inner.adapters.audit.archived_all().await {
                Ok(archived) => archived.into_iter().map(|s| (s.id.clone(), s)).collect(),
                Err(e) => {
                    warn!(error = %e, "archive unavailable, listing in-memory rollouts only");
                    HashMap::new()
                }
            };

        {
            let registry = self.inner.registry.lock().await;
            let live = registry
                .active
                .values()
                .map(|slot| slot.snapshot.borrow().clone())
                .chain(registry.finished.values().cloned());
            for snapshot in live {
                by_id.insert(snapshot.id.clone(), snapshot);
            }
        }

        let mut out: Vec<RolloutSnapshot> = by_id.into_values().collect();
        out.sort_by(|a, b| a.started_at_ms.cmp(&b.started_at_ms).then(a.id.cmp(&b.id)));
        out
    }

    /// Ordered audit trail of a rollout.
    pub async fn audit(&self, rollout_id: &str) -> Result<Vec<AuditRecord>, RolloutError> {
        // Unknown ids are reported as such rather than as an empty trail.
        self.status(rollout_id).await?;
        self.inner
            .adapters
            .audit
            .history(rollout_id)
            .await
            .map_err(|e| RolloutError::Internal(e.to_string()))
    }

    /// Wait until a rollout reaches a terminal state (or its loop stops).
    pub async fn wait_terminal(&self, rollout_id: &str) -> Result<RolloutSnapshot, RolloutError> {
        let receiver = {
            let registry = self.inner.registry.lock().await;
            registry.slot(rollout_id).map(|slot| slot.snapshot.clone())
        };
        let Some(mut receiver) = receiver else {
            return self.status(rollout_id).await;
        };

        let outcome = receiver
            .wait_for(|s| s.is_terminal())
            .await
            .map(|snapshot| snapshot.clone());
        match outcome {
            Ok(snapshot) => Ok(snapshot),
            // Loop died; its watcher retires the rollout as FAILED.
            Err(_) => Ok(receiver.borrow().clone()),
        }
    }

    /// Stop every tick loop. Live rollouts are halted as FAILED at their
    /// last confirmed weight and archived; the router is not touched.
    pub async fn shutdown(&self) {
        let handles: Vec<(RolloutId, JoinHandle<()>)> = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .active
                .values_mut()
                .filter_map(|slot| {
                    let _ = slot.shutdown_tx.send(true);
                    slot.handle.take().map(|handle| (slot.id.clone(), handle))
                })
                .collect()
        };

        for (id, handle) in handles {
            if let Err(e) = handle.await {
                error!(rollout_id = %id, error = %e, "rollout task ended abnormally");
            }
        }

        if let Err(e) = self.inner.adapters.audit.flush().await {
            warn!(error = %e, "audit trail not flushed on shutdown");
        }
        info!("supervisor stopped");
    }

    async fn archived(&self, rollout_id: &str) -> Result<RolloutSnapshot, RolloutError> {
        self.inner
            .adapters
            .audit
            .archived(rollout_id)
            .await
            .map_err(|e| RolloutError::Internal(e.to_string()))?
            .ok_or_else(|| RolloutError::NotFound(rollout_id.to_string()))
    }
}

/// Tick loop for one rollout.
async fn run_rollout(
    mut machine: RolloutMachine,
    mut commands: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<RolloutSnapshot>,
    mut shutdown_rx: watch::Receiver<bool>,
    inner: Weak<Inner>,
) {
    let rollout_id = machine.execution().id().to_string();
    let period = machine.execution().policy().tick_interval;

    machine.begin().await;
    snapshot_tx.send_replace(machine.snapshot());

    match Instant::now().checked_add(period) {
        Some(first_tick) => {
            let mut ticker = interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !machine.is_terminal() {
                let mut pending = Vec::new();
                tokio::select! {
                    _ = ticker.tick() => {}
                    Some(command) = commands.recv() => pending.push(command),
                    _ = shutdown_rx.changed() => {
                        info!(
                            %rollout_id,
                            state = %machine.state(),
                            candidate_weight = machine.execution().candidate_weight(),
                            "tick loop stopped, halting rollout at last confirmed weight"
                        );
                        machine.halt("controller stopped").await;
                        snapshot_tx.send_replace(machine.snapshot());
                        break;
                    }
                }

                while let Ok(command) = commands.try_recv() {
                    pending.push(command);
                }
                machine.tick(pending).await;
                snapshot_tx.send_replace(machine.snapshot());
            }
        }
        None => {
            error!(
                %rollout_id,
                tick_interval = %format_duration(period),
                "tick interval cannot be scheduled"
            );
            let cause = format!("tick interval {} cannot be scheduled", format_duration(period));
            machine.halt(&cause).await;
            snapshot_tx.send_replace(machine.snapshot());
        }
    }

    retire(&inner, machine.snapshot()).await;
}

/// Mark a rollout whose tick loop died as FAILED, then retire it.
async fn loop_crashed(inner: &Weak<Inner>, mut snapshot: RolloutSnapshot, cause: JoinError) {
    let Some(strong) = inner.upgrade() else {
        return;
    };
    error!(
        rollout_id = %snapshot.id,
        service = %snapshot.target.service,
        state = %snapshot.state,
        error = %cause,
        "tick loop crashed"
    );

    if !snapshot.is_terminal() {
        let audit = &strong.adapters.audit;
        let now = strong.adapters.clock.now_ms();
        let reason = format!(
            "tick loop crashed: {cause}; candidate weight left at {}%",
            snapshot.candidate_weight
        );
        let decision = Decision::new(Verdict::Hold, reason.clone(), now);

        // The loop assigned sequence numbers; continue after the last one stored.
        if let Err(e) = audit.flush().await {
            warn!(rollout_id = %snapshot.id, error = %e, "audit trail not flushed");
        }
        let seq = match audit.history(&snapshot.id).await {
            Ok(trail) => trail.last().map_or(0, |r| r.seq + 1),
            Err(e) => {
                warn!(rollout_id = %snapshot.id, error = %e, "audit trail unreadable");
                snapshot.decisions.len() as u64
            }
        };
        audit
            .record(AuditRecord {
                rollout_id: snapshot.id.clone(),
                seq,
                timestamp_ms: now,
                from_state: snapshot.state,
                to_state: RolloutState::Failed,
                candidate_weight: snapshot.candidate_weight,
                decision: decision.clone(),
                metrics: MetricSnapshot::new(),
            })
            .await;

        snapshot.state = RolloutState::Failed;
        snapshot.last_transition_at_ms = now;
        snapshot.decisions.push(decision);
        snapshot.result = Some(TerminalResult {
            state: RolloutState::Failed,
            reason,
            finished_at_ms: now,
        });
    }
    drop(strong);

    retire(inner, snapshot).await;
}

/// Move a terminal rollout out of the active set and archive it.
async fn retire(inner: &Weak<Inner>, snapshot: RolloutSnapshot) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    {
        let mut registry = inner.registry.lock().await;
        let service = snapshot.target.registry_key();
        if registry.active.get(service).is_some_and(|slot| slot.id == snapshot.id) {
            registry.active.remove(service);
        }
        registry.services.remove(&snapshot.id);
        registry.finished.insert(snapshot.id.clone(), snapshot.clone());
    }

    info!(
        rollout_id = %snapshot.id,
        service = %snapshot.target.service,
        state = %snapshot.state,
        decisions = snapshot.decisions.len(),
        "rollout finished"
    );
    inner.adapters.audit.archive(snapshot).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use modelroll_core::{MetricKind, MetricSample, RolloutState, Thresholds, Verdict};

    use super::*;
    use crate::adapters::{InMemoryMetrics, InMemoryRouter};
    use crate::audit::{AuditConfig, AuditRecorder};
    use crate::clock::{Clock, TokioClock};
    use modelroll_state::StateStore;

    const T0: u64 = 1_700_000_000_000;

    struct Fixture {
        supervisor: Supervisor,
        metrics: Arc<InMemoryMetrics>,
        router: Arc<InMemoryRouter>,
        clock: Arc<TokioClock>,
        store: StateStore,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(InMemoryMetrics::new());
        let router = Arc::new(InMemoryRouter::new());
        let clock = Arc::new(TokioClock::starting_at(T0));
        let store = StateStore::open_in_memory().unwrap();
        let (audit, _writer) = AuditRecorder::spawn(Arc::new(store.clone()), AuditConfig::default());
        let supervisor = Supervisor::new(Adapters {
            metrics: metrics.clone(),
            router: router.clone(),
            audit,
            clock: clock.clone(),
        });
        Fixture {
            supervisor,
            metrics,
            router,
            clock,
            store,
        }
    }

    fn policy() -> RolloutPolicy {
        RolloutPolicy {
            steps: vec![5, 25, 50, 100],
            dwell: Duration::from_secs(60),
            tick_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(3600),
            staleness: Duration::from_secs(30),
            window: Duration::from_secs(60),
            thresholds: Thresholds {
                max_latency_p95_ms: Some(250.0),
                max_error_rate: Some(0.05),
                max_drift_score: None,
                min_accuracy_proxy: None,
            },
            ..RolloutPolicy::default()
        }
    }

    fn target(service: &str) -> RolloutTarget {
        RolloutTarget::new(service, "v1", "v2")
    }

    /// Reports healthy candidate metrics every 5 seconds.
    fn spawn_feeder(metrics: Arc<InMemoryMetrics>, clock: Arc<TokioClock>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = clock.now_ms();
                metrics
                    .push_many(vec![
                        MetricSample::new(now, "v2", MetricKind::LatencyP95Ms, 110.0),
                        MetricSample::new(now, "v2", MetricKind::ErrorRate, 0.004),
                    ])
                    .await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_rollout_reaches_stable_and_is_archived() {
        let f = fixture();
        let feeder = spawn_feeder(f.metrics.clone(), f.clock.clone());

        let started = f.supervisor.start(target("ranker"), policy()).await.unwrap();
        assert_eq!(started.state, RolloutState::Pending);

        let done = f.supervisor.wait_terminal(&started.id).await.unwrap();
        feeder.abort();

        assert_eq!(done.state, RolloutState::Stable);
        assert_eq!(done.count_verdicts(Verdict::Advance), 4);
        assert_eq!(
            f.router.applied("ranker").await.map(|s| s.candidate),
            Some(100)
        );

        // Wait for the loop to retire and archive the rollout.
        while f.store.get_snapshot(&started.id).unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.supervisor.shutdown().await;

        let trail = f.supervisor.audit(&started.id).await.unwrap();
        assert!(!trail.is_empty());
        assert_eq!(trail.last().unwrap().to_state, RolloutState::Stable);
        assert_eq!(
            f.supervisor.status(&started.id).await.unwrap().state,
            RolloutState::Stable
        );

        // The service is free again.
        assert!(f.supervisor.start(target("ranker"), policy()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_admit_exactly_one() {
        let f = fixture();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let supervisor = f.supervisor.clone();
            tasks.push(tokio::spawn(async move {
                supervisor.start(target("ranker"), policy()).await
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(RolloutError::Conflict { service, .. }) => {
                    assert_eq!(service, "ranker");
                    conflicts += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);

        // Other services are independent.
        assert!(f.supervisor.start(target("search"), policy()).await.is_ok());
        assert_eq!(f.supervisor.list().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_rolls_back_and_is_idempotent() {
        let f = fixture();
        let started = f.supervisor.start(target("ranker"), policy()).await.unwrap();

        f.supervisor.abort(&started.id, "bad build").await.unwrap();
        f.supervisor.abort(&started.id, "really bad").await.unwrap();
        let done = f.supervisor.wait_terminal(&started.id).await.unwrap();

        assert_eq!(done.state, RolloutState::RolledBack);
        assert_eq!(done.count_verdicts(Verdict::Rollback), 1);
        assert_eq!(
            done.result.as_ref().unwrap().reason,
            "aborted by operator: bad build"
        );
        assert_eq!(f.router.applied("ranker").await.map(|s| s.candidate), Some(0));

        let calls = f.router.calls().await.len();
        let again = f.supervisor.abort(&started.id, "third").await.unwrap();
        assert_eq!(again.state, RolloutState::RolledBack);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.router.calls().await.len(), calls);
    }

    #[tokio::test]
    async fn unknown_rollout_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.supervisor.status("nope").await,
            Err(RolloutError::NotFound(_))
        ));
        assert!(matches!(
            f.supervisor.abort("nope", "x").await,
            Err(RolloutError::NotFound(_))
        ));
        assert!(matches!(
            f.supervisor.audit("nope").await,
            Err(RolloutError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_registration() {
        let f = fixture();
        let mut bad = policy();
        bad.steps = vec![50, 25];
        assert!(matches!(
            f.supervisor.start(target("ranker"), bad).await,
            Err(RolloutError::PolicyViolation(_))
        ));
        assert!(matches!(
            f.supervisor.start(RolloutTarget::new("ranker", "v1", "v1"), policy()).await,
            Err(RolloutError::PolicyViolation(_))
        ));
        assert!(f.supervisor.list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_halts_and_archives_live_rollouts() {
        let f = fixture();
        let started = f.supervisor.start(target("ranker"), policy()).await.unwrap();
        // Let begin() apply the first step.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.router.applied("ranker").await.map(|s| s.candidate), Some(5));

        f.supervisor.shutdown().await;
        let snapshot = f.supervisor.status(&started.id).await.unwrap();
        assert_eq!(snapshot.state, RolloutState::Failed);
        assert_eq!(snapshot.candidate_weight, 5);
        let reason = &snapshot.result.as_ref().unwrap().reason;
        assert!(reason.starts_with("controller stopped while CANARYING"), "{reason}");

        // The router keeps serving the last confirmed split.
        assert_eq!(f.router.applied("ranker").await.map(|s| s.candidate), Some(5));

        let archived = f.store.get_snapshot(&started.id).unwrap().unwrap();
        assert_eq!(archived.state, RolloutState::Failed);
        let trail = f.store.list_audit(&started.id).unwrap();
        assert_eq!(trail.last().unwrap().to_state, RolloutState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_tick_loop_fails_rollout_and_frees_service() {
        struct Exploding;

        #[async_trait::async_trait]
        impl crate::adapters::MetricSource for Exploding {
            async fn query(
                &self,
                _: &str,
                _: MetricKind,
                _: modelroll_core::TimeRange,
            ) -> Result<Vec<MetricSample>, crate::error::AdapterError> {
                panic!("metric backend bug");
            }
        }

        let f = fixture();
        let (audit, _writer) =
            AuditRecorder::spawn(Arc::new(f.store.clone()), AuditConfig::default());
        let supervisor = Supervisor::new(Adapters {
            metrics: Arc::new(Exploding),
            router: f.router.clone(),
            audit,
            clock: f.clock.clone(),
        });

        let started = supervisor.start(target("ranker"), policy()).await.unwrap();
        let mut snapshot = supervisor.status(&started.id).await.unwrap();
        for _ in 0..100 {
            if snapshot.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            snapshot = supervisor.status(&started.id).await.unwrap();
        }

        assert_eq!(snapshot.state, RolloutState::Failed);
        assert_eq!(snapshot.candidate_weight, 5);
        let reason = &snapshot.result.as_ref().unwrap().reason;
        assert!(reason.starts_with("tick loop crashed"), "{reason}");
        assert!(reason.ends_with("candidate weight left at 5%"), "{reason}");

        // Retired: abort reports the final state and the service accepts a new rollout.
        let aborted = supervisor.abort(&started.id, "late").await.unwrap();
        assert_eq!(aborted.state, RolloutState::Failed);
        assert!(supervisor.start(target("ranker"), policy()).await.is_ok());

        supervisor.shutdown().await;
        let trail = f.store.list_audit(&started.id).unwrap();
        let seqs: Vec<u64> = trail.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (0..trail.len() as u64).collect::<Vec<_>>());
        assert_eq!(trail.last().unwrap().to_state, RolloutState::Failed);
    }

    #[tokio::test]
    async fn unschedulable_tick_interval_is_rejected() {
        let f = fixture();
        let mut huge = policy();
        huge.tick_interval = Duration::from_secs(u64::MAX);
        assert!(matches!(
            f.supervisor.start(target("ranker"), huge).await,
            Err(RolloutError::PolicyViolation(_))
        ));
        // Nothing was registered, so the service is still free.
        assert!(f.supervisor.start(target("ranker"), policy()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn list_includes_archived_rollouts_from_earlier_runs() {
        let f = fixture();
        let started = f.supervisor.start(target("ranker"), policy()).await.unwrap();
        f.supervisor.abort(&started.id, "bad build").await.unwrap();
        f.supervisor.wait_terminal(&started.id).await.unwrap();
        while f.store.get_snapshot(&started.id).unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.supervisor.shutdown().await;

        // A supervisor over the same store with an empty registry.
        let (audit, _writer) =
            AuditRecorder::spawn(Arc::new(f.store.clone()), AuditConfig::default());
        let fresh = Supervisor::new(Adapters {
            metrics: f.metrics.clone(),
            router: f.router.clone(),
            audit,
            clock: f.clock.clone(),
        });
        let listed = fresh.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, started.id);
        assert_eq!(listed[0].state, RolloutState::RolledBack);

        // Live and archived copies of one rollout are listed once.
        let second = fresh.start(target("search"), policy()).await.unwrap();
        let ids: Vec<String> = fresh.list().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&second.id));
    }
}
