//! Rollout controller — drives one rollout through its state machine.
//!
//! ```text
//! PENDING ──begin──▶ CANARYING ──ADVANCE──▶ ADVANCING ──ADVANCE (last)──▶ STABLE
//!                        │                      │
//!                        └──ROLLBACK/abort──────┴──▶ ROLLING_BACK ──▶ ROLLED_BACK
//!
//! any actuator call that exhausts its retries ──▶ FAILED
//! ```
//!
//! Each tick evaluates the candidate's recent metrics, applies the verdict
//! and appends an audit record. The in-memory state only moves after the
//! traffic router confirmed the new split, so the recorded weight never
//! runs ahead of what is actually being served.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use modelroll_core::{
    duration_ms, format_duration, AuditRecord, Decision, MetricSample, MetricSnapshot, RolloutId,
    RolloutPolicy, RolloutSnapshot, RolloutState, RolloutTarget, TerminalResult, TimeRange,
    TrafficSplit, Verdict,
};

use crate::adapters::{MetricSource, TrafficRouter};
use crate::audit::AuditRecorder;
use crate::clock::Clock;
use crate::error::AdapterError;
use crate::evaluator::{evaluate, BreachCounters, EvaluationInput};
use crate::retry::{retry_with_backoff, AttemptError, RetryPolicy};

/// Operator commands delivered to a running rollout between ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Force a rollback regardless of metrics.
    Abort { reason: String },
}

/// The collaborators a rollout talks to.
#[derive(Clone)]
pub struct Adapters {
    pub metrics: Arc<dyn MetricSource>,
    pub router: Arc<dyn TrafficRouter>,
    pub audit: AuditRecorder,
    pub clock: Arc<dyn Clock>,
}

/// Live state of one rollout. Owned by exactly one [`RolloutMachine`].
#[derive(Debug, Clone)]
pub struct RolloutExecution {
    id: RolloutId,
    target: RolloutTarget,
    policy: RolloutPolicy,
    state: RolloutState,
    step_index: usize,
    /// Last weight the router confirmed.
    candidate_weight: u8,
    breaches: BreachCounters,
    step_entered_at_ms: u64,
    clean_since_ms: u64,
    /// Newest instant a counted evaluation covered.
    evaluated_through_ms: u64,
    idle_ticks: u64,
    started_at_ms: u64,
    last_transition_at_ms: u64,
    decisions: Vec<Decision>,
    result: Option<TerminalResult>,
    next_seq: u64,
}

impl RolloutExecution {
    fn new(id: RolloutId, target: RolloutTarget, policy: RolloutPolicy, now_ms: u64) -> Self {
        Self {
            id,
            target,
            policy,
            state: RolloutState::Pending,
            step_index: 0,
            candidate_weight: 0,
            breaches: BreachCounters::default(),
            step_entered_at_ms: now_ms,
            clean_since_ms: now_ms,
            evaluated_through_ms: 0,
            idle_ticks: 0,
            started_at_ms: now_ms,
            last_transition_at_ms: now_ms,
            decisions: Vec::new(),
            result: None,
            next_seq: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &RolloutTarget {
        &self.target
    }

    pub fn policy(&self) -> &RolloutPolicy {
        &self.policy
    }

    pub fn state(&self) -> RolloutState {
        self.state
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn candidate_weight(&self) -> u8 {
        self.candidate_weight
    }

    pub fn breaches(&self) -> &BreachCounters {
        &self.breaches
    }

    pub fn step_entered_at_ms(&self) -> u64 {
        self.step_entered_at_ms
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn result(&self) -> Option<&TerminalResult> {
        self.result.as_ref()
    }

    /// Candidate weight implied by the current state and step.
    ///
    /// A FAILED rollout keeps whatever the router last confirmed.
    pub fn expected_weight(&self) -> u8 {
        match self.state {
            RolloutState::Pending | RolloutState::RolledBack => 0,
            RolloutState::Stable => 100,
            RolloutState::Canarying | RolloutState::Advancing => {
                self.policy.weight_at(self.step_index)
            }
            RolloutState::RollingBack | RolloutState::Failed => self.candidate_weight,
        }
    }

    pub fn snapshot(&self) -> RolloutSnapshot {
        RolloutSnapshot {
            id: self.id.clone(),
            target: self.target.clone(),
            policy: self.policy.clone(),
            state: self.state,
            step_index: self.step_index,
            candidate_weight: self.candidate_weight,
            consecutive_breaches: self.breaches.current(self.policy.breach_counting),
            idle_ticks: self.idle_ticks,
            started_at_ms: self.started_at_ms,
            last_transition_at_ms: self.last_transition_at_ms,
            decisions: self.decisions.clone(),
            result: self.result.clone(),
        }
    }
}

/// Drives a [`RolloutExecution`] against the metric source and router.
pub struct RolloutMachine {
    exec: RolloutExecution,
    adapters: Adapters,
}

impl RolloutMachine {
    pub fn new(
        id: RolloutId,
        target: RolloutTarget,
        policy: RolloutPolicy,
        adapters: Adapters,
    ) -> Self {
        let now = adapters.clock.now_ms();
        Self {
            exec: RolloutExecution::new(id, target, policy, now),
            adapters,
        }
    }

    pub fn execution(&self) -> &RolloutExecution {
        &self.exec
    }

    pub fn snapshot(&self) -> RolloutSnapshot {
        self.exec.snapshot()
    }

    pub fn state(&self) -> RolloutState {
        self.exec.state
    }

    pub fn is_terminal(&self) -> bool {
        self.exec.state.is_terminal()
    }

    /// Apply the first step: PENDING → CANARYING.
    ///
    /// A no-op once the rollout has left PENDING.
    pub async fn begin(&mut self) -> RolloutState {
        if self.exec.state != RolloutState::Pending {
            return self.exec.state;
        }

        let weight = self.exec.policy.weight_at(0);
        let decision = Decision::new(
            Verdict::Continue,
            format!(
                "rollout started; shifting {weight}% of traffic to {}",
                self.exec.target.candidate_version
            ),
            self.now(),
        );
        self.exec.decisions.push(decision.clone());

        info!(
            rollout_id = %self.exec.id,
            target = %self.exec.target,
            steps = ?self.exec.policy.steps,
            dwell = %format_duration(self.exec.policy.dwell),
            "starting rollout"
        );

        match self.apply(TrafficSplit::candidate(weight)).await {
            Ok(()) => {
                let now = self.now();
                self.exec.step_entered_at_ms = now;
                self.exec.clean_since_ms = now;
                self.transition(RolloutState::Canarying, decision, MetricSnapshot::new())
                    .await;
            }
            Err(e) => self.fail(decision, MetricSnapshot::new(), e).await,
        }
        self.exec.state
    }

    /// Run one evaluation tick. Commands are applied before metrics are
    /// looked at; an abort wins over anything the metrics say.
    pub async fn tick(&mut self, commands: Vec<Command>) -> RolloutState {
        if self.is_terminal() {
            if !commands.is_empty() {
                debug!(
                    rollout_id = %self.exec.id,
                    state = %self.exec.state,
                    "ignoring commands for finished rollout"
                );
            }
            return self.exec.state;
        }

        let abort = commands.into_iter().find_map(|cmd| match cmd {
            Command::Abort { reason } => Some(reason),
        });

        if self.exec.state == RolloutState::Pending {
            self.begin().await;
            if self.is_terminal() || abort.is_none() {
                return self.exec.state;
            }
        }

        let now = self.now();
        let elapsed = now.saturating_sub(self.exec.started_at_ms);
        let (decision, metrics) = if let Some(reason) = abort {
            (
                Decision::new(
                    Verdict::Rollback,
                    format!("aborted by operator: {reason}"),
                    now,
                ),
                MetricSnapshot::new(),
            )
        } else if elapsed > duration_ms(self.exec.policy.timeout) {
            (
                Decision::new(
                    Verdict::Rollback,
                    format!(
                        "overall timeout of {} exceeded after {elapsed}ms without reaching STABLE",
                        format_duration(self.exec.policy.timeout)
                    ),
                    now,
                ),
                MetricSnapshot::new(),
            )
        } else {
            self.assess(now).await
        };

        self.exec.decisions.push(decision.clone());
        match decision.verdict {
            Verdict::Continue | Verdict::Hold => {
                self.exec.idle_ticks += 1;
                if decision.verdict == Verdict::Hold {
                    warn!(
                        rollout_id = %self.exec.id,
                        reason = %decision.reason,
                        "holding at current step"
                    );
                }
                let state = self.exec.state;
                self.record(state, state, decision, metrics).await;
            }
            Verdict::Advance => self.advance(decision, metrics).await,
            Verdict::Rollback => self.rollback(decision, metrics).await,
        }
        self.exec.state
    }

    /// Stop driving the rollout: FAILED at the last confirmed weight, with
    /// `cause` recorded. The router is not called. A no-op once terminal.
    pub async fn halt(&mut self, cause: &str) -> RolloutState {
        if self.is_terminal() {
            return self.exec.state;
        }

        let now = self.now();
        let reason = format!(
            "{cause} while {}; candidate weight left at {}%",
            self.exec.state, self.exec.candidate_weight
        );
        warn!(
            rollout_id = %self.exec.id,
            service = %self.exec.target.service,
            state = %self.exec.state,
            candidate_weight = self.exec.candidate_weight,
            %cause,
            "rollout halted"
        );

        self.exec.result = Some(TerminalResult {
            state: RolloutState::Failed,
            reason: reason.clone(),
            finished_at_ms: now,
        });
        let decision = Decision::new(Verdict::Hold, reason, now);
        self.exec.decisions.push(decision.clone());
        self.transition(RolloutState::Failed, decision, MetricSnapshot::new())
            .await;
        self.exec.state
    }

    /// Query the candidate's metrics and evaluate them. Any source failure
    /// turns into a HOLD.
    async fn assess(&mut self, now: u64) -> (Decision, MetricSnapshot) {
        let policy = &self.exec.policy;
        let range = TimeRange::new(now.saturating_sub(duration_ms(policy.window)), now);
        let version = self.exec.target.candidate_version.as_str();

        let mut samples: Vec<MetricSample> = Vec::new();
        for (metric, _) in policy.thresholds.tracked() {
            let result = timeout(
                policy.metrics_timeout,
                self.adapters.metrics.query(version, metric, range),
            )
            .await;
            let error = match result {
                Ok(Ok(mut batch)) => {
                    samples.append(&mut batch);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => AdapterError::Timeout {
                    operation: "metrics query",
                    after_ms: duration_ms(policy.metrics_timeout),
                },
            };
            warn!(
                rollout_id = %self.exec.id,
                %metric,
                error = %error,
                "metric source failed"
            );
            let decision = Decision::new(
                Verdict::Hold,
                format!("metric source failed for {metric}: {error}"),
                now,
            );
            return (decision, MetricSnapshot::new());
        }

        let evaluation = evaluate(EvaluationInput {
            policy,
            breaches: &self.exec.breaches,
            clean_since_ms: self.exec.clean_since_ms,
            evaluated_through_ms: self.exec.evaluated_through_ms,
            now_ms: now,
            samples: &samples,
        });

        if evaluation.breached {
            self.exec.clean_since_ms = now;
        }
        // A HOLD counted nothing; its samples stay new for the next tick.
        if evaluation.decision.verdict != Verdict::Hold {
            self.exec.evaluated_through_ms = now;
        }
        self.exec.breaches = evaluation.breaches;
        (evaluation.decision, evaluation.metrics)
    }

    async fn advance(&mut self, decision: Decision, metrics: MetricSnapshot) {
        if self.exec.step_index >= self.exec.policy.last_step() {
            match self.apply(TrafficSplit::ALL_CANDIDATE).await {
                Ok(()) => {
                    self.exec.result = Some(TerminalResult {
                        state: RolloutState::Stable,
                        reason: format!(
                            "{} promoted to 100% of traffic",
                            self.exec.target.candidate_version
                        ),
                        finished_at_ms: self.now(),
                    });
                    self.transition(RolloutState::Stable, decision, metrics).await;
                }
                Err(e) => self.fail(decision, metrics, e).await,
            }
            return;
        }

        let next = self.exec.step_index + 1;
        let weight = self.exec.policy.weight_at(next);
        match self.apply(TrafficSplit::candidate(weight)).await {
            Ok(()) => {
                let now = self.now();
                self.exec.step_index = next;
                self.exec.step_entered_at_ms = now;
                self.exec.clean_since_ms = now;
                self.exec.breaches.reset();
                self.transition(RolloutState::Advancing, decision, metrics).await;
            }
            Err(e) => self.fail(decision, metrics, e).await,
        }
    }

    async fn rollback(&mut self, decision: Decision, metrics: MetricSnapshot) {
        self.transition(RolloutState::RollingBack, decision.clone(), metrics.clone())
            .await;

        match self.apply(TrafficSplit::ALL_STABLE).await {
            Ok(()) => {
                self.exec.result = Some(TerminalResult {
                    state: RolloutState::RolledBack,
                    reason: decision.reason.clone(),
                    finished_at_ms: self.now(),
                });
                self.transition(RolloutState::RolledBack, decision, metrics).await;
            }
            Err(e) => self.fail(decision, metrics, e).await,
        }
    }

    /// Push a split through the router with bounded retries. The confirmed
    /// weight only changes on success.
    async fn apply(&mut self, split: TrafficSplit) -> Result<(), AdapterError> {
        let router = Arc::clone(&self.adapters.router);
        let target = self.exec.target.clone();
        let retry = RetryPolicy::from(&self.exec.policy.actuator);

        match retry_with_backoff(&retry, "set_weights", || router.set_weights(&target, split)).await
        {
            Ok(()) => {
                self.exec.candidate_weight = split.candidate;
                Ok(())
            }
            Err(exhausted) => Err(match exhausted.last {
                AttemptError::TimedOut(after) => AdapterError::Timeout {
                    operation: "set_weights",
                    after_ms: duration_ms(after),
                },
                AttemptError::Failed(e) => e,
            }),
        }
    }

    async fn fail(&mut self, decision: Decision, metrics: MetricSnapshot, err: AdapterError) {
        let attempts = self.exec.policy.actuator.max_attempts;
        let reason = format!(
            "traffic router failed after {attempts} attempt(s) while applying {}: {err}; \
             candidate weight left at {}%",
            decision.verdict, self.exec.candidate_weight
        );
        error!(
            rollout_id = %self.exec.id,
            service = %self.exec.target.service,
            verdict = %decision.verdict,
            candidate_weight = self.exec.candidate_weight,
            error = %err,
            "actuator retries exhausted, rollout failed"
        );

        self.exec.result = Some(TerminalResult {
            state: RolloutState::Failed,
            reason: reason.clone(),
            finished_at_ms: self.now(),
        });
        let decision = Decision {
            reason,
            ..decision
        };
        self.transition(RolloutState::Failed, decision, metrics).await;
    }

    async fn transition(&mut self, to: RolloutState, decision: Decision, metrics: MetricSnapshot) {
        let from = self.exec.state;
        self.exec.state = to;
        self.exec.last_transition_at_ms = self.now();
        info!(
            rollout_id = %self.exec.id,
            service = %self.exec.target.service,
            from = %from,
            to = %to,
            step = self.exec.step_index,
            candidate_weight = self.exec.candidate_weight,
            reason = %decision.reason,
            "rollout state changed"
        );
        self.record(from, to, decision, metrics).await;
    }

    async fn record(
        &mut self,
        from: RolloutState,
        to: RolloutState,
        decision: Decision,
        metrics: MetricSnapshot,
    ) {
        let seq = self.exec.next_seq;
        self.exec.next_seq += 1;
        let record = AuditRecord {
            rollout_id: self.exec.id.clone(),
            seq,
            timestamp_ms: self.now(),
            from_state: from,
            to_state: to,
            candidate_weight: self.exec.candidate_weight,
            decision,
            metrics,
        };
        self.adapters.audit.record(record).await;
    }

    fn now(&self) -> u64 {
        self.adapters.clock.now_ms()
    }
}
