//! Policy evaluator — turns recent samples into a decision.
//!
//! Pure: `(policy, breach counters, samples, now) -> Evaluation`. Nothing
//! here performs I/O or reads a clock.
//!
//! Per tick, every tracked metric is aggregated over the evaluation window
//! (p95 for latency, mean otherwise) and compared against its threshold:
//!
//! ```text
//! new samples breach         -> bump counters; ROLLBACK once the count
//!                               reaches breach_limit, else CONTINUE
//! any metric stale/sparse    -> HOLD (counters untouched)
//! window breaches, but only
//!   through old samples      -> CONTINUE (no count, dwell restarts)
//! all clean, dwell elapsed   -> ADVANCE
//! all clean                  -> CONTINUE (counters reset)
//! ```
//!
//! A breaching window only counts toward the limit when the samples that
//! arrived since the last evaluation breach on their own, so one outlier
//! that lingers in the window is counted once, not once per tick.
//!
//! Missing data never authorizes promotion.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use modelroll_core::{
    duration_ms, format_duration, BreachCounting, Decision, MetricAggregate, MetricKind,
    MetricSample, MetricSnapshot, RolloutPolicy, ThresholdBound, Verdict,
};

/// Consecutive-breach counters, kept by the state machine between ticks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BreachCounters {
    combined: u32,
    per_metric: BTreeMap<MetricKind, u32>,
}

impl BreachCounters {
    /// Count that is compared against the breach limit.
    pub fn current(&self, mode: BreachCounting) -> u32 {
        match mode {
            BreachCounting::Combined => self.combined,
            BreachCounting::PerMetric => self.per_metric.values().copied().max().unwrap_or(0),
        }
    }

    pub fn for_metric(&self, metric: MetricKind) -> u32 {
        self.per_metric.get(&metric).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.combined = 0;
        self.per_metric.clear();
    }

    /// Apply one tick's outcome: breaching metrics increment, metrics that
    /// were evaluated clean reset.
    fn record(&mut self, breached: &[MetricKind], clean: &[MetricKind]) {
        if breached.is_empty() {
            self.combined = 0;
        } else {
            self.combined += 1;
        }
        for metric in breached {
            *self.per_metric.entry(*metric).or_insert(0) += 1;
        }
        for metric in clean {
            self.per_metric.remove(metric);
        }
    }

    /// Clear per-metric counts for `clean` without touching the combined
    /// count.
    fn settle(&mut self, clean: &[MetricKind]) {
        for metric in clean {
            self.per_metric.remove(metric);
        }
    }
}

/// A tracked metric without enough fresh evidence.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{metric}: {found} sample(s) in window, need {required}{}", freshness_note(.fresh))]
pub struct StaleData {
    pub metric: MetricKind,
    pub found: usize,
    pub required: u32,
    pub fresh: bool,
}

fn freshness_note(fresh: &bool) -> &'static str {
    if *fresh { "" } else { ", none fresh" }
}

/// Everything the evaluator needs for one tick.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    pub policy: &'a RolloutPolicy,
    pub breaches: &'a BreachCounters,
    /// Start of the current clean observation period: step entry, or the
    /// last breaching tick if one happened during this step.
    pub clean_since_ms: u64,
    /// Samples at or before this instant were seen by an earlier
    /// evaluation. Zero on the first tick.
    pub evaluated_through_ms: u64,
    pub now_ms: u64,
    /// Candidate samples; may include samples outside the window.
    pub samples: &'a [MetricSample],
}

/// Result of one evaluation tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub breaches: BreachCounters,
    /// Whether any metric's window aggregate breached on this tick, counted
    /// or not.
    pub breached: bool,
    pub metrics: MetricSnapshot,
}

/// Evaluate a policy against recent samples.
pub fn evaluate(input: EvaluationInput<'_>) -> Evaluation {
    let policy = input.policy;
    let now = input.now_ms;
    let window_start = now.saturating_sub(duration_ms(policy.window));
    let fresh_after = now.saturating_sub(duration_ms(policy.staleness));

    let mut metrics = MetricSnapshot::new();
    let mut contributing = Vec::new();
    let mut stale = Vec::new();
    let mut breached = Vec::new();
    let mut clean = Vec::new();
    // Window breaches carried only by samples an earlier tick already saw.
    let mut lingering = Vec::new();
    // Window breaches whose new samples are within bounds.
    let mut settling = Vec::new();
    let mut findings = Vec::new();

    for (metric, bound) in policy.thresholds.tracked() {
        let in_window: Vec<&MetricSample> = input
            .samples
            .iter()
            .filter(|s| s.metric == metric && s.timestamp_ms >= window_start && s.timestamp_ms <= now)
            .collect();
        let fresh = in_window.iter().any(|s| s.timestamp_ms >= fresh_after);

        if !fresh || in_window.len() < policy.min_samples as usize {
            stale.push(StaleData {
                metric,
                found: in_window.len(),
                required: policy.min_samples,
                fresh,
            });
            continue;
        }

        let values: Vec<f64> = in_window.iter().map(|s| s.value).collect();
        let value = aggregate(metric, &values);
        let is_breach = bound.breached_by(value);
        metrics.insert(
            metric,
            MetricAggregate {
                value,
                samples: values.len(),
                breached: is_breach,
            },
        );
        contributing.extend(in_window.iter().map(|s| (*s).clone()));
        if !is_breach {
            clean.push(metric);
            continue;
        }
        findings.push(describe_breach(metric, value, bound));

        let recent: Vec<f64> = in_window
            .iter()
            .filter(|s| s.timestamp_ms > input.evaluated_through_ms)
            .map(|s| s.value)
            .collect();
        if recent.is_empty() {
            lingering.push(metric);
        } else if bound.breached_by(aggregate(metric, &recent)) {
            breached.push(metric);
        } else {
            settling.push(metric);
        }
    }

    let mut breaches = input.breaches.clone();
    let at = now;

    let decision = if !breached.is_empty() {
        let recovered: Vec<MetricKind> = clean.iter().chain(&settling).copied().collect();
        breaches.record(&breached, &recovered);
        let count = breaches.current(policy.breach_counting);
        let detail = findings.join(", ");
        if count >= policy.breach_limit {
            Decision::new(
                Verdict::Rollback,
                format!(
                    "{detail}; {count} consecutive breaching tick(s) reached limit {}",
                    policy.breach_limit
                ),
                at,
            )
        } else {
            Decision::new(
                Verdict::Continue,
                format!("{detail}; breach {count}/{}", policy.breach_limit),
                at,
            )
        }
    } else if !stale.is_empty() {
        let detail: Vec<String> = stale.iter().map(|s| s.to_string()).collect();
        Decision::new(
            Verdict::Hold,
            format!("insufficient fresh data: {}", detail.join("; ")),
            at,
        )
    } else if !lingering.is_empty() || !settling.is_empty() {
        let recovered: Vec<MetricKind> = clean.iter().chain(&settling).copied().collect();
        if lingering.is_empty() {
            breaches.record(&[], &recovered);
        } else {
            breaches.settle(&recovered);
        }
        Decision::new(
            Verdict::Continue,
            format!(
                "{}; no new breaching samples since the last evaluation",
                findings.join(", ")
            ),
            at,
        )
    } else {
        breaches.record(&[], &clean);
        let clean_for = now.saturating_sub(input.clean_since_ms);
        let dwell = duration_ms(policy.dwell);
        if clean_for >= dwell {
            Decision::new(
                Verdict::Advance,
                format!(
                    "all metrics within thresholds for {}",
                    format_duration(policy.dwell)
                ),
                at,
            )
        } else {
            Decision::new(
                Verdict::Continue,
                format!(
                    "within thresholds; dwell {}ms of {}",
                    clean_for,
                    format_duration(policy.dwell)
                ),
                at,
            )
        }
    };

    debug!(
        verdict = %decision.verdict,
        reason = %decision.reason,
        breaching = breached.len(),
        lingering = lingering.len() + settling.len(),
        stale = stale.len(),
        "evaluated policy"
    );

    Evaluation {
        decision: decision.with_samples(contributing),
        breaches,
        breached: !breached.is_empty() || !lingering.is_empty() || !settling.is_empty(),
        metrics,
    }
}

/// Window aggregate: nearest-rank p95 for latency, mean for the rest.
pub fn aggregate(metric: MetricKind, values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    match metric {
        MetricKind::LatencyP95Ms => percentile(values, 0.95),
        MetricKind::ErrorRate | MetricKind::DriftScore | MetricKind::AccuracyProxy => {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }
}

fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn describe_breach(metric: MetricKind, value: f64, bound: ThresholdBound) -> String {
    match bound {
        ThresholdBound::Max(limit) => format!("{metric}={value:.3} > {limit}"),
        ThresholdBound::Min(limit) => format!("{metric}={value:.3} < {limit}"),
    }
}
