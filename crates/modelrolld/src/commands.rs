//! Operator subcommands that talk to a running daemon.

use std::path::Path;

use anyhow::Context;

use modelroll_api::handlers::StartRolloutRequest;
use modelroll_core::{format_duration, RolloutPolicy, RolloutSnapshot, RolloutTarget};

use crate::client::ApiClient;

pub async fn start(
    client: &ApiClient,
    target: RolloutTarget,
    policy: Option<&Path>,
) -> anyhow::Result<()> {
    let policy = policy
        .map(|path| {
            RolloutPolicy::from_file(path).with_context(|| format!("loading {}", path.display()))
        })
        .transpose()?;

    let snapshot = client.start(&StartRolloutRequest { target, policy }).await?;
    println!("✓ Rollout {} started for {}", snapshot.id, snapshot.target);
    println!("  Steps: {:?}", snapshot.policy.steps);
    Ok(())
}

pub async fn abort(client: &ApiClient, id: &str, reason: Option<String>) -> anyhow::Result<()> {
    let snapshot = client.abort(id, reason).await?;
    if snapshot.is_terminal() {
        println!("Rollout {id} already finished ({})", snapshot.state);
    } else {
        println!("✓ Abort requested for rollout {id}");
    }
    Ok(())
}

pub async fn status(client: &ApiClient, id: Option<&str>, json: bool) -> anyhow::Result<()> {
    match id {
        Some(id) => {
            let snapshot = client.status(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot(&snapshot);
            }
        }
        None => {
            let rollouts = client.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rollouts)?);
            } else if rollouts.is_empty() {
                println!("No rollouts.");
            } else {
                for r in &rollouts {
                    println!(
                        "{}  {:<20} {:<13} {:>3}%",
                        r.id, r.target.service, r.state, r.candidate_weight
                    );
                }
            }
        }
    }
    Ok(())
}

pub async fn audit(client: &ApiClient, id: &str, json: bool) -> anyhow::Result<()> {
    let records = client.audit(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    for r in &records {
        println!(
            "#{:<4} {:>15}  {:<13} -> {:<13} {:>3}%  {:<8} {}",
            r.seq,
            r.timestamp_ms,
            r.from_state,
            r.to_state,
            r.candidate_weight,
            r.decision.verdict,
            r.decision.reason
        );
    }
    Ok(())
}

/// Parse and validate a policy file without contacting the daemon.
pub fn validate_policy(path: &Path) -> anyhow::Result<()> {
    let policy = RolloutPolicy::from_file(path)
        .with_context(|| format!("invalid policy {}", path.display()))?;
    println!("✓ Policy {} is valid", path.display());
    println!("  Steps: {:?}", policy.steps);
    println!(
        "  Dwell {} per step, tick every {}, timeout {}",
        format_duration(policy.dwell),
        format_duration(policy.tick_interval),
        format_duration(policy.timeout)
    );
    for (metric, bound) in policy.thresholds.tracked() {
        println!("  {metric}: {bound:?}");
    }
    Ok(())
}

fn print_snapshot(s: &RolloutSnapshot) {
    println!("Rollout {}", s.id);
    println!("  Target:    {}", s.target);
    println!("  State:     {}", s.state);
    println!(
        "  Step:      {}/{} ({}% candidate)",
        s.step_index + 1,
        s.policy.steps.len(),
        s.candidate_weight
    );
    println!("  Breaches:  {}/{}", s.consecutive_breaches, s.policy.breach_limit);
    if let Some(last) = s.decisions.last() {
        println!("  Last:      {}: {}", last.verdict, last.reason);
    }
    if let Some(result) = &s.result {
        println!("  Result:    {}: {}", result.state, result.reason);
    }
}
