//! Scale engine: add or remove whole leader groups.

use std::collections::BTreeSet;
use tracing::{info, warn};

use super::{ClusterContext, EngineReport};
use crate::blueprint::Blueprint;
use crate::error::{OperatorError, Result};
use crate::resilience::with_timeout;
use crate::snapshot::TopologySnapshot;
use crate::types::{group_of, Role, ScaleDecision};

/// Apply a scale decision. Partial progress is reported, never raised.
pub async fn scale(ctx: &ClusterContext, snapshot: &TopologySnapshot, decision: ScaleDecision) -> Result<EngineReport> {
    match decision {
        ScaleDecision::None => Ok(EngineReport::new("scale")),
        ScaleDecision::ScaleUp(delta) => scale_up(ctx, snapshot, delta).await,
        ScaleDecision::ScaleDown(delta) => scale_down(ctx, snapshot, delta).await,
    }
}

/// Add `delta` leader groups, then rebalance slots across every leader.
pub async fn scale_up(ctx: &ClusterContext, snapshot: &TopologySnapshot, delta: u32) -> Result<EngineReport> {
    let mut report = EngineReport::new("scale-up");
    let replicas = ctx.declaration.replicas_per_leader;
    let seed = snapshot
        .healthy_leader_address()
        .ok_or(OperatorError::NoHealthyLeader)?;

    info!(cluster = %ctx.name(), delta, "Scaling up");
    for _ in 0..delta {
        let group = ctx.store.all().next_group();
        let entries = Blueprint::group_entries(group, replicas);
        // Intent first: a crash from here on leaves entries Recovery will fill in.
        ctx.store.set_many(entries.clone()).await?;

        let (leader, leader_entry) = entries[0].clone();
        let leader_address = match ctx.bring_up(&leader, Role::Leader, Some(&seed), None).await {
            Ok(facts) => {
                ctx.store
                    .set(&leader, leader_entry.recreated(facts.node_id.clone()))
                    .await?;
                report.succeeded.push(leader.clone());
                facts.address
            }
            Err(e) => {
                report.fail(leader.clone(), &e);
                None
            }
        };

        for (name, entry) in entries.into_iter().skip(1) {
            let Some(leader_address) = leader_address.as_deref() else {
                report.pending.push(name);
                continue;
            };
            match ctx
                .bring_up(&name, Role::Replica, Some(&seed), Some(leader_address))
                .await
            {
                Ok(facts) => {
                    ctx.store.set(&name, entry.recreated(facts.node_id)).await?;
                    report.succeeded.push(name);
                }
                Err(e) => report.fail(name, &e),
            }
        }
    }

    match with_timeout(
        "rebalance slots",
        ctx.config.migration_timeout,
        ctx.admin.rebalance_slots(&seed),
    )
    .await
    {
        Ok(output) if output.ok => report.commands.push("rebalance".to_string()),
        Ok(output) => report.fail("cluster", &OperatorError::Command(output.output)),
        Err(e) => report.fail("cluster", &e),
    }

    Ok(report)
}

/// Remove the `delta` newest leader groups after draining their slots.
///
/// A leader is only deleted once a fresh topology query reports that it owns
/// no slot. Otherwise it is refused and left in place.
pub async fn scale_down(ctx: &ClusterContext, snapshot: &TopologySnapshot, delta: u32) -> Result<EngineReport> {
    let mut report = EngineReport::new("scale-down");
    let blueprint = ctx.store.all();

    let mut leaders = blueprint.leaders();
    leaders.reverse();
    // Always keep one leader.
    let removable = leaders.len().saturating_sub(1).min(delta as usize);
    let departing: Vec<String> = leaders.into_iter().take(removable).collect();
    if departing.is_empty() {
        return Ok(report);
    }
    let departing_set: BTreeSet<&String> = departing.iter().collect();

    let departing_ids: Vec<String> = departing
        .iter()
        .filter_map(|name| snapshot.get(name).filter(|f| f.is_ok()).and_then(|f| f.node_id.clone()))
        .collect();
    let seed = snapshot
        .healthy_leaders()
        .into_iter()
        .filter(|n| !departing_set.contains(&n.name))
        .find_map(|n| n.address.clone())
        .ok_or(OperatorError::NoHealthyLeader)?;

    info!(cluster = %ctx.name(), departing = ?departing, "Scaling down");
    match with_timeout(
        "drain slots",
        ctx.config.migration_timeout,
        ctx.admin.drain_slots(&seed, &departing_ids),
    )
    .await
    {
        Ok(output) if output.ok => report.commands.push("drain".to_string()),
        Ok(output) => report.fail("cluster", &OperatorError::Command(output.output)),
        Err(e) => report.fail("cluster", &e),
    }

    for leader in &departing {
        match owned_slots(ctx, snapshot, leader).await {
            Ok(0) => {}
            Ok(slots) => {
                let refused = OperatorError::RemovalRefused {
                    node: leader.clone(),
                    slots,
                };
                report.fail(leader.clone(), &refused);
                continue;
            }
            Err(e) => {
                report.fail(leader.clone(), &e);
                continue;
            }
        }

        let Some(group) = group_of(leader) else {
            continue;
        };
        // Replicas first, the leader last.
        for name in blueprint.group_members(group) {
            match ctx.retire(&name, snapshot).await {
                Ok(()) => report.succeeded.push(name),
                Err(e) => {
                    report.fail(name, &e);
                    break;
                }
            }
        }
    }

    if report.is_clean() {
        info!(cluster = %ctx.name(), summary = %report.summary(), "Scale-down finished");
    } else {
        warn!(cluster = %ctx.name(), summary = %report.summary(), "Scale-down incomplete");
    }
    Ok(report)
}

/// Slots owned by `leader`, asked of the node itself after draining.
async fn owned_slots(ctx: &ClusterContext, snapshot: &TopologySnapshot, leader: &str) -> Result<u32> {
    let address = snapshot
        .get(leader)
        .and_then(|f| f.address.clone())
        .ok_or_else(|| OperatorError::Unreachable(leader.to_string()))?;
    let topology = with_timeout(
        "query topology",
        ctx.config.command_timeout,
        ctx.admin.query_topology(&address),
    )
    .await?;
    Ok(topology.owned_slots())
}
