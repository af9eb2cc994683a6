//! Rolling update: recreate stale members one at a time.

use std::collections::BTreeSet;
use tracing::{info, warn};

use super::{ClusterContext, EngineReport};
use crate::error::{OperatorError, Result};
use crate::evaluator;
use crate::resilience::{with_timeout, RetryExecutor};
use crate::snapshot::{NodeFacts, TopologySnapshot};
use crate::types::Role;

/// Recreate every stale member, replicas before the leader of each group.
///
/// Members of one group are never recreated concurrently. Failures are
/// reported and left for the next pass.
pub async fn rolling_update(ctx: &ClusterContext, snapshot: &TopologySnapshot) -> Result<EngineReport> {
    let mut report = EngineReport::new("rolling-update");
    let stale: BTreeSet<String> = evaluator::stale_nodes(&ctx.declaration, snapshot)
        .into_iter()
        .collect();
    if stale.is_empty() {
        return Ok(report);
    }
    info!(cluster = %ctx.name(), stale = stale.len(), "Starting rolling update");

    for group in ctx.store.all().groups() {
        for name in ctx.store.all().group_members(group) {
            if !stale.contains(&name) {
                continue;
            }
            let Some(entry) = ctx.store.get(&name) else {
                continue;
            };
            let result = match entry.role {
                Role::Replica => update_replica(ctx, snapshot, &name).await,
                Role::Leader => update_leader(ctx, snapshot, group, &name).await,
            };
            match result {
                Ok(()) => report.succeeded.push(name),
                Err(e) => report.fail(name, &e),
            }
        }
    }

    Ok(report)
}

async fn update_replica(ctx: &ClusterContext, snapshot: &TopologySnapshot, name: &str) -> Result<()> {
    let entry = ctx
        .store
        .get(name)
        .ok_or_else(|| OperatorError::Topology(format!("{} missing from blueprint", name)))?;
    let parent = entry
        .parent
        .clone()
        .ok_or_else(|| OperatorError::Topology(format!("replica {} has no parent", name)))?;
    let leader = reachable(ctx, &parent).await?;
    let leader_address = leader
        .address
        .ok_or_else(|| OperatorError::Unreachable(parent.clone()))?;
    let seed = snapshot.healthy_address_except(name).unwrap_or_else(|| leader_address.clone());

    info!(cluster = %ctx.name(), node = %name, "Recreating replica");
    let facts = ctx
        .bring_up(name, Role::Replica, Some(&seed), Some(&leader_address))
        .await?;
    ctx.store.set(name, entry.recreated(facts.node_id)).await
}

/// Fail the leader over to a healthy replica, then recreate it as a replica.
async fn update_leader(ctx: &ClusterContext, snapshot: &TopologySnapshot, group: u32, name: &str) -> Result<()> {
    let blueprint = ctx.store.all();
    let leader = reachable(ctx, name).await?;
    let leader_id = leader
        .node_id
        .clone()
        .ok_or_else(|| OperatorError::Unreachable(name.to_string()))?;

    let mut candidate = None;
    for replica in blueprint.replicas_of(name) {
        let facts = ctx.snapshot_builder().probe_one(&replica).await;
        let attached = facts.is_ok()
            && facts.role == Some(Role::Replica)
            && facts.leader_id.as_deref() == Some(leader_id.as_str());
        if !attached {
            continue;
        }
        let current = facts.config.as_ref() == Some(&ctx.declaration.member);
        // Prefer a replica already running the new configuration.
        if current || candidate.is_none() {
            candidate = Some(facts);
        }
        if current {
            break;
        }
    }

    let Some(candidate) = candidate else {
        if blueprint.replicas_of(name).is_empty() {
            warn!(cluster = %ctx.name(), node = %name, "Leader has no replicas, recreating in place");
            let entry = blueprint
                .get(name)
                .cloned()
                .ok_or_else(|| OperatorError::Topology(format!("{} missing from blueprint", name)))?;
            let seed = snapshot.healthy_address_except(name);
            let facts = ctx.bring_up(name, Role::Leader, seed.as_deref(), None).await?;
            return ctx.store.set(name, entry.recreated(facts.node_id)).await;
        }
        return Err(OperatorError::Topology(format!(
            "leader {} has no healthy replica to fail over to",
            name
        )));
    };

    let candidate_address = candidate
        .address
        .clone()
        .ok_or_else(|| OperatorError::Unreachable(candidate.name.clone()))?;

    info!(cluster = %ctx.name(), leader = %name, replica = %candidate.name, "Failing over before update");
    with_timeout(
        "failover",
        ctx.config.command_timeout,
        ctx.admin.failover(&candidate_address),
    )
    .await?;
    wait_promoted(ctx, &candidate.name).await?;

    ctx.store
        .set_many(blueprint.with_promotion(group, &candidate.name))
        .await?;

    let demoted = ctx
        .store
        .get(name)
        .ok_or_else(|| OperatorError::Topology(format!("{} missing from blueprint", name)))?;
    let facts = ctx
        .bring_up(name, Role::Replica, Some(&candidate_address), Some(&candidate_address))
        .await?;
    ctx.store.set(name, demoted.recreated(facts.node_id)).await
}

async fn reachable(ctx: &ClusterContext, name: &str) -> Result<NodeFacts> {
    let facts = ctx.snapshot_builder().probe_one(name).await;
    if facts.is_ok() {
        Ok(facts)
    } else {
        Err(OperatorError::Unreachable(name.to_string()))
    }
}

async fn wait_promoted(ctx: &ClusterContext, name: &str) -> Result<()> {
    let executor = RetryExecutor::new(ctx.config.settle_retry());
    executor
        .execute(|| async move {
            let facts = ctx.snapshot_builder().probe_one(name).await;
            if facts.is_healthy_leader() {
                Ok(())
            } else {
                Err(OperatorError::Command(format!("{} not promoted yet", name)))
            }
        })
        .await
}
