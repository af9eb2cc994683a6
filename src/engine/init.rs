//! Full (re)initialization of a cluster instance.

use futures::future::join_all;
use tracing::{info, warn};

use super::{ClusterContext, EngineReport};
use crate::error::{OperatorError, Result};
use crate::provider::MemberSelector;
use crate::resilience::with_timeout;
use crate::types::{split_slots, Role};

/// Tear down every member and build the cluster again from the declaration.
///
/// Any failure aborts the whole initialization; the caller retries it from
/// scratch on the next tick.
pub async fn initialize(ctx: &ClusterContext) -> Result<EngineReport> {
    let mut report = EngineReport::new("initialize");
    let declaration = &ctx.declaration;
    declaration.validate()?;

    info!(
        cluster = %ctx.name(),
        leaders = declaration.leader_count,
        replicas = declaration.replicas_per_leader,
        "Initializing cluster"
    );

    clear_members(ctx).await?;

    let blueprint = ctx
        .store
        .create(declaration.leader_count, declaration.replicas_per_leader)
        .await?;
    let leaders = blueprint.leaders();

    // Leaders come up concurrently; each is independent until they are joined.
    let created = join_all(leaders.iter().map(|name| ctx.bring_up(name, Role::Leader, None, None))).await;
    let mut leader_facts = Vec::with_capacity(created.len());
    for (name, result) in leaders.iter().zip(created) {
        let facts = result?;
        report.succeeded.push(name.clone());
        leader_facts.push(facts);
    }

    let addresses: Vec<String> = leader_facts
        .iter()
        .map(|f| {
            f.address
                .clone()
                .ok_or_else(|| OperatorError::Member(format!("{} has no address", f.name)))
        })
        .collect::<Result<_>>()?;

    for (address, range) in addresses.iter().zip(split_slots(declaration.leader_count)) {
        with_timeout(
            "assign slots",
            ctx.config.command_timeout,
            ctx.admin.assign_slots(address, &[range]),
        )
        .await?;
    }

    let seed = addresses
        .first()
        .cloned()
        .ok_or_else(|| OperatorError::Internal("initialization without leaders".to_string()))?;
    for address in addresses.iter().skip(1) {
        ctx.join(address, &seed).await?;
    }
    report.commands.push(format!("joined {} leaders", addresses.len()));

    for (facts, address) in leader_facts.iter().zip(&addresses) {
        let entry = blueprint
            .get(&facts.name)
            .cloned()
            .ok_or_else(|| OperatorError::Topology(format!("{} missing from blueprint", facts.name)))?;
        ctx.store
            .set(&facts.name, entry.recreated(facts.node_id.clone()))
            .await?;

        for replica in blueprint.replicas_of(&facts.name) {
            let replica_facts = ctx
                .bring_up(&replica, Role::Replica, Some(&seed), Some(address))
                .await?;
            let entry = blueprint
                .get(&replica)
                .cloned()
                .ok_or_else(|| OperatorError::Topology(format!("{} missing from blueprint", replica)))?;
            ctx.store
                .set(&replica, entry.recreated(replica_facts.node_id.clone()))
                .await?;
            report.succeeded.push(replica);
        }
    }

    info!(cluster = %ctx.name(), nodes = report.succeeded.len(), "Cluster initialized");
    Ok(report)
}

/// Delete every member this instance owns.
async fn clear_members(ctx: &ClusterContext) -> Result<()> {
    let members = with_timeout(
        "list members",
        ctx.config.member_timeout,
        ctx.provider.list_members(MemberSelector::All),
    )
    .await?;

    if members.is_empty() {
        return Ok(());
    }
    warn!(cluster = %ctx.name(), members = members.len(), "Deleting existing members");

    let deletions = members.iter().map(|m| {
        with_timeout(
            "delete member",
            ctx.config.member_timeout,
            ctx.provider.delete_member(&m.name),
        )
    });
    for result in join_all(deletions).await {
        result?;
    }
    Ok(())
}
