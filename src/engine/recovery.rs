//! Recovery engine: bring the live cluster back in line with the blueprint.
//!
//! Steps, in order:
//!
//! 1. Re-parent replicas whose intended leader entry is gone.
//! 2. Adopt failovers the cluster performed on its own.
//! 3. Grow or shrink replica sets to the declared size.
//! 4. Replace lost nodes under the same logical name, leaders first.
//! 5. Re-attach healthy replicas following the wrong leader.
//! 6. Forget node identifiers the blueprint no longer knows.
//! 7. Fix slot coverage once every leader is accounted for.
//!
//! Only nodes past the loss threshold are replaced. Nodes that missed fewer
//! probes are reported as pending and looked at again on the next tick.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::{ClusterContext, EngineReport};
use crate::blueprint::BlueprintEntry;
use crate::error::{OperatorError, Result};
use crate::evaluator;
use crate::resilience::with_timeout;
use crate::snapshot::TopologySnapshot;
use crate::types::{group_of, replica_index_of, replica_name, Role};

/// Addresses of members known to be reachable during this pass.
#[derive(Debug, Default)]
struct LiveMembers {
    addresses: BTreeMap<String, String>,
}

impl LiveMembers {
    fn from_snapshot(snapshot: &TopologySnapshot) -> Self {
        let addresses = snapshot
            .healthy()
            .filter_map(|n| n.address.clone().map(|a| (n.name.clone(), a)))
            .collect();
        Self { addresses }
    }

    fn insert(&mut self, name: &str, address: String) {
        self.addresses.insert(name.to_string(), address);
    }

    fn address_of(&self, name: &str) -> Option<String> {
        self.addresses.get(name).cloned()
    }

    fn members(&self) -> Vec<(String, String)> {
        self.addresses
            .iter()
            .map(|(n, a)| (n.clone(), a.clone()))
            .collect()
    }

    fn any_except(&self, name: &str) -> Option<String> {
        self.addresses
            .iter()
            .find(|(n, _)| n.as_str() != name)
            .map(|(_, a)| a.clone())
    }
}

/// Run one recovery pass against the snapshot of the current tick.
pub async fn recover(ctx: &ClusterContext, snapshot: &TopologySnapshot) -> Result<EngineReport> {
    let mut report = EngineReport::new("recovery");
    let mut live = LiveMembers::from_snapshot(snapshot);

    reparent_orphans(ctx, &mut report).await?;
    adopt_failovers(ctx, snapshot, &mut report).await?;
    resize_replica_sets(ctx, snapshot, &mut live, &mut report).await?;
    let replaced = replace_lost(ctx, snapshot, &mut live, &mut report).await;
    reattach_replicas(ctx, snapshot, &live, &replaced, &mut report).await;
    forget_stale(ctx, &live.members(), &mut report).await;
    repair_slots(ctx, snapshot, &live, &replaced, &mut report).await;

    let handled: BTreeSet<&String> = report
        .succeeded
        .iter()
        .chain(report.failed.iter().map(|(n, _)| n))
        .chain(report.pending.iter())
        .collect();
    let suspects: Vec<String> = evaluator::suspect_nodes(&ctx.store.all(), snapshot, ctx.config.lost_node_threshold)
        .into_iter()
        .filter(|n| !handled.contains(n))
        .collect();
    report.pending.extend(suspects);

    info!(cluster = %ctx.name(), summary = %report.summary(), "Recovery pass finished");
    Ok(report)
}

async fn reparent_orphans(ctx: &ClusterContext, report: &mut EngineReport) -> Result<()> {
    let blueprint = ctx.store.all();
    for orphan in blueprint.orphans() {
        let Some(group) = group_of(&orphan) else {
            warn!(cluster = %ctx.name(), node = %orphan, "Orphan outside any leader group");
            continue;
        };
        let current = ctx.store.all();
        match current.leader_of_group(group) {
            Some(leader) => {
                warn!(cluster = %ctx.name(), node = %orphan, leader = %leader, "Re-parenting orphaned replica");
                let mut entry = current
                    .get(&orphan)
                    .cloned()
                    .unwrap_or_else(|| BlueprintEntry::replica_of(leader.clone()));
                entry.parent = Some(leader);
                ctx.store.set(&orphan, entry).await?;
            }
            None => {
                warn!(cluster = %ctx.name(), node = %orphan, group, "Promoting orphan of leaderless group");
                ctx.store.set_many(current.with_promotion(group, &orphan)).await?;
            }
        }
        report.commands.push(format!("re-parented {}", orphan));
    }
    Ok(())
}

/// Swap blueprint roles when a replica has taken over its leader's slots.
async fn adopt_failovers(ctx: &ClusterContext, snapshot: &TopologySnapshot, report: &mut EngineReport) -> Result<()> {
    let blueprint = ctx.store.all();
    let serving = |name: &str| {
        snapshot
            .get(name)
            .is_some_and(|f| f.is_healthy_leader() && f.owned_slots() > 0)
    };

    for group in blueprint.groups() {
        let Some(intended) = blueprint.leader_of_group(group) else {
            continue;
        };
        if serving(intended.as_str()) {
            continue;
        }
        let promoted = blueprint
            .group_members(group)
            .into_iter()
            .find(|name| name != &intended && serving(name.as_str()));
        if let Some(promoted) = promoted {
            warn!(
                cluster = %ctx.name(),
                group,
                from = %intended,
                to = %promoted,
                "Adopting failover performed by the cluster"
            );
            ctx.store
                .set_many(ctx.store.all().with_promotion(group, &promoted))
                .await?;
            report.commands.push(format!("adopted {} as leader", promoted));
        }
    }
    Ok(())
}

async fn resize_replica_sets(
    ctx: &ClusterContext,
    snapshot: &TopologySnapshot,
    live: &mut LiveMembers,
    report: &mut EngineReport,
) -> Result<()> {
    let want = ctx.declaration.replicas_per_leader as usize;
    let blueprint = ctx.store.all();

    for leader in blueprint.leaders() {
        let Some(group) = group_of(&leader) else {
            continue;
        };
        let mut replicas = blueprint.replicas_of(&leader);

        if replicas.len() < want {
            for _ in replicas.len()..want {
                let name = replica_name(group, ctx.store.all().next_replica_index(group));
                let entry = BlueprintEntry::replica_of(leader.clone());
                ctx.store.set(&name, entry.clone()).await?;
                info!(cluster = %ctx.name(), node = %name, leader = %leader, "Adding replica");

                let Some(leader_address) = live.address_of(&leader) else {
                    report.pending.push(name);
                    continue;
                };
                match ctx
                    .bring_up(&name, Role::Replica, Some(&leader_address), Some(&leader_address))
                    .await
                {
                    Ok(facts) => {
                        if let Some(address) = facts.address.clone() {
                            live.insert(&name, address);
                        }
                        ctx.store.set(&name, entry.recreated(facts.node_id)).await?;
                        report.succeeded.push(name);
                    }
                    Err(e) => report.fail(name, &e),
                }
            }
        } else if replicas.len() > want {
            let surplus = replicas.len() - want;
            replicas.sort_by_key(|name| Reverse(replica_index_of(name)));
            for name in replicas.into_iter().take(surplus) {
                info!(cluster = %ctx.name(), node = %name, leader = %leader, "Removing surplus replica");
                match ctx.retire(&name, snapshot).await {
                    Ok(()) => report.commands.push(format!("removed {}", name)),
                    Err(e) => report.fail(name, &e),
                }
            }
        }
    }
    Ok(())
}

/// Replace every lost node. Returns the names actually replaced.
async fn replace_lost(
    ctx: &ClusterContext,
    snapshot: &TopologySnapshot,
    live: &mut LiveMembers,
    report: &mut EngineReport,
) -> BTreeSet<String> {
    let blueprint = ctx.store.all();
    let mut lost: Vec<String> = evaluator::lost_nodes(&blueprint, snapshot, ctx.config.lost_node_threshold)
        .into_iter()
        .filter(|name| !report.succeeded.contains(name))
        .collect();
    // Leaders first so their replicas can attach to the replacement.
    lost.sort_by_key(|name| !blueprint.get(name).is_some_and(BlueprintEntry::is_leader));

    let mut replaced = BTreeSet::new();
    for name in lost {
        let Some(entry) = ctx.store.get(&name) else {
            continue;
        };
        let leader_address = match (&entry.role, entry.parent.as_deref()) {
            (Role::Replica, Some(parent)) => match live.address_of(parent) {
                Some(address) => Some(address),
                None => {
                    let error = OperatorError::Topology(format!("leader {} of {} is not reachable", parent, name));
                    report.fail(name, &error);
                    continue;
                }
            },
            _ => None,
        };
        let seed = live.any_except(&name);

        warn!(cluster = %ctx.name(), node = %name, role = %entry.role, misses = entry.misses, "Replacing lost node");
        match ctx
            .bring_up(&name, entry.role, seed.as_deref(), leader_address.as_deref())
            .await
        {
            Ok(facts) => {
                if let Some(address) = facts.address.clone() {
                    live.insert(&name, address);
                }
                if let Err(e) = ctx.store.set(&name, entry.recreated(facts.node_id)).await {
                    report.fail(name, &e);
                    continue;
                }
                replaced.insert(name.clone());
                report.succeeded.push(name);
            }
            Err(e) => report.fail(name, &e),
        }
    }
    replaced
}

/// Point healthy replicas at their intended leader.
async fn reattach_replicas(
    ctx: &ClusterContext,
    snapshot: &TopologySnapshot,
    live: &LiveMembers,
    replaced: &BTreeSet<String>,
    report: &mut EngineReport,
) {
    let blueprint = ctx.store.all();
    for (name, entry) in blueprint.iter().filter(|(_, e)| e.role == Role::Replica) {
        if replaced.contains(name) {
            continue;
        }
        let Some(facts) = snapshot.get(name).filter(|f| f.is_ok()) else {
            continue;
        };
        let Some(parent) = entry.parent.as_deref() else {
            continue;
        };
        let parent_id = blueprint.get(parent).and_then(|p| p.node_id.clone());
        if facts.role == Some(Role::Replica) && parent_id.is_some() && facts.leader_id == parent_id {
            continue;
        }
        if facts.owned_slots() > 0 {
            warn!(cluster = %ctx.name(), node = %name, slots = facts.owned_slots(), "Replica owns slots, not re-attaching");
            report.pending.push(name.clone());
            continue;
        }
        let (Some(address), Some(leader_address)) = (facts.address.as_deref(), live.address_of(parent)) else {
            report.pending.push(name.clone());
            continue;
        };

        info!(cluster = %ctx.name(), node = %name, leader = %parent, "Re-attaching replica");
        match ctx.attach_replica(address, &leader_address).await {
            Ok(()) => report.succeeded.push(name.clone()),
            Err(e) => report.fail(name.clone(), &e),
        }
    }
}

/// Make every listed node forget identifiers that no blueprint entry carries.
///
/// Peers are queried fresh: a node that joined during this pass may have
/// learned identifiers the snapshot never saw.
pub async fn forget_stale(ctx: &ClusterContext, members: &[(String, String)], report: &mut EngineReport) {
    let known = ctx.store.all().known_node_ids();
    for (name, address) in members {
        let topology = match with_timeout(
            "query topology",
            ctx.config.probe_timeout,
            ctx.admin.query_topology(address),
        )
        .await
        {
            Ok(topology) => topology,
            Err(e) => {
                debug!(cluster = %ctx.name(), node = %name, error = %e, "Skipping forget, topology unavailable");
                continue;
            }
        };
        for peer in topology.peers.iter().filter(|p| !known.contains(&p.id)) {
            match ctx.forget(address, &peer.id).await {
                Ok(()) => {
                    debug!(cluster = %ctx.name(), node = %name, forgotten = %peer.id, "Forgot stale node");
                    report.commands.push(format!("{} forgot {}", name, peer.id));
                }
                Err(e) => {
                    debug!(cluster = %ctx.name(), node = %name, stale = %peer.id, error = %e, "Forget failed");
                }
            }
        }
    }
}

/// Fix uncovered or doubly owned slots, or hand a replaced leader its share,
/// then even the distribution out.
async fn repair_slots(
    ctx: &ClusterContext,
    snapshot: &TopologySnapshot,
    live: &LiveMembers,
    replaced: &BTreeSet<String>,
    report: &mut EngineReport,
) {
    let coverage = evaluator::slot_coverage(snapshot);
    let blueprint = ctx.store.all();
    // A replaced leader starts empty even when its slots were moved elsewhere.
    let leader_replaced = replaced
        .iter()
        .any(|name| blueprint.get(name).is_some_and(|e| e.is_leader()));
    if coverage.is_full() && !leader_replaced {
        return;
    }

    let waiting: Vec<String> = blueprint
        .leaders()
        .into_iter()
        .filter(|l| !snapshot.is_ok(l) && !replaced.contains(l))
        .collect();
    if !waiting.is_empty() {
        debug!(cluster = %ctx.name(), waiting = ?waiting, "Slot repair deferred until every leader is back");
        return;
    }

    let Some(address) = snapshot
        .healthy_leader_address()
        .or_else(|| blueprint.leaders().iter().find_map(|l| live.address_of(l)))
    else {
        report.fail("cluster", &OperatorError::NoHealthyLeader);
        return;
    };

    warn!(
        cluster = %ctx.name(),
        missing = coverage.missing.len(),
        overlapping = coverage.overlapping.len(),
        out_of_range = coverage.out_of_range.len(),
        "Repairing slot coverage"
    );
    match with_timeout("fix cluster", ctx.config.migration_timeout, ctx.admin.fix_cluster(&address)).await {
        Ok(output) if output.ok => report.commands.push("fix".to_string()),
        Ok(output) => {
            report.fail("cluster", &OperatorError::Command(output.output));
            return;
        }
        Err(e) => {
            report.fail("cluster", &e);
            return;
        }
    }

    match with_timeout(
        "rebalance slots",
        ctx.config.migration_timeout,
        ctx.admin.rebalance_slots(&address),
    )
    .await
    {
        Ok(output) if output.ok => report.commands.push("rebalance".to_string()),
        Ok(output) => report.fail("cluster", &OperatorError::Command(output.output)),
        Err(e) => report.fail("cluster", &e),
    }
}
