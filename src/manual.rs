//! Manual operations triggered from the admin surface.
//!
//! None of these take part in the lifecycle decisions. A forced reset only
//! rewrites the persisted state; the next tick does the actual work.

use tracing::{debug, info, warn};

const RESET_MESSAGE: &str = "reset requested by operator";

use crate::engine::ClusterContext;
use crate::error::{OperatorError, Result};
use crate::provider::{CommandOutput, MemberSelector, StatusSink};
use crate::resilience::with_timeout;
use crate::snapshot::TopologySnapshot;
use crate::status::{ClusterView, StatusReport};
use crate::types::LifecycleState;

/// Force the instance back to `Reset`. The next tick reinitializes it.
pub async fn force_reset(ctx: &ClusterContext, sink: &dyn StatusSink) -> Result<()> {
    warn!(cluster = %ctx.name(), "Forcing reset");
    // Node counts stay meaningful until the next tick rebuilds the cluster.
    let snapshot = match probe_all(ctx).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            debug!(cluster = %ctx.name(), error = %e, "Probe before reset failed");
            TopologySnapshot::new()
        }
    };
    let report = StatusReport::build(RESET_MESSAGE, &ctx.store.all(), &snapshot);
    sink.persist_state(LifecycleState::Reset, &report).await
}

/// Rebalance slots through a discovered healthy leader.
pub async fn rebalance(ctx: &ClusterContext) -> Result<CommandOutput> {
    let (address, _) = discover_leader(ctx).await?;
    info!(cluster = %ctx.name(), via = %address, "Manual rebalance");
    with_timeout(
        "rebalance slots",
        ctx.config.migration_timeout,
        ctx.admin.rebalance_slots(&address),
    )
    .await
}

/// Repair slot coverage through a discovered healthy leader.
pub async fn fix(ctx: &ClusterContext) -> Result<CommandOutput> {
    let (address, _) = discover_leader(ctx).await?;
    info!(cluster = %ctx.name(), via = %address, "Manual fix");
    with_timeout("fix cluster", ctx.config.migration_timeout, ctx.admin.fix_cluster(&address)).await
}

/// Fresh snapshot and blueprint, for diagnostics only.
pub async fn diagnostics(ctx: &ClusterContext, state: LifecycleState) -> Result<ClusterView> {
    let snapshot = probe_all(ctx).await?;
    Ok(ClusterView::new(ctx.name(), state, ctx.store.all(), snapshot))
}

async fn discover_leader(ctx: &ClusterContext) -> Result<(String, TopologySnapshot)> {
    let snapshot = probe_all(ctx).await?;
    let address = snapshot
        .healthy_leader_address()
        .ok_or(OperatorError::NoHealthyLeader)?;
    Ok((address, snapshot))
}

/// Probe every blueprint entry, or every live member when the blueprint is empty.
async fn probe_all(ctx: &ClusterContext) -> Result<TopologySnapshot> {
    let blueprint = ctx.store.load().await?;
    let names = if blueprint.is_empty() {
        with_timeout(
            "list members",
            ctx.config.member_timeout,
            ctx.provider.list_members(MemberSelector::All),
        )
        .await?
        .into_iter()
        .map(|m| m.name)
        .collect()
    } else {
        blueprint.names()
    };
    ctx.snapshot_builder().build(&names).await
}
