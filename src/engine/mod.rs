//! Corrective engines and the per-instance context they run against.
//!
//! Each engine reports what it did in an [`EngineReport`]. Partial success is
//! not an error: members that could not be handled are listed as failed or
//! pending and are retried on a later tick.

pub mod init;
pub mod recovery;
pub mod scale;
pub mod update;

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::blueprint::BlueprintStore;
use crate::config::OperatorConfig;
use crate::error::{OperatorError, Result};
use crate::provider::{ClusterAdmin, MemberHandle, MemberProvider};
use crate::resilience::{with_timeout, RetryExecutor};
use crate::snapshot::{NodeFacts, SnapshotBuilder, TopologySnapshot};
use crate::types::{ClusterDeclaration, Role};

/// Everything one reconciliation pass of one cluster instance needs.
///
/// Built fresh for every tick; nothing in it is shared with other instances.
#[derive(Clone)]
pub struct ClusterContext {
    pub declaration: ClusterDeclaration,
    pub config: OperatorConfig,
    pub provider: Arc<dyn MemberProvider>,
    pub admin: Arc<dyn ClusterAdmin>,
    pub store: Arc<BlueprintStore>,
}

impl ClusterContext {
    pub fn new(
        declaration: ClusterDeclaration,
        config: OperatorConfig,
        provider: Arc<dyn MemberProvider>,
        admin: Arc<dyn ClusterAdmin>,
        store: Arc<BlueprintStore>,
    ) -> Self {
        Self {
            declaration,
            config,
            provider,
            admin,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    pub fn snapshot_builder(&self) -> SnapshotBuilder<'_> {
        SnapshotBuilder::new(self.provider.as_ref(), self.admin.as_ref(), self.config.probe_timeout)
    }

    /// Delete any existing process for `name` and create a fresh one.
    pub async fn recreate_member(&self, name: &str, role: Role) -> Result<MemberHandle> {
        with_timeout(
            "delete member",
            self.config.member_timeout,
            self.provider.delete_member(name),
        )
        .await?;

        let handle = with_timeout(
            "create member",
            self.config.member_timeout,
            self.provider.create_member(name, role, &self.declaration.member),
        )
        .await?;

        if handle.address.is_none() {
            return Err(OperatorError::Member(format!("{} has no address after creation", name)));
        }
        debug!(cluster = %self.name(), node = %name, role = %role, "Member created");
        Ok(handle)
    }

    /// Probe `name` until it answers, within the settle budget.
    pub async fn wait_reachable(&self, name: &str) -> Result<NodeFacts> {
        let executor = RetryExecutor::new(self.config.settle_retry());
        executor
            .execute(|| async move {
                let facts = self.snapshot_builder().probe_one(name).await;
                if facts.is_ok() {
                    Ok(facts)
                } else {
                    Err(OperatorError::Unreachable(name.to_string()))
                }
            })
            .await
    }

    pub async fn join(&self, target: &str, existing: &str) -> Result<()> {
        with_timeout("join", self.config.command_timeout, self.admin.join(target, existing)).await
    }

    /// Attach a replica, retrying while the new node learns about its leader.
    pub async fn attach_replica(&self, target: &str, leader: &str) -> Result<()> {
        let executor = RetryExecutor::new(self.config.settle_retry());
        executor
            .execute(|| {
                with_timeout(
                    "assign replica",
                    self.config.command_timeout,
                    self.admin.assign_replica_of(target, leader),
                )
            })
            .await
    }

    pub async fn forget(&self, target: &str, node_id: &str) -> Result<()> {
        with_timeout("forget", self.config.command_timeout, self.admin.forget(target, node_id)).await
    }

    /// Recreate `name`, join it through `seed` and attach it to `leader` when it is a replica.
    ///
    /// Returns the facts of the new process, its node identifier included.
    pub async fn bring_up(
        &self,
        name: &str,
        role: Role,
        seed: Option<&str>,
        leader: Option<&str>,
    ) -> Result<NodeFacts> {
        self.recreate_member(name, role).await?;
        let facts = self.wait_reachable(name).await?;
        let address = facts
            .address
            .clone()
            .ok_or_else(|| OperatorError::Member(format!("{} has no address", name)))?;

        match seed {
            Some(seed) if seed != address => self.join(&address, seed).await?,
            Some(_) => {}
            None => debug!(cluster = %self.name(), node = %name, "No seed member, starting standalone"),
        }

        if role == Role::Replica {
            let leader = leader.ok_or_else(|| {
                OperatorError::Topology(format!("replica {} has no reachable leader", name))
            })?;
            self.attach_replica(&address, leader).await?;
        }

        info!(cluster = %self.name(), node = %name, role = %role, address = %address, "Member brought up");
        Ok(facts)
    }

    /// Delete the process behind `name`, make every healthy peer forget it and
    /// drop its blueprint entry.
    pub async fn retire(&self, name: &str, snapshot: &TopologySnapshot) -> Result<()> {
        let node_id = self
            .store
            .get(name)
            .and_then(|e| e.node_id)
            .or_else(|| snapshot.get(name).and_then(|f| f.node_id.clone()));

        with_timeout(
            "delete member",
            self.config.member_timeout,
            self.provider.delete_member(name),
        )
        .await?;

        if let Some(node_id) = node_id {
            for peer in snapshot.healthy().filter(|n| n.name != name) {
                let Some(address) = peer.address.as_deref() else {
                    continue;
                };
                if let Err(e) = self.forget(address, &node_id).await {
                    debug!(node = %name, peer = %peer.name, error = %e, "Forget failed");
                }
            }
        }

        self.store.delete(name).await?;
        info!(cluster = %self.name(), node = %name, "Member retired");
        Ok(())
    }
}

/// What an engine did during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub action: &'static str,
    /// Members handled successfully.
    pub succeeded: Vec<String>,
    /// Members that failed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Members that need attention but were deliberately left for a later tick.
    pub pending: Vec<String>,
    /// Cluster-wide commands issued (forget, fix, rebalance, ...).
    pub commands: Vec<String>,
}

impl EngineReport {
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn fail(&mut self, node: impl Into<String>, error: &OperatorError) {
        let node = node.into();
        warn!(action = self.action, node = %node, error = %error, "Engine step failed");
        self.failed.push((node, error.to_string()));
    }

    /// Nothing failed and nothing was left pending.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.pending.is_empty()
    }

    /// Number of member-level mutations performed.
    pub fn mutations(&self) -> usize {
        self.succeeded.len() + self.commands.len()
    }

    pub fn summary(&self) -> String {
        let mut parts = vec![format!("{}: {} done", self.action, self.succeeded.len())];
        if !self.failed.is_empty() {
            let names: Vec<&str> = self.failed.iter().map(|(n, _)| n.as_str()).collect();
            parts.push(format!("{} failed ({})", self.failed.len(), names.join(", ")));
        }
        if !self.pending.is_empty() {
            parts.push(format!("{} pending ({})", self.pending.len(), self.pending.join(", ")));
        }
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_summary() {
        let mut report = EngineReport::new("recovery");
        report.succeeded.push("leader-0".into());
        assert!(report.is_clean());

        report.fail("leader-1", &OperatorError::Unreachable("leader-1".into()));
        report.pending.push("leader-2".into());
        assert!(!report.is_clean());
        assert_eq!(
            report.summary(),
            "recovery: 1 done, 1 failed (leader-1), 1 pending (leader-2)"
        );
    }
}
