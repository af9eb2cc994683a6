//! Interfaces to the collaborators the reconciliation core drives.
//!
//! The core never talks to Kubernetes or to Redis directly. The operator binary
//! supplies Pod-, ConfigMap- and `redis-cli`-backed implementations; the test
//! suite supplies an in-memory simulated cluster.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::status::{ClusterView, StatusReport};
use crate::types::{LifecycleState, MemberConfig, NodeHealth, Role, SlotRange};

/// A running (or scheduled) member process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberHandle {
    /// Logical node name.
    pub name: String,
    /// Role the member was created with.
    pub role: Role,
    /// `host:port` once the process has an address.
    pub address: Option<String>,
    /// Configuration the process is actually running with.
    pub config: MemberConfig,
}

/// Which members to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberSelector {
    All,
    Name(String),
}

impl MemberSelector {
    pub fn matches(&self, handle: &MemberHandle) -> bool {
        match self {
            MemberSelector::All => true,
            MemberSelector::Name(name) => &handle.name == name,
        }
    }
}

/// Process lifecycle provider (Pods in production).
#[async_trait]
pub trait MemberProvider: Send + Sync {
    /// Create the backing process for `name`. Returns once it has an address.
    async fn create_member(&self, name: &str, role: Role, spec: &MemberConfig) -> Result<MemberHandle>;

    /// Delete the backing process for `name`. Deleting a missing member succeeds.
    async fn delete_member(&self, name: &str) -> Result<()>;

    /// List members belonging to this cluster instance.
    async fn list_members(&self, selector: MemberSelector) -> Result<Vec<MemberHandle>>;

    /// Liveness of a single member.
    async fn probe_health(&self, handle: &MemberHandle) -> NodeHealth;
}

/// A peer as reported in a node's view of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
    pub role: Role,
    pub leader_id: Option<String>,
    /// Flagged `fail`, `fail?` or `noaddr` by the reporting node.
    pub failed: bool,
    #[serde(default)]
    pub slots: Vec<SlotRange>,
}

/// A node's answer to a topology query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTopology {
    /// Cluster node identifier of the queried node.
    pub id: String,
    pub role: Role,
    /// Identifier of the leader this node replicates, for replicas.
    pub leader_id: Option<String>,
    /// Slots owned by the queried node.
    pub slots: Vec<SlotRange>,
    /// Every other node the queried node knows about.
    pub peers: Vec<PeerInfo>,
}

impl NodeTopology {
    pub fn owned_slots(&self) -> u32 {
        self.slots.iter().map(SlotRange::len).sum()
    }
}

/// Result of a long-running cluster command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub ok: bool,
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { ok: true, output: output.into() }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self { ok: false, output: output.into() }
    }
}

/// Cluster administration client. Addresses are `host:port`.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Make `target` meet the cluster `existing` belongs to.
    async fn join(&self, target: &str, existing: &str) -> Result<()>;

    /// Make `target` drop `node_id` from its membership table.
    async fn forget(&self, target: &str, node_id: &str) -> Result<()>;

    /// Make `target` replicate the leader listening on `leader`.
    async fn assign_replica_of(&self, target: &str, leader: &str) -> Result<()>;

    /// Redistribute slots evenly across every leader, empty ones included.
    async fn rebalance_slots(&self, any_healthy: &str) -> Result<CommandOutput>;

    /// Repair open or uncovered slots.
    async fn fix_cluster(&self, any_healthy: &str) -> Result<CommandOutput>;

    /// Role, peers and owned slots as seen by `target`.
    async fn query_topology(&self, target: &str) -> Result<NodeTopology>;

    /// Give `target` ownership of unassigned slot ranges.
    async fn assign_slots(&self, target: &str, ranges: &[SlotRange]) -> Result<()>;

    /// Move every slot owned by `departing` leaders onto the remaining leaders.
    async fn drain_slots(&self, any_healthy: &str, departing: &[String]) -> Result<CommandOutput>;

    /// Promote the replica on `replica` in place of its leader.
    async fn failover(&self, replica: &str) -> Result<()>;
}

/// Write path for the declaration's status.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Persist the lifecycle state and a human-readable report.
    async fn persist_state(&self, state: LifecycleState, report: &StatusReport) -> Result<()>;

    /// Publish the diagnostic view. Never read back by the core.
    async fn publish_view(&self, view: &ClusterView) -> Result<()>;
}
