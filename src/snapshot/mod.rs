//! Topology snapshot: the live cluster as observed during one tick.
//!
//! A snapshot is rebuilt from scratch at the start of every tick and is never
//! persisted as ground truth. Every expected node gets an entry; nodes that
//! cannot be reached are recorded as [`NodeHealth::Unreachable`] rather than
//! left out, so "missing" and "never expected" stay distinguishable.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::provider::{ClusterAdmin, MemberHandle, MemberProvider, MemberSelector, PeerInfo};
use crate::resilience::with_timeout;
use crate::types::{MemberConfig, NodeHealth, Role, SlotRange};

/// Observed facts about one logical node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFacts {
    pub name: String,
    pub health: NodeHealth,
    pub address: Option<String>,
    pub node_id: Option<String>,
    /// Role reported by the node itself.
    pub role: Option<Role>,
    /// Leader the node reports replicating.
    pub leader_id: Option<String>,
    #[serde(default)]
    pub slots: Vec<SlotRange>,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
    /// Configuration the backing process runs with.
    pub config: Option<MemberConfig>,
}

impl NodeFacts {
    /// A node with no backing process or no answer.
    pub fn unreachable(name: impl Into<String>, handle: Option<&MemberHandle>) -> Self {
        Self {
            name: name.into(),
            health: NodeHealth::Unreachable,
            address: handle.and_then(|h| h.address.clone()),
            node_id: None,
            role: None,
            leader_id: None,
            slots: Vec::new(),
            peers: Vec::new(),
            config: handle.map(|h| h.config.clone()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.health.is_ok()
    }

    pub fn is_healthy_leader(&self) -> bool {
        self.is_ok() && self.role == Some(Role::Leader)
    }

    pub fn owned_slots(&self) -> u32 {
        self.slots.iter().map(SlotRange::len).sum()
    }
}

/// Point-in-time view of every expected node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySnapshot {
    nodes: BTreeMap<String, NodeFacts>,
}

impl TopologySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, facts: NodeFacts) {
        self.nodes.insert(facts.name.clone(), facts);
    }

    pub fn get(&self, name: &str) -> Option<&NodeFacts> {
        self.nodes.get(name)
    }

    pub fn is_ok(&self, name: &str) -> bool {
        self.nodes.get(name).is_some_and(NodeFacts::is_ok)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeFacts> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn healthy(&self) -> impl Iterator<Item = &NodeFacts> {
        self.nodes.values().filter(|n| n.is_ok())
    }

    /// Healthy nodes reporting the leader role.
    pub fn healthy_leaders(&self) -> Vec<&NodeFacts> {
        self.nodes.values().filter(|n| n.is_healthy_leader()).collect()
    }

    /// Address of a healthy leader, preferring one that owns slots.
    pub fn healthy_leader_address(&self) -> Option<String> {
        let leaders = self.healthy_leaders();
        leaders
            .iter()
            .find(|n| n.owned_slots() > 0)
            .or_else(|| leaders.first())
            .and_then(|n| n.address.clone())
    }

    /// Address of any healthy node other than `except`.
    pub fn healthy_address_except(&self, except: &str) -> Option<String> {
        self.healthy()
            .filter(|n| n.name != except)
            .find_map(|n| n.address.clone())
    }
}

/// Builds a [`TopologySnapshot`] by probing members concurrently.
pub struct SnapshotBuilder<'a> {
    provider: &'a dyn MemberProvider,
    admin: &'a dyn ClusterAdmin,
    probe_timeout: Duration,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(provider: &'a dyn MemberProvider, admin: &'a dyn ClusterAdmin, probe_timeout: Duration) -> Self {
        Self {
            provider,
            admin,
            probe_timeout,
        }
    }

    /// Probe every name in `expected`. All probes are joined before returning.
    pub async fn build(&self, expected: &[String]) -> Result<TopologySnapshot> {
        let members = with_timeout(
            "list members",
            self.probe_timeout,
            self.provider.list_members(MemberSelector::All),
        )
        .await?;
        let handles: HashMap<String, MemberHandle> =
            members.into_iter().map(|m| (m.name.clone(), m)).collect();

        let probes = expected
            .iter()
            .map(|name| self.probe(name, handles.get(name)));
        let facts = join_all(probes).await;

        let mut snapshot = TopologySnapshot::new();
        for node in facts {
            snapshot.insert(node);
        }

        info!(
            expected = expected.len(),
            healthy = snapshot.healthy().count(),
            "Topology snapshot built"
        );
        Ok(snapshot)
    }

    /// Probe a single node by name, looking its member up first.
    pub async fn probe_one(&self, name: &str) -> NodeFacts {
        let listed = with_timeout(
            "list member",
            self.probe_timeout,
            self.provider.list_members(MemberSelector::Name(name.to_string())),
        )
        .await;
        match listed {
            Ok(members) => self.probe(name, members.first()).await,
            Err(e) => {
                debug!(node = %name, error = %e, "Member lookup failed");
                NodeFacts::unreachable(name, None)
            }
        }
    }

    async fn probe(&self, name: &str, handle: Option<&MemberHandle>) -> NodeFacts {
        let Some(handle) = handle else {
            debug!(node = %name, "No backing member");
            return NodeFacts::unreachable(name, None);
        };
        let Some(address) = handle.address.clone() else {
            debug!(node = %name, "Member has no address yet");
            return NodeFacts::unreachable(name, Some(handle));
        };

        let health = tokio::time::timeout(self.probe_timeout, self.provider.probe_health(handle))
            .await
            .unwrap_or(NodeHealth::Unreachable);
        if !health.is_ok() {
            debug!(node = %name, "Health probe failed");
            return NodeFacts::unreachable(name, Some(handle));
        }

        match with_timeout("query topology", self.probe_timeout, self.admin.query_topology(&address)).await {
            Ok(topology) => NodeFacts {
                name: name.to_string(),
                health: NodeHealth::Ok,
                address: Some(address),
                node_id: Some(topology.id),
                role: Some(topology.role),
                leader_id: topology.leader_id,
                slots: topology.slots,
                peers: topology.peers,
                config: Some(handle.config.clone()),
            },
            Err(e) => {
                debug!(node = %name, error = %e, "Topology query failed");
                NodeFacts::unreachable(name, Some(handle))
            }
        }
    }
}
