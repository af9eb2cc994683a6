//! Status report and diagnostic view published after every tick.

use serde::{Deserialize, Serialize};

use crate::blueprint::Blueprint;
use crate::snapshot::TopologySnapshot;
use crate::types::{LifecycleState, NodeHealth, Role};

/// Per-node line of the status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    pub role: Role,
    pub health: NodeHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub owned_slots: u32,
}

/// Human-readable summary persisted alongside the lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub message: String,
    pub total_nodes: u32,
    pub ready_nodes: u32,
    pub healthy_leaders: u32,
    pub nodes: Vec<NodeStatus>,
}

impl StatusReport {
    /// Summarize a blueprint against the snapshot of the same tick.
    pub fn build(message: impl Into<String>, blueprint: &Blueprint, snapshot: &TopologySnapshot) -> Self {
        let nodes: Vec<NodeStatus> = blueprint
            .iter()
            .map(|(name, entry)| {
                let facts = snapshot.get(name);
                NodeStatus {
                    name: name.clone(),
                    role: entry.role,
                    health: facts.map_or(NodeHealth::Unknown, |f| f.health),
                    address: facts.and_then(|f| f.address.clone()),
                    parent: entry.parent.clone(),
                    owned_slots: facts.map_or(0, |f| f.owned_slots()),
                }
            })
            .collect();

        Self {
            message: message.into(),
            total_nodes: nodes.len() as u32,
            ready_nodes: nodes.iter().filter(|n| n.health.is_ok()).count() as u32,
            healthy_leaders: snapshot.healthy_leaders().len() as u32,
            nodes,
        }
    }
}

/// Read-only diagnostic mirror: what the operator intended and what it saw.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub cluster: String,
    pub state: LifecycleState,
    pub blueprint: Blueprint,
    pub snapshot: TopologySnapshot,
    pub generated_at: String,
}

impl ClusterView {
    pub fn new(
        cluster: impl Into<String>,
        state: LifecycleState,
        blueprint: Blueprint,
        snapshot: TopologySnapshot,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            state,
            blueprint,
            snapshot,
            generated_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
