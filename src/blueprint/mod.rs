//! The blueprint: durable record of the intended cluster topology.
//!
//! One [`BlueprintEntry`] per logical node name. The blueprint is the only
//! place that remembers a node once it has disappeared from the live system,
//! so it is reconciled against observations and never the other way round.

mod store;

pub use store::{BlueprintStore, KvBackend, MemoryKv};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{OperatorError, Result};
use crate::provider::MemberHandle;
use crate::types::{group_of, leader_name, replica_index_of, replica_name, NodeHealth, Role};

/// Intended state of one logical node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintEntry {
    pub role: Role,
    /// Leader this node replicates, for replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Last observed health.
    #[serde(default)]
    pub health: NodeHealth,
    /// Consecutive ticks this node was observed as not OK.
    #[serde(default)]
    pub misses: u32,
    /// Cluster node identifier of the process currently backing this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl BlueprintEntry {
    pub fn leader() -> Self {
        Self {
            role: Role::Leader,
            parent: None,
            health: NodeHealth::Unknown,
            misses: 0,
            node_id: None,
        }
    }

    pub fn replica_of(parent: impl Into<String>) -> Self {
        Self {
            role: Role::Replica,
            parent: Some(parent.into()),
            health: NodeHealth::Unknown,
            misses: 0,
            node_id: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Fresh markers after the backing process was (re)created.
    pub fn recreated(mut self, node_id: Option<String>) -> Self {
        self.node_id = node_id;
        self.health = NodeHealth::Ok;
        self.misses = 0;
        self
    }
}

/// The full set of blueprint entries, keyed by logical node name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blueprint {
    entries: BTreeMap<String, BlueprintEntry>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic blueprint for `leaders` groups of one leader plus `replicas` replicas.
    pub fn generate(leaders: u32, replicas: u32) -> Self {
        let mut blueprint = Self::new();
        for group in 0..leaders {
            for (name, entry) in Self::group_entries(group, replicas) {
                blueprint.insert(name, entry);
            }
        }
        blueprint
    }

    /// Entries for a brand new leader group.
    pub fn group_entries(group: u32, replicas: u32) -> Vec<(String, BlueprintEntry)> {
        let leader = leader_name(group);
        let mut entries = vec![(leader.clone(), BlueprintEntry::leader())];
        for index in 0..replicas {
            entries.push((replica_name(group, index), BlueprintEntry::replica_of(leader.clone())));
        }
        entries
    }

    /// Rebuild intended topology from the labels of live members.
    ///
    /// Used when the store is empty outside (re)initialization. Replicas are
    /// attached to the leader of their group; groups without a leader promote
    /// their first replica.
    pub fn adopt(members: &[MemberHandle]) -> Self {
        let mut blueprint = Self::new();
        for member in members.iter().filter(|m| group_of(&m.name).is_some()) {
            if member.role == Role::Leader {
                blueprint.insert(member.name.clone(), BlueprintEntry::leader());
            }
        }
        for member in members.iter().filter(|m| m.role == Role::Replica) {
            let Some(group) = group_of(&member.name) else {
                continue;
            };
            let entry = match blueprint.leader_of_group(group) {
                Some(leader) => BlueprintEntry::replica_of(leader),
                None => BlueprintEntry::leader(),
            };
            blueprint.insert(member.name.clone(), entry);
        }
        blueprint
    }

    pub fn get(&self, name: &str) -> Option<&BlueprintEntry> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: String, entry: BlueprintEntry) {
        self.entries.insert(name, entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<BlueprintEntry> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BlueprintEntry)> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Leader names ordered by group index.
    pub fn leaders(&self) -> Vec<String> {
        let mut leaders: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_leader())
            .map(|(name, _)| name.clone())
            .collect();
        leaders.sort_by_key(|name| (group_of(name), name.clone()));
        leaders
    }

    /// Replica names whose intended parent is `leader`.
    pub fn replicas_of(&self, leader: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.role == Role::Replica && e.parent.as_deref() == Some(leader))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every group index present.
    pub fn groups(&self) -> BTreeSet<u32> {
        self.entries.keys().filter_map(|name| group_of(name)).collect()
    }

    /// Names belonging to `group`: replicas first, leader last.
    pub fn group_members(&self, group: u32) -> Vec<String> {
        let mut members: Vec<(bool, String)> = self
            .entries
            .iter()
            .filter(|(name, _)| group_of(name) == Some(group))
            .map(|(name, e)| (e.is_leader(), name.clone()))
            .collect();
        members.sort();
        members.into_iter().map(|(_, name)| name).collect()
    }

    /// Current leader of `group`.
    pub fn leader_of_group(&self, group: u32) -> Option<String> {
        self.entries
            .iter()
            .find(|(name, e)| e.is_leader() && group_of(name) == Some(group))
            .map(|(name, _)| name.clone())
    }

    /// Index for the next leader group to add.
    pub fn next_group(&self) -> u32 {
        self.groups().last().map_or(0, |g| g + 1)
    }

    /// Lowest replica slot in `group` without an entry.
    pub fn next_replica_index(&self, group: u32) -> u32 {
        let used: BTreeSet<u32> = self
            .entries
            .keys()
            .filter(|name| group_of(name) == Some(group))
            .filter_map(|name| replica_index_of(name))
            .collect();
        (0..).find(|i| !used.contains(i)).unwrap_or(0)
    }

    /// Names in `group` after promoting `new_leader`: every other member replicates it.
    pub fn with_promotion(&self, group: u32, new_leader: &str) -> Vec<(String, BlueprintEntry)> {
        self.group_members(group)
            .into_iter()
            .filter_map(|name| {
                let mut entry = self.entries.get(&name)?.clone();
                if name == new_leader {
                    entry.role = Role::Leader;
                    entry.parent = None;
                } else {
                    entry.role = Role::Replica;
                    entry.parent = Some(new_leader.to_string());
                }
                Some((name, entry))
            })
            .collect()
    }

    /// Check structural invariants: every replica's parent is a leader entry.
    pub fn validate(&self) -> Result<()> {
        for (name, entry) in &self.entries {
            match entry.role {
                Role::Leader => {
                    if entry.parent.is_some() {
                        return Err(OperatorError::Topology(format!(
                            "leader {} has a parent",
                            name
                        )));
                    }
                }
                Role::Replica => {
                    let parent = entry.parent.as_deref().ok_or_else(|| {
                        OperatorError::Topology(format!("replica {} has no parent", name))
                    })?;
                    match self.entries.get(parent) {
                        Some(p) if p.is_leader() => {}
                        _ => {
                            return Err(OperatorError::Topology(format!(
                                "replica {} points to {} which is not a leader",
                                name, parent
                            )))
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Replicas whose parent does not exist or is not a leader.
    pub fn orphans(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.role == Role::Replica)
            .filter(|(_, e)| {
                !matches!(
                    e.parent.as_deref().and_then(|p| self.entries.get(p)),
                    Some(parent) if parent.is_leader()
                )
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every node identifier recorded in the blueprint.
    pub fn known_node_ids(&self) -> BTreeSet<String> {
        self.entries.values().filter_map(|e| e.node_id.clone()).collect()
    }
}
