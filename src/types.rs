//! Core types shared by the reconciliation engines.
//!
//! Node names are stable logical identities. A leader group `i` consists of the
//! node `leader-<i>` plus `leader-<i>-replica-<j>` for each replica `j`. The
//! group index survives failovers: after a replica is promoted, the blueprint
//! swaps roles inside the group but the names never change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{OperatorError, Result};

/// Total number of hash slots in the cluster key space.
pub const SLOT_COUNT: u16 = 16384;

/// Role of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns a subset of the slot space.
    Leader,
    /// Mirrors a single leader.
    Replica,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Replica => "replica",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "leader" | "master" => Ok(Role::Leader),
            "replica" | "slave" | "follower" => Ok(Role::Replica),
            other => Err(OperatorError::Topology(format!("unknown role '{}'", other))),
        }
    }
}

/// Health of a node, as probed or as last recorded in the blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeHealth {
    Ok,
    Unreachable,
    #[default]
    Unknown,
}

impl NodeHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, NodeHealth::Ok)
    }
}

/// Lifecycle state of one cluster instance.
///
/// Stored on the declaration's status as a plain string; an empty or missing
/// field means [`LifecycleState::NotExists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    NotExists,
    Reset,
    Ready,
    Recovering,
    Updating,
    Scale,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::NotExists,
        LifecycleState::Reset,
        LifecycleState::Ready,
        LifecycleState::Recovering,
        LifecycleState::Updating,
        LifecycleState::Scale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::NotExists => "NotExists",
            LifecycleState::Reset => "Reset",
            LifecycleState::Ready => "Ready",
            LifecycleState::Recovering => "Recovering",
            LifecycleState::Updating => "Updating",
            LifecycleState::Scale => "Scale",
        }
    }

    /// Parse the persisted status field. Empty means the cluster was never initialized.
    pub fn from_status(field: Option<&str>) -> Result<Self> {
        match field {
            None => Ok(LifecycleState::NotExists),
            Some(s) if s.is_empty() => Ok(LifecycleState::NotExists),
            Some(s) => s.parse(),
        }
    }

    /// States that rebuild the cluster from scratch.
    pub fn is_initializing(&self) -> bool {
        matches!(self, LifecycleState::NotExists | LifecycleState::Reset)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        LifecycleState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| OperatorError::Config(format!("unknown lifecycle state '{}'", s)))
    }
}

/// Outcome of comparing declared and observed leader counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDecision {
    None,
    ScaleUp(u32),
    ScaleDown(u32),
}

impl ScaleDecision {
    pub fn is_required(&self) -> bool {
        !matches!(self, ScaleDecision::None)
    }
}

impl fmt::Display for ScaleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDecision::None => write!(f, "none"),
            ScaleDecision::ScaleUp(n) => write!(f, "scale-up({})", n),
            ScaleDecision::ScaleDown(n) => write!(f, "scale-down({})", n),
        }
    }
}

/// Inclusive range of hash slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(slot: u16) -> Self {
        Self { start: slot, end: slot }
    }

    pub fn len(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.end as u32 - self.start as u32 + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Split the full slot space into `parts` contiguous ranges of near-equal size.
pub fn split_slots(parts: u32) -> Vec<SlotRange> {
    if parts == 0 {
        return Vec::new();
    }
    let total = SLOT_COUNT as u32;
    let base = total / parts;
    let extra = total % parts;
    let mut ranges = Vec::with_capacity(parts as usize);
    let mut start = 0u32;
    for i in 0..parts {
        let size = base + u32::from(i < extra);
        if size == 0 {
            continue;
        }
        ranges.push(SlotRange::new(start as u16, (start + size - 1) as u16));
        start += size;
    }
    ranges
}

/// Running configuration of a member process. Compared bit-for-bit with the
/// declaration to decide whether a node is up to date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub image: String,
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Desired cluster topology as declared by the operator's user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDeclaration {
    /// Instance name, used for logging and resource naming.
    pub name: String,
    pub leader_count: u32,
    pub replicas_per_leader: u32,
    pub member: MemberConfig,
}

impl ClusterDeclaration {
    pub fn new(name: impl Into<String>, leader_count: u32, replicas_per_leader: u32) -> Self {
        Self {
            name: name.into(),
            leader_count,
            replicas_per_leader,
            member: MemberConfig::default(),
        }
    }

    pub fn with_member(mut self, member: MemberConfig) -> Self {
        self.member = member;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.leader_count == 0 {
            return Err(OperatorError::Config(format!(
                "cluster {}: leaderCount must be positive",
                self.name
            )));
        }
        if self.leader_count > SLOT_COUNT as u32 {
            return Err(OperatorError::Config(format!(
                "cluster {}: leaderCount {} exceeds slot count",
                self.name, self.leader_count
            )));
        }
        Ok(())
    }
}

/// Logical name of the leader of group `group`.
pub fn leader_name(group: u32) -> String {
    format!("leader-{}", group)
}

/// Logical name of replica `index` of group `group`.
pub fn replica_name(group: u32, index: u32) -> String {
    format!("leader-{}-replica-{}", group, index)
}

/// Group index encoded in a logical node name.
pub fn group_of(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("leader-")?;
    let digits = rest.split('-').next()?;
    digits.parse().ok()
}

/// Replica index encoded in a logical node name, if it names a replica slot.
pub fn replica_index_of(name: &str) -> Option<u32> {
    let (_, index) = name.rsplit_once("-replica-")?;
    index.parse().ok()
}
