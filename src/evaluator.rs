//! Health and drift evaluation.
//!
//! Pure functions over the declaration, the blueprint and the snapshot of the
//! current tick. Nothing here performs I/O.

use std::collections::BTreeSet;

use crate::blueprint::{Blueprint, BlueprintEntry};
use crate::snapshot::TopologySnapshot;
use crate::types::{ClusterDeclaration, NodeHealth, Role, ScaleDecision, SlotRange, SLOT_COUNT};

/// Slot ownership across healthy leaders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotCoverage {
    /// Slots no healthy leader owns.
    pub missing: Vec<SlotRange>,
    /// Slots claimed by more than one healthy leader.
    pub overlapping: Vec<SlotRange>,
    /// Ranges reaching past the last slot, as reported.
    pub out_of_range: Vec<SlotRange>,
}

impl SlotCoverage {
    pub fn is_full(&self) -> bool {
        self.missing.is_empty() && self.overlapping.is_empty() && self.out_of_range.is_empty()
    }
}

/// Compute gaps and overlaps in the slots reported by healthy leaders.
pub fn slot_coverage(snapshot: &TopologySnapshot) -> SlotCoverage {
    let mut owners = vec![0u8; SLOT_COUNT as usize];
    let mut out_of_range = Vec::new();
    for leader in snapshot.healthy_leaders() {
        for range in &leader.slots {
            if range.is_empty() {
                continue;
            }
            if range.end >= SLOT_COUNT {
                out_of_range.push(*range);
            }
            if range.start >= SLOT_COUNT {
                continue;
            }
            for slot in range.start..=range.end.min(SLOT_COUNT - 1) {
                let count = &mut owners[slot as usize];
                *count = count.saturating_add(1);
            }
        }
    }

    SlotCoverage {
        missing: collapse(&owners, |c| c == 0),
        overlapping: collapse(&owners, |c| c > 1),
        out_of_range,
    }
}

fn collapse(owners: &[u8], select: impl Fn(u8) -> bool) -> Vec<SlotRange> {
    let mut ranges = Vec::new();
    let mut open: Option<u16> = None;
    for (slot, &count) in owners.iter().enumerate() {
        let slot = slot as u16;
        match (select(count), open) {
            (true, None) => open = Some(slot),
            (false, Some(start)) => {
                ranges.push(SlotRange::new(start, slot - 1));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        ranges.push(SlotRange::new(start, SLOT_COUNT - 1));
    }
    ranges
}

/// Reasons the cluster is not complete. Empty means complete.
pub fn completeness_gaps(
    declaration: &ClusterDeclaration,
    snapshot: &TopologySnapshot,
    blueprint: &Blueprint,
) -> Vec<String> {
    let mut gaps = Vec::new();

    for (name, _) in blueprint.iter() {
        if !snapshot.is_ok(name) {
            gaps.push(format!("{} is not reachable", name));
        }
    }

    for leader in blueprint.leaders() {
        let Some(facts) = snapshot.get(&leader).filter(|f| f.is_ok()) else {
            continue;
        };
        if facts.role != Some(Role::Leader) {
            gaps.push(format!("{} does not act as leader", leader));
            continue;
        }
        let attached = snapshot
            .healthy()
            .filter(|n| n.role == Some(Role::Replica))
            .filter(|n| n.leader_id.is_some() && n.leader_id == facts.node_id)
            .count() as u32;
        if attached != declaration.replicas_per_leader {
            gaps.push(format!(
                "{} has {} healthy replicas, want {}",
                leader, attached, declaration.replicas_per_leader
            ));
        }
        let intended = blueprint.replicas_of(&leader).len() as u32;
        if intended != declaration.replicas_per_leader {
            gaps.push(format!(
                "{} has {} intended replicas, want {}",
                leader, intended, declaration.replicas_per_leader
            ));
        }
    }

    let coverage = slot_coverage(snapshot);
    if !coverage.missing.is_empty() {
        gaps.push(format!("{} slot ranges uncovered", coverage.missing.len()));
    }
    if !coverage.overlapping.is_empty() {
        gaps.push(format!("{} slot ranges owned twice", coverage.overlapping.len()));
    }
    for range in &coverage.out_of_range {
        gaps.push(format!("slot range {} is outside the slot space", range));
    }

    gaps
}

/// Every intended node is healthy, every leader has its replicas, and the slot
/// space is covered exactly once.
pub fn is_complete(
    declaration: &ClusterDeclaration,
    snapshot: &TopologySnapshot,
    blueprint: &Blueprint,
) -> bool {
    completeness_gaps(declaration, snapshot, blueprint).is_empty()
}

/// Healthy nodes whose running configuration differs from the declaration.
pub fn stale_nodes(declaration: &ClusterDeclaration, snapshot: &TopologySnapshot) -> Vec<String> {
    snapshot
        .healthy()
        .filter(|n| n.config.as_ref() != Some(&declaration.member))
        .map(|n| n.name.clone())
        .collect()
}

/// Every healthy node runs exactly the declared configuration.
pub fn is_up_to_date(declaration: &ClusterDeclaration, snapshot: &TopologySnapshot) -> bool {
    stale_nodes(declaration, snapshot).is_empty()
}

/// Compare the declared leader count with the healthy leaders observed.
pub fn scale_required(declaration: &ClusterDeclaration, snapshot: &TopologySnapshot) -> ScaleDecision {
    compare_leaders(declaration.leader_count, snapshot.healthy_leaders().len() as u32)
}

/// Compare the declared leader count with the leaders the blueprint intends.
///
/// Unlike [`scale_required`], an intended leader that is currently unreachable
/// still counts: it is Recovery's to replace, not capacity to add.
pub fn blueprint_scale(declaration: &ClusterDeclaration, blueprint: &Blueprint) -> ScaleDecision {
    compare_leaders(declaration.leader_count, blueprint.leaders().len() as u32)
}

fn compare_leaders(declared: u32, observed: u32) -> ScaleDecision {
    if observed < declared {
        ScaleDecision::ScaleUp(declared - observed)
    } else if observed > declared {
        ScaleDecision::ScaleDown(observed - declared)
    } else {
        ScaleDecision::None
    }
}

/// Blueprint entries not OK in the snapshot for at least `threshold`
/// consecutive ticks. Expects [`observe`] to have been folded in for this tick.
pub fn lost_nodes(blueprint: &Blueprint, snapshot: &TopologySnapshot, threshold: u32) -> BTreeSet<String> {
    blueprint
        .iter()
        .filter(|(name, entry)| !snapshot.is_ok(name) && entry.misses >= threshold)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Blueprint entries that are not OK but have not yet crossed the threshold.
pub fn suspect_nodes(blueprint: &Blueprint, snapshot: &TopologySnapshot, threshold: u32) -> BTreeSet<String> {
    blueprint
        .iter()
        .filter(|(name, entry)| !snapshot.is_ok(name) && entry.misses < threshold)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Fold this tick's observations into blueprint health markers.
///
/// Returns only the entries that changed. An OK observation resets the miss
/// counter and records the node identifier; anything else increments it.
pub fn observe(blueprint: &Blueprint, snapshot: &TopologySnapshot) -> Vec<(String, BlueprintEntry)> {
    let mut changed = Vec::new();
    for (name, entry) in blueprint.iter() {
        let mut next = entry.clone();
        match snapshot.get(name).filter(|f| f.is_ok()) {
            Some(facts) => {
                next.health = NodeHealth::Ok;
                next.misses = 0;
                if facts.node_id.is_some() {
                    next.node_id = facts.node_id.clone();
                }
            }
            None => {
                next.health = NodeHealth::Unreachable;
                next.misses = entry.misses.saturating_add(1);
            }
        }
        if &next != entry {
            changed.push((name.clone(), next));
        }
    }
    changed
}
