// In-memory Redis cluster for integration tests.
// Implements every collaborator trait the reconciliation core drives.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

use redis_operator::provider::{
    ClusterAdmin, CommandOutput, MemberHandle, MemberProvider, MemberSelector, NodeTopology,
    PeerInfo, StatusSink,
};
use redis_operator::{
    ClusterView, LifecycleState, MemberConfig, NodeHealth, OperatorError, Result, Role,
    SlotRange, StatusReport, SLOT_COUNT,
};

/// One simulated process.
#[derive(Debug, Clone)]
pub struct SimNode {
    pub name: String,
    pub id: String,
    pub address: String,
    /// Role label the member was created with.
    pub label: Role,
    /// Role the process actually plays in the cluster.
    pub role: Role,
    pub leader_id: Option<String>,
    pub slots: BTreeSet<u16>,
    pub peers: BTreeSet<String>,
    pub config: MemberConfig,
    pub alive: bool,
}

/// A member deletion, with the slots the process still owned at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub name: String,
    pub owned_slots: u32,
}

#[derive(Default)]
struct SimState {
    nodes: BTreeMap<String, SimNode>,
    next_id: u64,
    created: Vec<String>,
    deleted: Vec<Deletion>,
    forgets: Vec<(String, String)>,
    failovers: Vec<String>,
    mutations: u64,
    fail_create: BTreeSet<String>,
    refuse_drain: bool,
    lifecycle: LifecycleState,
    reports: Vec<StatusReport>,
    last_view: Option<ClusterView>,
}

/// Simulated cluster: process provider, admin client and status sink in one.
#[derive(Default)]
pub struct ClusterSim {
    state: Mutex<SimState>,
}

impl ClusterSim {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Crash the process behind `name`. It keeps its Pod but stops answering.
    pub fn kill(&self, name: &str) {
        if let Some(node) = self.state.lock().nodes.get_mut(name) {
            node.alive = false;
        }
    }

    /// Promote the first live replica of the dead leader `name`, as the
    /// cluster does on its own after the node timeout.
    pub fn auto_failover(&self, name: &str) {
        let mut state = self.state.lock();
        let Some(dead) = state.nodes.get(name).cloned() else {
            return;
        };
        let promoted = state
            .nodes
            .values()
            .find(|n| n.alive && n.leader_id.as_deref() == Some(dead.id.as_str()))
            .map(|n| n.name.clone());
        let Some(promoted) = promoted else {
            return;
        };
        let new_id = state.nodes[&promoted].id.clone();
        for node in state.nodes.values_mut() {
            if node.name == promoted {
                node.role = Role::Leader;
                node.leader_id = None;
                node.slots.extend(dead.slots.iter().copied());
            } else if node.name == name {
                node.slots.clear();
            } else if node.leader_id.as_deref() == Some(dead.id.as_str()) {
                node.leader_id = Some(new_id.clone());
            }
        }
    }

    pub fn fail_create(&self, name: &str) {
        self.state.lock().fail_create.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().fail_create.clear();
    }

    /// Make slot draining report success without moving anything.
    pub fn refuse_drain(&self, refuse: bool) {
        self.state.lock().refuse_drain = refuse;
    }

    pub fn set_lifecycle(&self, state: LifecycleState) {
        self.state.lock().lifecycle = state;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn lifecycle(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    pub fn node(&self, name: &str) -> Option<SimNode> {
        self.state.lock().nodes.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().nodes.keys().cloned().collect()
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    pub fn deleted(&self) -> Vec<Deletion> {
        self.state.lock().deleted.clone()
    }

    pub fn forgets(&self) -> Vec<(String, String)> {
        self.state.lock().forgets.clone()
    }

    pub fn failovers(&self) -> Vec<String> {
        self.state.lock().failovers.clone()
    }

    /// Count of every state-changing call received so far.
    pub fn mutations(&self) -> u64 {
        self.state.lock().mutations
    }

    pub fn last_report(&self) -> Option<StatusReport> {
        self.state.lock().reports.last().cloned()
    }

    pub fn last_view(&self) -> Option<ClusterView> {
        self.state.lock().last_view.clone()
    }

    /// Slots owned by each live leader, by name.
    pub fn leader_slots(&self) -> BTreeMap<String, usize> {
        self.state
            .lock()
            .nodes
            .values()
            .filter(|n| n.alive && n.role == Role::Leader)
            .map(|n| (n.name.clone(), n.slots.len()))
            .collect()
    }

    /// Whether every slot is owned by exactly one live leader.
    pub fn slots_fully_covered(&self) -> bool {
        let state = self.state.lock();
        let mut owners = vec![0u32; SLOT_COUNT as usize];
        for node in state.nodes.values().filter(|n| n.alive && n.role == Role::Leader) {
            for slot in &node.slots {
                owners[*slot as usize] += 1;
            }
        }
        owners.iter().all(|c| *c == 1)
    }
}

fn address_for(name: &str) -> String {
    format!("{}.sim:6379", name)
}

fn ranges(slots: &BTreeSet<u16>) -> Vec<SlotRange> {
    let mut ranges: Vec<SlotRange> = Vec::new();
    for &slot in slots {
        match ranges.last_mut() {
            Some(last) if last.end + 1 == slot => last.end = slot,
            _ => ranges.push(SlotRange::single(slot)),
        }
    }
    ranges
}

impl SimState {
    fn by_address(&self, address: &str) -> Result<&SimNode> {
        self.nodes
            .values()
            .find(|n| n.address == address && n.alive)
            .ok_or_else(|| OperatorError::Unreachable(address.to_string()))
    }

    fn name_at(&self, address: &str) -> Result<String> {
        self.by_address(address).map(|n| n.name.clone())
    }

    fn live_leaders(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.alive && n.role == Role::Leader)
            .map(|n| n.name.clone())
            .collect()
    }

    /// Hand out `pool` and rebalance so every participant owns a near-equal share.
    fn redistribute(&mut self, participants: &[String], mut pool: Vec<u16>) {
        if participants.is_empty() {
            return;
        }
        let total: usize = pool.len()
            + participants
                .iter()
                .map(|p| self.nodes[p].slots.len())
                .sum::<usize>();
        let base = total / participants.len();
        let extra = total % participants.len();
        let targets: Vec<usize> = (0..participants.len())
            .map(|i| base + usize::from(i < extra))
            .collect();

        for (name, target) in participants.iter().zip(&targets) {
            let node = self.nodes.get_mut(name).expect("participant exists");
            while node.slots.len() > *target {
                let slot = *node.slots.iter().next_back().expect("non-empty");
                node.slots.remove(&slot);
                pool.push(slot);
            }
        }
        pool.sort_unstable();
        for (name, target) in participants.iter().zip(&targets) {
            let node = self.nodes.get_mut(name).expect("participant exists");
            while node.slots.len() < *target {
                match pool.pop() {
                    Some(slot) => {
                        node.slots.insert(slot);
                    }
                    None => break,
                }
            }
        }
    }
}

#[async_trait]
impl MemberProvider for ClusterSim {
    async fn create_member(&self, name: &str, role: Role, spec: &MemberConfig) -> Result<MemberHandle> {
        let mut state = self.state.lock();
        if state.fail_create.contains(name) {
            return Err(OperatorError::Member(format!("scheduling {} failed", name)));
        }
        state.next_id += 1;
        let node = SimNode {
            name: name.to_string(),
            id: format!("{:040x}", state.next_id),
            address: address_for(name),
            label: role,
            role: Role::Leader,
            leader_id: None,
            slots: BTreeSet::new(),
            peers: BTreeSet::new(),
            config: spec.clone(),
            alive: true,
        };
        let handle = MemberHandle {
            name: name.to_string(),
            role,
            address: Some(node.address.clone()),
            config: spec.clone(),
        };
        state.nodes.insert(name.to_string(), node);
        state.created.push(name.to_string());
        state.mutations += 1;
        Ok(handle)
    }

    async fn delete_member(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.remove(name) {
            state.deleted.push(Deletion {
                name: name.to_string(),
                owned_slots: node.slots.len() as u32,
            });
            state.mutations += 1;
        }
        Ok(())
    }

    async fn list_members(&self, selector: MemberSelector) -> Result<Vec<MemberHandle>> {
        let state = self.state.lock();
        Ok(state
            .nodes
            .values()
            .map(|n| MemberHandle {
                name: n.name.clone(),
                role: n.label,
                address: Some(n.address.clone()),
                config: n.config.clone(),
            })
            .filter(|h| selector.matches(h))
            .collect())
    }

    async fn probe_health(&self, handle: &MemberHandle) -> NodeHealth {
        match self.state.lock().nodes.get(&handle.name) {
            Some(node) if node.alive => NodeHealth::Ok,
            _ => NodeHealth::Unreachable,
        }
    }
}

#[async_trait]
impl ClusterAdmin for ClusterSim {
    async fn join(&self, target: &str, existing: &str) -> Result<()> {
        let mut state = self.state.lock();
        let target = state.name_at(target)?;
        let existing = state.by_address(existing)?.clone();

        let mut members: Vec<String> = vec![existing.name.clone()];
        members.extend(
            state
                .nodes
                .values()
                .filter(|n| n.alive && existing.peers.contains(&n.id))
                .map(|n| n.name.clone()),
        );

        let target_id = state.nodes[&target].id.clone();
        let mut learned = existing.peers.clone();
        learned.insert(existing.id.clone());
        for member in &members {
            if let Some(node) = state.nodes.get_mut(member) {
                if node.name != target {
                    node.peers.insert(target_id.clone());
                }
            }
        }
        if let Some(node) = state.nodes.get_mut(&target) {
            learned.remove(&node.id);
            node.peers.extend(learned);
        }
        state.mutations += 1;
        Ok(())
    }

    async fn forget(&self, target: &str, node_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let name = state.name_at(target)?;
        let node = state.nodes.get_mut(&name).expect("looked up by address");
        if node.id == node_id {
            return Err(OperatorError::Command("I tried hard but I can't forget myself".into()));
        }
        if node.leader_id.as_deref() == Some(node_id) {
            return Err(OperatorError::Command("Can't forget my master".into()));
        }
        node.peers.remove(node_id);
        state.forgets.push((name, node_id.to_string()));
        state.mutations += 1;
        Ok(())
    }

    async fn assign_replica_of(&self, target: &str, leader: &str) -> Result<()> {
        let mut state = self.state.lock();
        let target = state.name_at(target)?;
        let leader = state.by_address(leader)?.clone();
        if leader.role != Role::Leader {
            return Err(OperatorError::Command(format!("{} is not a master", leader.name)));
        }
        let node = state.nodes.get_mut(&target).expect("looked up by address");
        if !node.slots.is_empty() {
            return Err(OperatorError::Command(
                "To set a master the node must be empty and without assigned slots".into(),
            ));
        }
        if !node.peers.contains(&leader.id) {
            return Err(OperatorError::Command(format!("Unknown node {}", leader.id)));
        }
        node.role = Role::Replica;
        node.leader_id = Some(leader.id);
        state.mutations += 1;
        Ok(())
    }

    async fn rebalance_slots(&self, any_healthy: &str) -> Result<CommandOutput> {
        let mut state = self.state.lock();
        state.by_address(any_healthy)?;
        let leaders = state.live_leaders();
        state.redistribute(&leaders, Vec::new());
        state.mutations += 1;
        Ok(CommandOutput::ok(format!("rebalanced across {} masters", leaders.len())))
    }

    async fn fix_cluster(&self, any_healthy: &str) -> Result<CommandOutput> {
        let mut state = self.state.lock();
        state.by_address(any_healthy)?;
        let leaders = state.live_leaders();
        let owned: BTreeSet<u16> = leaders
            .iter()
            .flat_map(|l| state.nodes[l].slots.iter().copied())
            .collect();
        let uncovered: Vec<u16> = (0..SLOT_COUNT).filter(|s| !owned.contains(s)).collect();
        let count = uncovered.len();
        state.redistribute(&leaders, uncovered);
        state.mutations += 1;
        Ok(CommandOutput::ok(format!("covered {} slots", count)))
    }

    async fn query_topology(&self, target: &str) -> Result<NodeTopology> {
        let state = self.state.lock();
        let node = state.by_address(target)?;
        let peers = node
            .peers
            .iter()
            .map(|id| match state.nodes.values().find(|n| &n.id == id) {
                Some(peer) => PeerInfo {
                    id: id.clone(),
                    address: peer.address.clone(),
                    role: peer.role,
                    leader_id: peer.leader_id.clone(),
                    failed: !peer.alive,
                    slots: ranges(&peer.slots),
                },
                None => PeerInfo {
                    id: id.clone(),
                    address: String::new(),
                    role: Role::Leader,
                    leader_id: None,
                    failed: true,
                    slots: Vec::new(),
                },
            })
            .collect();
        Ok(NodeTopology {
            id: node.id.clone(),
            role: node.role,
            leader_id: node.leader_id.clone(),
            slots: ranges(&node.slots),
            peers,
        })
    }

    async fn assign_slots(&self, target: &str, slot_ranges: &[SlotRange]) -> Result<()> {
        let mut state = self.state.lock();
        let name = state.name_at(target)?;
        let node = state.nodes.get_mut(&name).expect("looked up by address");
        for range in slot_ranges {
            node.slots.extend(range.start..=range.end);
        }
        state.mutations += 1;
        Ok(())
    }

    async fn drain_slots(&self, any_healthy: &str, departing: &[String]) -> Result<CommandOutput> {
        let mut state = self.state.lock();
        state.by_address(any_healthy)?;
        state.mutations += 1;
        if state.refuse_drain {
            return Ok(CommandOutput::ok("nothing moved"));
        }

        let mut pool = Vec::new();
        for node in state.nodes.values_mut().filter(|n| departing.contains(&n.id)) {
            pool.extend(std::mem::take(&mut node.slots));
        }
        let remaining: Vec<String> = state
            .live_leaders()
            .into_iter()
            .filter(|name| !departing.contains(&state.nodes[name].id))
            .collect();
        let moved = pool.len();
        state.redistribute(&remaining, pool);
        Ok(CommandOutput::ok(format!("moved {} slots", moved)))
    }

    async fn failover(&self, replica: &str) -> Result<()> {
        let mut state = self.state.lock();
        let replica = state.by_address(replica)?.clone();
        let leader_id = replica
            .leader_id
            .clone()
            .ok_or_else(|| OperatorError::Command("You should send CLUSTER FAILOVER to a replica".into()))?;
        let leader = state
            .nodes
            .values()
            .find(|n| n.id == leader_id && n.alive)
            .cloned()
            .ok_or_else(|| OperatorError::Unreachable(leader_id.clone()))?;

        for node in state.nodes.values_mut() {
            if node.name == replica.name {
                node.role = Role::Leader;
                node.leader_id = None;
                node.slots = leader.slots.clone();
            } else if node.name == leader.name {
                node.role = Role::Replica;
                node.leader_id = Some(replica.id.clone());
                node.slots.clear();
            } else if node.leader_id.as_deref() == Some(leader_id.as_str()) {
                node.leader_id = Some(replica.id.clone());
            }
        }
        state.failovers.push(replica.name.clone());
        state.mutations += 1;
        Ok(())
    }
}

#[async_trait]
impl StatusSink for ClusterSim {
    async fn persist_state(&self, lifecycle: LifecycleState, report: &StatusReport) -> Result<()> {
        let mut state = self.state.lock();
        state.lifecycle = lifecycle;
        state.reports.push(report.clone());
        Ok(())
    }

    async fn publish_view(&self, view: &ClusterView) -> Result<()> {
        self.state.lock().last_view = Some(view.clone());
        Ok(())
    }
}
