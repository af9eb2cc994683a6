// Custom assertions for cluster-level integration tests

use redis_operator::{Blueprint, Role};

use super::cluster_sim::ClusterSim;

/// Assertion result for detailed error messages
#[derive(Debug)]
pub struct AssertionResult {
    pub passed: bool,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl AssertionResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: String::new(),
            expected: None,
            actual: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    pub fn assert(self) {
        if !self.passed {
            let mut msg = self.message;
            if let Some(expected) = self.expected {
                msg.push_str(&format!("\n  expected: {}", expected));
            }
            if let Some(actual) = self.actual {
                msg.push_str(&format!("\n  actual: {}", actual));
            }
            panic!("{}", msg);
        }
    }
}

/// Blueprint has `leaders` leader entries, each with `replicas` replicas
/// pointing back at it.
pub fn assert_blueprint_shape(blueprint: &Blueprint, leaders: usize, replicas: usize) -> AssertionResult {
    let found = blueprint.leaders();
    if found.len() != leaders {
        return AssertionResult::fail("Leader entry count mismatch")
            .with_expected(leaders.to_string())
            .with_actual(format!("{:?}", found));
    }
    if blueprint.len() != leaders * (1 + replicas) {
        return AssertionResult::fail("Blueprint size mismatch")
            .with_expected((leaders * (1 + replicas)).to_string())
            .with_actual(blueprint.len().to_string());
    }
    for leader in &found {
        let attached = blueprint.replicas_of(leader);
        if attached.len() != replicas {
            return AssertionResult::fail(format!("Wrong replica count for {}", leader))
                .with_expected(replicas.to_string())
                .with_actual(format!("{:?}", attached));
        }
    }
    if let Err(e) = blueprint.validate() {
        return AssertionResult::fail(format!("Blueprint invariants violated: {}", e));
    }
    AssertionResult::pass()
}

/// The simulated cluster matches the blueprint: every entry backed by a live
/// process in the right role, replicas following their intended leader, and
/// every slot owned exactly once.
pub fn assert_cluster_matches(sim: &ClusterSim, blueprint: &Blueprint) -> AssertionResult {
    for (name, entry) in blueprint.iter() {
        let Some(node) = sim.node(name) else {
            return AssertionResult::fail(format!("{} has no process", name));
        };
        if !node.alive {
            return AssertionResult::fail(format!("{} is not alive", name));
        }
        if node.role != entry.role {
            return AssertionResult::fail(format!("{} plays the wrong role", name))
                .with_expected(entry.role.to_string())
                .with_actual(node.role.to_string());
        }
        if entry.role == Role::Replica {
            let parent = entry.parent.as_deref().and_then(|p| sim.node(p));
            let parent_id = parent.map(|p| p.id);
            if node.leader_id != parent_id {
                return AssertionResult::fail(format!("{} follows the wrong leader", name))
                    .with_expected(format!("{:?}", parent_id))
                    .with_actual(format!("{:?}", node.leader_id));
            }
        }
    }
    if !sim.slots_fully_covered() {
        return AssertionResult::fail("Slots not covered exactly once")
            .with_actual(format!("{:?}", sim.leader_slots()));
    }
    AssertionResult::pass()
}

/// Every live leader owns between `min` and `max` slots.
pub fn assert_slots_balanced(sim: &ClusterSim, min: usize, max: usize) -> AssertionResult {
    for (leader, slots) in sim.leader_slots() {
        if slots < min || slots > max {
            return AssertionResult::fail(format!("{} owns an unbalanced share", leader))
                .with_expected(format!("[{}, {}]", min, max))
                .with_actual(slots.to_string());
        }
    }
    AssertionResult::pass()
}
