//! Error types for the reconciliation core.
//!
//! Errors follow the failure taxonomy the control loop acts on:
//!
//! - **Transient I/O**: a member or the persistence layer did not answer in time.
//!   Retried on the next tick, never surfaced as an instance failure.
//! - **Conflict**: the persistence layer rejected a concurrent write. Retried
//!   within the tick with a fresh read, then deferred.
//! - **Topology**: the blueprint and the live cluster disagree in a way that
//!   needs repair (orphaned replica, missing leader).
//! - **Not found**: the cluster declaration no longer exists. Nothing to do.
//!
//! No variant is fatal to the control loop; the state machine converts every
//! error into a next lifecycle state and a requeue.

use thiserror::Error;

/// Main error type for reconciliation operations.
#[derive(Error, Debug)]
pub enum OperatorError {
    // Transient I/O
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Operation timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    #[error("Cluster command failed: {0}")]
    Command(String),

    #[error("Member lifecycle error: {0}")]
    Member(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // Concurrency
    #[error("Conflicting write on {0}")]
    Conflict(String),

    // Topology
    #[error("Topology inconsistency: {0}")]
    Topology(String),

    #[error("Refusing to remove {node}: it still owns {slots} slots")]
    RemovalRefused { node: String, slots: u32 },

    #[error("No healthy leader available")]
    NoHealthyLeader,

    // Declaration
    #[error("Not found: {0}")]
    NotFound(String),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OperatorError {
    /// Whether another attempt may succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::Unreachable(_)
                | OperatorError::Timeout { .. }
                | OperatorError::Command(_)
                | OperatorError::Member(_)
                | OperatorError::Persistence(_)
                | OperatorError::Conflict(_)
                | OperatorError::NoHealthyLeader
                | OperatorError::Io(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            OperatorError::Unreachable(_) => "unreachable",
            OperatorError::Timeout { .. } => "timeout",
            OperatorError::Command(_) => "command",
            OperatorError::Member(_) => "member",
            OperatorError::Persistence(_) => "persistence",
            OperatorError::Conflict(_) => "conflict",
            OperatorError::Topology(_) => "topology",
            OperatorError::RemovalRefused { .. } => "removal_refused",
            OperatorError::NoHealthyLeader => "no_healthy_leader",
            OperatorError::NotFound(_) => "not_found",
            OperatorError::Config(_) => "config",
            OperatorError::Serialization(_) => "serialization",
            OperatorError::Io(_) => "io",
            OperatorError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, OperatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OperatorError::Conflict("blueprint".into()).is_retryable());
        assert!(OperatorError::Timeout { operation: "probe".into(), millis: 10 }.is_retryable());
        assert!(!OperatorError::Topology("orphan".into()).is_retryable());
        assert!(!OperatorError::RemovalRefused { node: "leader-3".into(), slots: 10 }.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = OperatorError::RemovalRefused { node: "leader-3".into(), slots: 42 };
        assert_eq!(err.to_string(), "Refusing to remove leader-3: it still owns 42 slots");
        assert_eq!(err.kind(), "removal_refused");
    }
}
