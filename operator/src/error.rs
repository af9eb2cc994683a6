//! Error types for the Redis operator binary

use redis_operator::OperatorError;
use thiserror::Error;

/// Main error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("CRD not installed. Please install the RedisCluster CRD first.")]
    CrdNotInstalled,

    #[error(transparent)]
    Core(#[from] OperatorError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<Error> for OperatorError {
    fn from(e: Error) -> Self {
        match e {
            Error::Core(inner) => inner,
            Error::Kube(kube::Error::Api(resp)) if resp.code == 409 => OperatorError::Conflict(resp.message),
            Error::Kube(kube::Error::Api(resp)) if resp.code == 404 => OperatorError::NotFound(resp.message),
            Error::Kube(other) => OperatorError::Persistence(other.to_string()),
            Error::Serialization(e) => OperatorError::Serialization(e.to_string()),
            other => OperatorError::Internal(other.to_string()),
        }
    }
}

/// Whether a Kubernetes error is a plain "not found".
pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

/// Whether a Kubernetes error is a 409 from a stale `resourceVersion` or an existing name.
pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 409)
}
