use thiserror::Error;

use crate::job::JobId;
use crate::node::NodeId;

/// Errors surfaced by the coordination core.
///
/// `Conflict`, `StaleAttempt`, `NoAvailableNodes` and `NodeUnreachable` are
/// transient: the scheduler and dispatcher retry them internally and they
/// only reach a caller when the caller asked for a specific transition.
#[derive(Error, Debug)]
pub enum BatonError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflicting update on {key}: {reason}")]
    Conflict { key: String, reason: String },

    /// A write from an attempt the job has since moved past.
    #[error("attempt {dispatch_seq} of job {job_id} was superseded")]
    StaleAttempt { job_id: JobId, dispatch_seq: u64 },

    #[error("invalid dependency graph: {0}")]
    InvalidDependencyGraph(String),

    #[error("no available nodes for job {0}")]
    NoAvailableNodes(JobId),

    #[error("executor failure for job {job_id}: {message}")]
    ExecutorFailure { job_id: JobId, message: String },

    #[error("node {0} is unreachable")]
    NodeUnreachable(NodeId),

    #[error("job {job_id} cancelled: dependency {dependency} failed")]
    DependencyFailed { job_id: JobId, dependency: JobId },

    #[error("submission rate limit exceeded")]
    RateLimited,

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl BatonError {
    pub fn job_not_found(id: JobId) -> Self {
        Self::NotFound {
            entity: "job",
            id: id.to_string(),
        }
    }

    pub fn node_not_found(id: &NodeId) -> Self {
        Self::NotFound {
            entity: "node",
            id: id.to_string(),
        }
    }

    pub fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is retried internally rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::StaleAttempt { .. }
                | Self::NoAvailableNodes(_)
                | Self::NodeUnreachable(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleAttempt { .. })
    }
}

pub type Result<T> = std::result::Result<T, BatonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let job_id = JobId::new();
        assert!(BatonError::conflict("job/x", "state changed").is_transient());
        assert!(BatonError::NoAvailableNodes(job_id).is_transient());
        assert!(BatonError::NodeUnreachable(NodeId::new("n1")).is_transient());

        let stale = BatonError::StaleAttempt {
            job_id,
            dispatch_seq: 2,
        };
        assert!(stale.is_transient());
        assert!(stale.is_stale());
        assert!(!stale.is_conflict());
        assert!(!BatonError::conflict("job/x", "too much write contention").is_stale());

        assert!(!BatonError::InvalidDependencyGraph("cycle".into()).is_transient());
        assert!(!BatonError::job_not_found(job_id).is_transient());
        assert!(!BatonError::RateLimited.is_transient());
    }

    #[test]
    fn test_not_found_display() {
        let err = BatonError::node_not_found(&NodeId::new("encoder-7"));
        assert_eq!(err.to_string(), "node not found: encoder-7");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_backend_error_is_transparent() {
        let err: BatonError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "disk full");
    }
}
