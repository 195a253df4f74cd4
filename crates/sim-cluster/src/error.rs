//! Cluster Errors

use sim_kernel::KernelError;
use sim_types::{Migration, NodeId};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{peer} disconnected")]
    Disconnected { peer: NodeId },

    #[error("timed out after {waited:?} waiting for {peer}")]
    Timeout { peer: NodeId, waited: Duration },

    #[error("unexpected frame from {peer}: expected {expected}, got {found}")]
    UnexpectedFrame {
        peer: NodeId,
        expected: &'static str,
        found: &'static str,
    },

    #[error("migration {migration} unacknowledged after {attempts} attempts")]
    MigrationUnacknowledged { migration: Migration, attempts: u32 },

    #[error("migrant for {migration} never arrived")]
    MigrantMissing { migration: Migration },

    #[error("{0} panicked")]
    NodePanicked(NodeId),

    #[error("invalid cluster: {0}")]
    Invalid(String),

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("failed to start node thread: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Kernel(KernelError),
}

impl ClusterError {
    /// True for errors that only report another node going away.
    pub fn is_consequential(&self) -> bool {
        matches!(
            self,
            ClusterError::Disconnected { .. } | ClusterError::Timeout { .. } | ClusterError::MigrantMissing { .. }
        )
    }
}

/// Unwraps cluster errors that passed through the model as
/// [`KernelError::Distributed`].
impl From<KernelError> for ClusterError {
    fn from(error: KernelError) -> Self {
        match error {
            KernelError::Distributed(source) => match source.downcast::<ClusterError>() {
                Ok(cluster) => *cluster,
                Err(other) => ClusterError::Kernel(KernelError::Distributed(other)),
            },
            other => ClusterError::Kernel(other),
        }
    }
}

impl From<ClusterError> for KernelError {
    fn from(error: ClusterError) -> Self {
        match error {
            ClusterError::Kernel(kernel) => kernel,
            other => KernelError::Distributed(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::Identity;

    #[test]
    fn test_round_trip_through_kernel_error() {
        let original = ClusterError::MigrationUnacknowledged {
            migration: Migration {
                source: NodeId(1),
                target: NodeId(0),
                migrant: Identity::from([1, 0]),
            },
            attempts: 4,
        };
        let kernel: KernelError = original.into();
        assert!(matches!(kernel, KernelError::Distributed(_)));
        let back: ClusterError = kernel.into();
        assert!(matches!(back, ClusterError::MigrationUnacknowledged { attempts: 4, .. }));
    }

    #[test]
    fn test_kernel_errors_stay_unwrapped() {
        let kernel = KernelError::UnknownAgent(Identity::from([0, 3]));
        let cluster: ClusterError = kernel.into();
        let back: KernelError = cluster.into();
        assert!(matches!(back, KernelError::UnknownAgent(_)));
    }

    #[test]
    fn test_consequential_errors() {
        assert!(ClusterError::Disconnected { peer: NodeId(2) }.is_consequential());
        assert!(!ClusterError::NodePanicked(NodeId(2)).is_consequential());
    }
}
