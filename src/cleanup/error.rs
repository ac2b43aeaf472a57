//! Cleanup error types.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::tunnel::TunnelError;

/// Errors from undoing a single session step.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// A cluster object could not be removed or restored.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A route could not be removed.
    #[error(transparent)]
    Route(#[from] TunnelError),

    /// Filesystem error while restoring or sweeping local state.
    #[error("Cleanup I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cleanup operations.
pub type CleanupResult<T> = Result<T, CleanupError>;
