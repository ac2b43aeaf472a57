//! Mesh error types.

use thiserror::Error;

use crate::cluster::ClusterError;

/// Errors from configuring mesh routing.
#[derive(Debug, Error)]
pub enum MeshError {
    /// `--versionMark` could not be parsed.
    #[error("Invalid version mark '{mark}': {reason}")]
    InvalidVersionMark {
        /// The mark as given.
        mark: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A cluster call failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// An existing routing resource does not have the expected shape.
    #[error("{kind} {name} cannot be patched: {message}")]
    InvalidResource {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// What is wrong with it.
        message: String,
    },

    /// Another live session already routes this service.
    #[error("Service {service} is already meshed by {owner}")]
    AlreadyMeshed {
        /// Service name.
        service: String,
        /// `host:pid` of the other session.
        owner: String,
    },

    /// A helper process could not be started.
    #[error("Failed to start {component}: {source}")]
    Spawn {
        /// Component name.
        component: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A helper process exited right after starting.
    #[error("{component} exited right after starting")]
    ProcessExited {
        /// Component name.
        component: String,
    },
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
