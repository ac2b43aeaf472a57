//! Error types for cluster operations.

use thiserror::Error;

/// Errors from talking to the cluster through `kubectl`.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// `kubectl` could not be executed at all.
    #[error("Failed to execute '{cmd}': {source}")]
    CommandFailed {
        /// The command line that was attempted.
        cmd: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `kubectl` ran but exited non-zero.
    #[error("Command '{cmd}' failed: {stderr}")]
    CommandError {
        /// The command line that failed.
        cmd: String,
        /// Standard error output.
        stderr: String,
    },

    /// `kubectl` output was not the JSON we expected.
    #[error("Unexpected response from '{cmd}': {message}")]
    InvalidResponse {
        /// The command line whose output was rejected.
        cmd: String,
        /// What was wrong with it.
        message: String,
    },

    /// The requested resource does not exist.
    #[error("{kind} '{name}' not found in namespace '{namespace}'")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Namespace searched.
        namespace: String,
    },

    /// Resource type prefix is not supported.
    #[error("Unsupported resource type '{0}', use a service or deployment name")]
    UnsupportedResource(String),

    /// No service selects the given workload.
    #[error("No service in namespace '{namespace}' selects {kind} '{name}'")]
    NoMatchingService {
        /// Workload kind.
        kind: String,
        /// Workload name.
        name: String,
        /// Namespace searched.
        namespace: String,
    },

    /// A workload did not become ready in time.
    #[error("{kind} '{name}' was not ready after {timeout_secs}s")]
    NotReady {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// How long we waited.
        timeout_secs: u64,
    },

    /// Local port-forward could not be established.
    #[error("Port forward to {target} failed: {message}")]
    PortForward {
        /// Forward target (e.g. `deployment/foo`).
        target: String,
        /// Failure description.
        message: String,
    },
}

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let err = ClusterError::CommandError {
            cmd: "kubectl get svc foo".to_string(),
            stderr: "forbidden".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("kubectl get svc foo"));
        assert!(msg.contains("forbidden"));
    }

    #[test]
    fn test_not_found_display() {
        let err = ClusterError::NotFound {
            kind: "service".to_string(),
            name: "tomcat".to_string(),
            namespace: "default".to_string(),
        };
        assert_eq!(err.to_string(), "service 'tomcat' not found in namespace 'default'");
    }
}
