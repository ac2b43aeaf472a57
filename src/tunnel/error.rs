//! Tunnel error types.

use thiserror::Error;

use crate::cluster::ClusterError;

/// Errors from establishing or tearing down the tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A local networking command could not be executed.
    #[error("Failed to execute '{cmd}': {source}")]
    CommandFailed {
        /// The command that was attempted.
        cmd: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A local networking command exited non-zero.
    #[error("Command '{cmd}' failed: {stderr}")]
    CommandError {
        /// The command that failed.
        cmd: String,
        /// Standard error output.
        stderr: String,
    },

    /// Creating the connect shadow or its port-forward failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A helper process could not be started.
    #[error("Failed to start {component}: {source}")]
    Spawn {
        /// Component name.
        component: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A helper process started but is not serving.
    #[error("{component} is not ready: {message}")]
    NotReady {
        /// Component name.
        component: String,
        /// What was being waited for.
        message: String,
    },

    /// The hosts file could not be updated.
    #[error("Failed to update {}: {source}", .path.display())]
    Hosts {
        /// Hosts file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Nothing to route: discovery found no ranges and none were configured.
    #[error("No cluster address ranges found; set tunnel.cluster_cidrs or use --includeIps")]
    NoRanges,

    /// A helper process exited while the tunnel was expected to be up.
    #[error("{component} exited unexpectedly ({})", exit_description(.code))]
    ProcessExited {
        /// Component name.
        component: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "killed by signal".to_string(),
    }
}

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;
