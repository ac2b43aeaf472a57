//! Session lifecycle types: states, completion events, errors and outcome.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::cleanup::CleanupReport;
use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::expose::ExposeError;
use crate::mesh::MeshError;
use crate::tunnel::TunnelError;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started.
    Idle,
    /// Checking the expose rules against this machine and the service.
    Validating,
    /// Tunnel established.
    TunnelUp,
    /// Mesh routing in place.
    MeshConfigured,
    /// Waiting for a completion event.
    Running,
    /// Releasing cleanup.
    Terminating,
    /// Finished.
    Done,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Validating => "validating",
            SessionState::TunnelUp => "tunnel up",
            SessionState::MeshConfigured => "mesh configured",
            SessionState::Running => "running",
            SessionState::Terminating => "terminating",
            SessionState::Done => "done",
        };
        f.write_str(name)
    }
}

/// What ended a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An OS termination signal (`SIGINT`, `SIGTERM`).
    Signal(String),
    /// A supervised helper process exited.
    ProcessExited {
        /// Component that owned the process.
        component: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
    },
    /// Shutdown requested through the orchestrator's event sender.
    ShutdownRequested,
}

impl SessionEvent {
    /// Whether this is a normal way for a session to end.
    pub fn is_clean(&self) -> bool {
        !matches!(self, SessionEvent::ProcessExited { .. })
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Signal(name) => f.write_str(name),
            SessionEvent::ProcessExited {
                component,
                code: Some(code),
            } => write!(f, "{} exited with code {}", component, code),
            SessionEvent::ProcessExited {
                component,
                code: None,
            } => write!(f, "{} was killed by a signal", component),
            SessionEvent::ShutdownRequested => f.write_str("shutdown requested"),
        }
    }
}

/// Errors that end a session before it reaches `Running`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The command line is incomplete.
    #[error("{0}")]
    Usage(String),

    /// Nothing listens on an exposed local port.
    #[error("no application is running on port {0}")]
    LocalPortNotListening(u16),

    /// An exposed remote port is not a target port of the service.
    #[error("target port {port} not exists in service {service}")]
    RemotePortNotDeclared {
        /// The offending port.
        port: u16,
        /// Service name.
        service: String,
    },

    /// Configuration could not be built.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The `--expose` value is malformed.
    #[error(transparent)]
    Expose(#[from] ExposeError),

    /// The service could not be resolved.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The tunnel could not be established or died.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// Mesh routing could not be configured.
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// Signal handlers could not be installed.
    #[error("Failed to listen for termination signals: {0}")]
    Signals(#[source] std::io::Error),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// How a session that reached `Running` ended.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// The completion event.
    pub event: SessionEvent,
    /// Cleanup result; `None` when cleanup was skipped or did not finish.
    pub cleanup: Option<CleanupReport>,
    /// Time from start to the completion event.
    pub duration: Duration,
}

impl SessionOutcome {
    /// Whether the session ended normally and cleanup (if any) succeeded.
    pub fn is_clean(&self) -> bool {
        self.event.is_clean() && self.cleanup.as_ref().is_none_or(CleanupReport::is_clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        assert_eq!(
            SessionError::LocalPortNotListening(7001).to_string(),
            "no application is running on port 7001"
        );
        assert_eq!(
            SessionError::RemotePortNotDeclared {
                port: 80,
                service: "tomcat".to_string()
            }
            .to_string(),
            "target port 80 not exists in service tomcat"
        );
    }

    #[test]
    fn test_event_display() {
        assert_eq!(SessionEvent::Signal("SIGINT".to_string()).to_string(), "SIGINT");
        assert_eq!(
            SessionEvent::ProcessExited {
                component: "sshuttle".to_string(),
                code: Some(1)
            }
            .to_string(),
            "sshuttle exited with code 1"
        );
    }

    #[test]
    fn test_outcome_cleanliness() {
        let outcome = SessionOutcome {
            event: SessionEvent::Signal("SIGTERM".to_string()),
            cleanup: None,
            duration: Duration::from_secs(1),
        };
        assert!(outcome.is_clean());

        let failed_cleanup = SessionOutcome {
            cleanup: Some(CleanupReport {
                failed: vec!["delete deployment dev/x: boom".to_string()],
                ..Default::default()
            }),
            ..outcome.clone()
        };
        assert!(!failed_cleanup.is_clean());

        let died = SessionOutcome {
            event: SessionEvent::ProcessExited {
                component: "tun2socks".to_string(),
                code: None,
            },
            ..outcome
        };
        assert!(!died.is_clean());
    }
}
