//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `KT_MESHDEBUG` tag so that
//! changes made to a shared cluster can be traced back to a user and host.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for a mesh debug session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Session started.
    SessionStart {
        /// Username of the person running the session.
        user: String,
        /// Service being meshed (`namespace/name`).
        service: String,
        /// Process ID of the session.
        pid: u32,
    },

    /// Tunnel into the cluster is up.
    TunnelUp {
        /// Connect mode (`tun2socks` or `sshuttle`).
        mode: String,
        /// Ranges routed into the cluster.
        ranges: Vec<String>,
    },

    /// Marked traffic now reaches this machine.
    MeshConfigured {
        /// Mesh mode (`auto` or `manual`).
        mode: String,
        /// Service being meshed (`namespace/name`).
        service: String,
        /// Version mark as `key:value`.
        version_mark: String,
        /// Exposed ports as given on the command line.
        expose: String,
    },

    /// Session changes were undone.
    Cleanup {
        /// Steps undone successfully.
        undone: usize,
        /// Steps that failed.
        failed: usize,
        /// Leftovers of earlier sessions removed.
        swept: usize,
    },

    /// Session ended.
    SessionEnd {
        /// Username of the person who ran the session.
        user: String,
        /// Why the session ended.
        reason: String,
        /// Duration of the session in seconds.
        duration_sec: u64,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json(event: &AuditEvent) -> String {
        serde_json::to_string(&event.with_timestamp()).unwrap()
    }

    #[test]
    fn test_session_start_serialization() {
        let json = to_json(&AuditEvent::SessionStart {
            user: "developer".to_string(),
            service: "dev/tomcat".to_string(),
            pid: 12345,
        });

        assert!(json.contains("\"event\":\"session_start\""));
        assert!(json.contains("\"user\":\"developer\""));
        assert!(json.contains("\"service\":\"dev/tomcat\""));
        assert!(json.contains("\"pid\":12345"));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_tunnel_up_serialization() {
        let json = to_json(&AuditEvent::TunnelUp {
            mode: "tun2socks".to_string(),
            ranges: vec!["10.96.0.0/16".to_string()],
        });

        assert!(json.contains("\"event\":\"tunnel_up\""));
        assert!(json.contains("\"ranges\":[\"10.96.0.0/16\"]"));
    }

    #[test]
    fn test_mesh_configured_serialization() {
        let json = to_json(&AuditEvent::MeshConfigured {
            mode: "manual".to_string(),
            service: "dev/tomcat".to_string(),
            version_mark: "mark:local".to_string(),
            expose: "8080:80".to_string(),
        });

        assert!(json.contains("\"event\":\"mesh_configured\""));
        assert!(json.contains("\"version_mark\":\"mark:local\""));
        assert!(json.contains("\"expose\":\"8080:80\""));
    }

    #[test]
    fn test_cleanup_serialization() {
        let json = to_json(&AuditEvent::Cleanup {
            undone: 7,
            failed: 1,
            swept: 0,
        });

        assert!(json.contains("\"event\":\"cleanup\""));
        assert!(json.contains("\"undone\":7"));
        assert!(json.contains("\"failed\":1"));
    }

    #[test]
    fn test_session_end_serialization() {
        let json = to_json(&AuditEvent::SessionEnd {
            user: "developer".to_string(),
            reason: "signal SIGINT".to_string(),
            duration_sec: 179,
        });

        assert!(json.contains("\"event\":\"session_end\""));
        assert!(json.contains("\"reason\":\"signal SIGINT\""));
        assert!(json.contains("\"duration_sec\":179"));
    }
}
