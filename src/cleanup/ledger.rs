//! Undo ledger.
//!
//! Every stage that changes local or cluster state records how to reverse
//! the change. Unwinding replays the ledger newest-first, so mesh routing is
//! removed before the tunnel it depends on is torn down.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::CleanupResult;
use crate::cluster::{Kubectl, PatchType};
use crate::tunnel::{hosts, route};

/// A single reversible change made during a session.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoStep {
    /// Remove the service names a session wrote to the hosts file.
    RemoveHostsEntries {
        /// Hosts file.
        path: PathBuf,
        /// Session that owns the block.
        pid: u32,
    },
    /// Remove a route added through the tun device.
    DeleteRoute {
        /// Destination range.
        cidr: String,
        /// Device the route points at.
        device: String,
    },
    /// Delete a cluster object created by the session.
    DeleteObject {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// Object namespace.
        namespace: String,
    },
    /// Revert a patch applied to a pre-existing cluster object.
    Patch {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// Object namespace.
        namespace: String,
        /// Patch flavour.
        patch_type: PatchType,
        /// The reverting patch.
        patch: Value,
    },
}

impl UndoStep {
    /// Shorthand for [`UndoStep::DeleteObject`].
    pub fn delete(kind: &str, name: &str, namespace: &str) -> Self {
        UndoStep::DeleteObject {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl fmt::Display for UndoStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoStep::RemoveHostsEntries { path, .. } => {
                write!(f, "remove service names from {}", path.display())
            }
            UndoStep::DeleteRoute { cidr, device } => {
                write!(f, "delete route {} dev {}", cidr, device)
            }
            UndoStep::DeleteObject {
                kind,
                name,
                namespace,
            } => write!(f, "delete {} {}/{}", kind, namespace, name),
            UndoStep::Patch {
                kind,
                name,
                namespace,
                ..
            } => write!(f, "restore {} {}/{}", kind, namespace, name),
        }
    }
}

/// Shared, append-only record of undo steps for one session.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    steps: Arc<Mutex<Vec<UndoStep>>>,
}

impl Ledger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one step.
    pub fn record(&self, step: UndoStep) {
        debug!("Recorded undo step: {}", step);
        self.lock().push(step);
    }

    /// Record several steps in order.
    pub fn record_all(&self, steps: impl IntoIterator<Item = UndoStep>) {
        for step in steps {
            self.record(step);
        }
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the recorded steps, oldest first.
    pub fn snapshot(&self) -> Vec<UndoStep> {
        self.lock().clone()
    }

    /// Remove and return all steps, newest first.
    pub fn drain_reversed(&self) -> Vec<UndoStep> {
        let mut steps = std::mem::take(&mut *self.lock());
        steps.reverse();
        steps
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UndoStep>> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Carries out undo steps and the startup sweep.
pub trait CleanupExecutor: Send + Sync {
    /// Undo one step.
    fn undo(&self, step: &UndoStep) -> CleanupResult<()>;

    /// Remove leftovers from earlier sessions that died without cleaning up.
    /// Returns how many items were removed.
    fn sweep_stale(&self) -> usize {
        0
    }
}

/// Executor that talks to the real system (hosts file, `ip`, `kubectl`).
pub struct SystemCleanup {
    kubectl: Kubectl,
    hosts_file: PathBuf,
}

impl SystemCleanup {
    /// Create an executor using the given kubectl context and hosts file.
    pub fn new(kubectl: Kubectl, hosts_file: PathBuf) -> Self {
        Self {
            kubectl,
            hosts_file,
        }
    }
}

impl CleanupExecutor for SystemCleanup {
    fn undo(&self, step: &UndoStep) -> CleanupResult<()> {
        match step {
            UndoStep::RemoveHostsEntries { path, pid } => {
                hosts::remove_entries(path, *pid)?;
                Ok(())
            }
            UndoStep::DeleteRoute { cidr, device } => Ok(route::delete_route(cidr, device)?),
            UndoStep::DeleteObject {
                kind,
                name,
                namespace,
            } => Ok(self.kubectl.delete(kind, name, namespace)?),
            UndoStep::Patch {
                kind,
                name,
                namespace,
                patch_type,
                patch,
            } => Ok(self
                .kubectl
                .patch(kind, name, namespace, *patch_type, patch)?),
        }
    }

    fn sweep_stale(&self) -> usize {
        let mut count = match hosts::remove_stale_blocks(&self.hosts_file) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to sweep {:?}: {}", self.hosts_file, e);
                0
            }
        };

        let stale = super::stale::find_stale_cluster_objects(&self.kubectl);
        count += stale.len();
        for step in &stale {
            info!("Removing leftover from a previous session: {}", step);
            if let Err(e) = self.undo(step) {
                warn!("Failed to {}: {}", step, e);
            }
        }
        count
    }
}

/// Outcome of unwinding a ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Steps undone successfully.
    pub undone: usize,
    /// Descriptions of steps that failed.
    pub failed: Vec<String>,
    /// Leftovers from earlier sessions removed by the startup sweep.
    pub swept: usize,
}

impl CleanupReport {
    /// True when every step was undone.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Undo every recorded step, newest first, continuing past failures.
pub fn unwind(ledger: &Ledger, executor: &dyn CleanupExecutor) -> CleanupReport {
    let mut report = CleanupReport::default();
    for step in ledger.drain_reversed() {
        match executor.undo(&step) {
            Ok(()) => {
                debug!("Undone: {}", step);
                report.undone += 1;
            }
            Err(e) => {
                warn!("Failed to {}: {}", step, e);
                report.failed.push(format!("{}: {}", step, e));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupError;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<UndoStep>>,
        fail_kind: Option<&'static str>,
    }

    impl CleanupExecutor for Recorder {
        fn undo(&self, step: &UndoStep) -> CleanupResult<()> {
            self.seen.lock().unwrap().push(step.clone());
            if let (Some(kind), UndoStep::DeleteObject { kind: k, .. }) = (self.fail_kind, step)
                && k == kind
            {
                return Err(CleanupError::Io(std::io::Error::other("boom")));
            }
            Ok(())
        }
    }

    fn hosts_step(pid: u32) -> UndoStep {
        UndoStep::RemoveHostsEntries {
            path: PathBuf::from("/etc/hosts"),
            pid,
        }
    }

    #[test]
    fn test_unwind_runs_newest_first() {
        let ledger = Ledger::new();
        ledger.record(hosts_step(10));
        ledger.record(UndoStep::delete("deployment", "tomcat-kt-router", "dev"));

        let recorder = Recorder::default();
        let report = unwind(&ledger, &recorder);

        assert_eq!(report.undone, 2);
        assert!(report.is_clean());
        let seen = recorder.seen.lock().unwrap();
        assert!(matches!(seen[0], UndoStep::DeleteObject { .. }));
        assert_eq!(seen[1], hosts_step(10));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_unwind_continues_past_failures() {
        let ledger = Ledger::new();
        ledger.record(hosts_step(10));
        ledger.record(UndoStep::delete("service", "tomcat-kt-mesh", "dev"));

        let recorder = Recorder {
            fail_kind: Some("service"),
            ..Default::default()
        };
        let report = unwind(&ledger, &recorder);

        assert_eq!(report.undone, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].contains("delete service dev/tomcat-kt-mesh"));
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_ledger_is_shared_between_clones() {
        let ledger = Ledger::new();
        let clone = ledger.clone();
        clone.record(hosts_step(1));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.snapshot(), vec![hosts_step(1)]);
    }

    #[test]
    fn test_system_cleanup_removes_hosts_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let entry = hosts::HostEntry {
            ip: "10.96.0.20".to_string(),
            names: vec!["tomcat.dev.svc.cluster.local".to_string()],
        };
        hosts::write_entries(&path, 42, &[entry]).unwrap();

        let cleanup = SystemCleanup::new(Kubectl::new("kubectl"), path.clone());
        let step = UndoStep::RemoveHostsEntries {
            path: path.clone(),
            pid: 42,
        };
        cleanup.undo(&step).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        // already gone
        cleanup.undo(&step).unwrap();
    }

    #[test]
    fn test_step_display() {
        assert_eq!(
            UndoStep::DeleteRoute {
                cidr: "10.96.0.0/12".to_string(),
                device: "kt0".to_string()
            }
            .to_string(),
            "delete route 10.96.0.0/12 dev kt0"
        );
    }
}
