//! Garbage collection for sessions that died without cleaning up.
//!
//! The undo ledger only helps while the process is alive. If a session is
//! killed with SIGKILL or the machine loses power, it leaves behind:
//!
//! - PID files in the app home directory
//! - Shadow and router objects in the cluster
//! - Services whose selector still points at a router
//! - Its service name block in the hosts file (see `tunnel::hosts`)
//!
//! Cluster objects carry ownership labels (host and PID). Anything owned by
//! this host whose PID no longer exists is a leftover and gets removed the
//! next time a session starts.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::ledger::UndoStep;
use crate::cluster::{
    local_hostname, Kubectl, LABEL_MANAGED_BY, LABEL_OWNER_HOST, LABEL_OWNER_PID, MANAGED_BY,
};
use crate::mesh::auto::{parse_owner_annotation, restore_selector_step, ANNOTATION_OWNER};
use crate::process::process_exists;

/// Prefix of PID files written by the prepare step.
pub const PID_FILE_PREFIX: &str = "meshdebug-";

/// Suffix of PID files written by the prepare step.
pub const PID_FILE_SUFFIX: &str = ".pid";

/// Kinds of object a session may create.
const OWNED_KINDS: &str = "deployments,services";

/// Remove PID files whose process no longer exists.
///
/// Returns the number of files removed.
pub fn cleanup_stale_pid_files(app_home: &Path) -> usize {
    let stale = list_stale_pid_files(app_home);
    let mut removed = 0;
    for path in stale {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed stale PID file {:?}", path);
                removed += 1;
            }
            Err(e) => warn!("Failed to remove stale PID file {:?}: {}", path, e),
        }
    }
    removed
}

/// PID files in `app_home` whose process is gone.
pub fn list_stale_pid_files(app_home: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(app_home) {
        Ok(e) => e,
        Err(e) => {
            debug!("Cannot read {:?}: {}", app_home, e);
            return Vec::new();
        }
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let pid = name
                .strip_prefix(PID_FILE_PREFIX)?
                .strip_suffix(PID_FILE_SUFFIX)?
                .parse::<u32>()
                .ok()?;
            (!process_exists(pid)).then(|| entry.path())
        })
        .collect()
}

/// Cluster leftovers owned by this host whose session is gone.
///
/// Errors are logged and treated as "nothing to clean"; the sweep is best
/// effort and must never block a new session.
pub fn find_stale_cluster_objects(kubectl: &Kubectl) -> Vec<UndoStep> {
    let host = local_hostname();
    let selector = format!("{}={},{}={}", LABEL_MANAGED_BY, MANAGED_BY, LABEL_OWNER_HOST, host);

    let mut steps = match kubectl.list_json(OWNED_KINDS, None, Some(&selector)) {
        Ok(items) => stale_objects(&items, process_exists),
        Err(e) => {
            debug!("Skipping stale object sweep: {}", e);
            Vec::new()
        }
    };

    match kubectl.list_json("services", None, None) {
        Ok(services) => steps.extend(stale_selector_patches(&services, &host, process_exists)),
        Err(e) => debug!("Skipping stale selector sweep: {}", e),
    }

    if !steps.is_empty() {
        info!("Found {} leftover(s) from previous sessions", steps.len());
    }
    steps
}

/// Select owned objects whose owner PID is not alive.
pub fn stale_objects(items: &[Value], is_alive: impl Fn(u32) -> bool) -> Vec<UndoStep> {
    items
        .iter()
        .filter_map(|item| {
            let kind = item.get("kind")?.as_str()?;
            let metadata = item.get("metadata")?;
            let name = metadata.get("name")?.as_str()?;
            let namespace = metadata.get("namespace")?.as_str()?;
            let pid = metadata
                .get("labels")?
                .get(LABEL_OWNER_PID)?
                .as_str()?
                .parse::<u32>()
                .ok()?;
            (!is_alive(pid)).then(|| UndoStep::delete(&kind.to_ascii_lowercase(), name, namespace))
        })
        .collect()
}

/// Services whose selector was redirected by a session on this host that is
/// no longer alive; returns the patches that restore them.
pub fn stale_selector_patches(
    services: &[Value],
    host: &str,
    is_alive: impl Fn(u32) -> bool,
) -> Vec<UndoStep> {
    services
        .iter()
        .filter_map(|svc| {
            let metadata = svc.get("metadata")?;
            let owner = metadata.get("annotations")?.get(ANNOTATION_OWNER)?.as_str()?;
            let (owner_host, pid) = parse_owner_annotation(owner)?;
            if owner_host != host || is_alive(pid) {
                return None;
            }
            let name = metadata.get("name")?.as_str()?;
            let namespace = metadata.get("namespace")?.as_str()?;
            restore_selector_step(svc, name, namespace)
        })
        .collect()
}
