//! Cluster access.
//!
//! Everything that touches the cluster goes through `kubectl`, so the user's
//! kubeconfig, context and credentials apply unchanged. Objects created by a
//! session carry ownership labels naming the host and PID that created them,
//! which lets a later session find and remove leftovers from one that was
//! killed before it could clean up.

mod error;
pub mod kubectl;
pub mod service;
pub mod shadow;

use std::collections::BTreeMap;

pub use error::{ClusterError, ClusterResult};
pub use kubectl::{Kubectl, PatchType};
pub use service::{KubectlResolver, ResourceRef, ServiceDescriptor, ServicePort, ServiceResolver};
pub use shadow::{ensure_identity, ShadowSpec, SshEndpoint};

/// Standard managed-by label.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on every object we create.
pub const MANAGED_BY: &str = "kt-meshdebug";

/// Role of the object within a session (`shadow`, `router`, ...).
pub const LABEL_ROLE: &str = "kt-meshdebug/role";

/// Hostname of the machine that owns the object.
pub const LABEL_OWNER_HOST: &str = "kt-meshdebug/host";

/// PID of the session that owns the object.
pub const LABEL_OWNER_PID: &str = "kt-meshdebug/pid";

/// Labels marking an object as owned by this session.
pub fn ownership_labels(role: &str) -> BTreeMap<String, String> {
    [
        (LABEL_MANAGED_BY, MANAGED_BY.to_string()),
        (LABEL_ROLE, role.to_string()),
        (LABEL_OWNER_HOST, local_hostname()),
        (LABEL_OWNER_PID, std::process::id().to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Five random lowercase hex characters, for object names and version marks.
pub fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..5].to_string()
}

/// Hostname reduced to a valid label value.
pub fn local_hostname() -> String {
    let raw = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    sanitize_label_value(&raw)
}

/// Reduce arbitrary text to a Kubernetes label value: at most 63
/// alphanumerics, `-`, `_` or `.`, starting and ending alphanumeric.
pub fn sanitize_label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    let trimmed = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}
