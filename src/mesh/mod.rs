//! Mesh routing toward this machine.
//!
//! Both backends deploy a mesh shadow carrying the version mark and
//! reverse-forward the exposed ports from it to local processes. They differ
//! in how marked traffic reaches that shadow:
//!
//! - **auto**: a router deployment is put in front of the service
//! - **manual**: the service's istio VirtualService and DestinationRule are
//!   patched
//!
//! [`MeshSelector`] runs exactly one of them, chosen by the closed
//! [`MeshMode`]. Like the tunnel backends, each change is recorded in the
//! session ledger as soon as it is made.

pub mod auto;
mod error;
pub mod manual;
mod mark;
pub mod shadow;

use tracing::info;

use crate::cleanup::Ledger;
use crate::cluster::{Kubectl, ServiceDescriptor};
use crate::config::{MeshConfig, MeshMode, SessionConfig, ShadowSettings};
use crate::process::SupervisedProcess;

pub use error::{MeshError, MeshResult};
pub use mark::{VersionMark, DEFAULT_MARK_KEY};

/// What a backend needs from the session.
pub struct MeshContext<'a> {
    /// kubectl invocation context.
    pub kubectl: &'a Kubectl,
    /// The service being meshed.
    pub service: &'a ServiceDescriptor,
    /// Mesh options.
    pub mesh: &'a MeshConfig,
    /// Shadow settings.
    pub shadow: &'a ShadowSettings,
    /// Where undo steps go.
    pub ledger: &'a Ledger,
}

impl<'a> MeshContext<'a> {
    /// Borrow everything from the session.
    pub fn new(
        session: &'a SessionConfig,
        service: &'a ServiceDescriptor,
        ledger: &'a Ledger,
    ) -> Self {
        Self {
            kubectl: &session.kubectl,
            service,
            mesh: &session.mesh,
            shadow: &session.shadow,
            ledger,
        }
    }
}

/// Mesh routing in place.
#[derive(Debug, Default)]
pub struct ConfiguredMesh {
    /// Helper processes that must stay alive.
    pub processes: Vec<SupervisedProcess>,
}

/// Something that can configure mesh routing.
pub trait MeshBackend: Send + Sync {
    /// Route marked traffic for the context's service to this machine.
    fn configure(&self, mode: &MeshMode, ctx: &MeshContext<'_>) -> MeshResult<ConfiguredMesh>;
}

/// Dispatches to the backend named by the mesh mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshSelector;

impl MeshBackend for MeshSelector {
    fn configure(&self, mode: &MeshMode, ctx: &MeshContext<'_>) -> MeshResult<ConfiguredMesh> {
        info!(
            "Meshing {}/{} in {} mode with version mark {}",
            ctx.service.namespace, ctx.service.name, mode, ctx.mesh.version_mark
        );
        match mode {
            MeshMode::Auto { router_image } => auto::configure(router_image, ctx),
            MeshMode::Manual { vs_name, dr_name } => {
                manual::configure(vs_name.as_deref(), dr_name.as_deref(), ctx)
            }
        }
    }
}
