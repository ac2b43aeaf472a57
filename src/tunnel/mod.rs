//! Network tunnel into the cluster.
//!
//! Two interchangeable backends reach the cluster network through a connect
//! shadow (an sshd pod reached over `kubectl port-forward`):
//!
//! - **tun2socks**: socks5 proxy over ssh, a tun device, and kernel routes
//! - **sshuttle**: sshuttle's transparent proxy
//!
//! [`TunnelSelector`] runs exactly one of them, chosen by the closed
//! [`ConnectMode`], then applies the DNS mode (see [`hosts`]). Every change
//! is recorded in the session ledger as it is made, so a failure half way
//! through is unwound like any other exit.

pub mod cidr;
mod connect;
mod error;
pub mod hosts;
pub mod route;
pub mod sshuttle;
pub mod tun2socks;

use tracing::info;

use crate::cleanup::Ledger;
use crate::cluster::Kubectl;
use crate::config::{ConnectConfig, ConnectMode, SessionConfig, ShadowSettings, TunnelSettings};
use crate::process::SupervisedProcess;

pub use connect::{SHARED_SHADOW_NAME, LABEL_SHADOW};
pub use error::{TunnelError, TunnelResult};
pub use hosts::HostsRefresh;

/// What a backend needs from the session.
pub struct TunnelContext<'a> {
    /// kubectl invocation context.
    pub kubectl: &'a Kubectl,
    /// Namespace the connect shadow lives in.
    pub namespace: &'a str,
    /// Connect options.
    pub connect: &'a ConnectConfig,
    /// Shadow settings.
    pub shadow: &'a ShadowSettings,
    /// Local tunnel tooling.
    pub settings: &'a TunnelSettings,
    /// Where undo steps go.
    pub ledger: &'a Ledger,
}

impl<'a> TunnelContext<'a> {
    /// Borrow everything from the session.
    pub fn new(session: &'a SessionConfig, ledger: &'a Ledger) -> Self {
        Self {
            kubectl: &session.kubectl,
            namespace: &session.namespace,
            connect: &session.connect,
            shadow: &session.shadow,
            settings: &session.tunnel,
            ledger,
        }
    }
}

/// A live tunnel.
#[derive(Debug, Default)]
pub struct EstablishedTunnel {
    /// Helper processes that must stay alive.
    pub processes: Vec<SupervisedProcess>,
    /// Ranges routed into the cluster.
    pub ranges: Vec<String>,
    /// Periodic hosts file rewrite, in localDNS mode.
    pub dns_refresh: Option<HostsRefresh>,
}

/// Something that can bring the tunnel up.
pub trait TunnelBackend: Send + Sync {
    /// Establish the tunnel for `mode`.
    fn establish(
        &self,
        mode: &ConnectMode,
        ctx: &TunnelContext<'_>,
    ) -> TunnelResult<EstablishedTunnel>;
}

/// Dispatches to the backend named by the connect mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelSelector;

impl TunnelBackend for TunnelSelector {
    fn establish(
        &self,
        mode: &ConnectMode,
        ctx: &TunnelContext<'_>,
    ) -> TunnelResult<EstablishedTunnel> {
        info!("Connecting to the cluster in {} mode", mode);
        let mut tunnel = match mode {
            ConnectMode::Tun2Socks(options) => tun2socks::establish(options, ctx)?,
            ConnectMode::Sshuttle => sshuttle::establish(ctx)?,
        };
        hosts::apply(ctx, &mut tunnel)?;
        Ok(tunnel)
    }
}
