//! The connect shadow: the in-cluster sshd both tunnel backends go through.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::info;

use super::error::{TunnelError, TunnelResult};
use super::TunnelContext;
use crate::cleanup::UndoStep;
use crate::cluster::shadow::{port_forward, AUTHORIZED_KEYS_ENV, SHADOW_SSH_PORT};
use crate::cluster::{
    ensure_identity, ownership_labels, random_suffix, ShadowSpec, SshEndpoint, LABEL_MANAGED_BY,
    LABEL_ROLE, MANAGED_BY,
};
use crate::process::SupervisedProcess;

/// Name of the shadow shared between sessions (`--shareShadow`).
pub const SHARED_SHADOW_NAME: &str = "kt-meshdebug-shadow-shared";

/// Label naming the shadow a pod belongs to.
pub const LABEL_SHADOW: &str = "kt-meshdebug/shadow";

const ROLE: &str = "connect-shadow";

/// Shadow name for this session.
pub fn shadow_name(shared: bool) -> String {
    if shared {
        SHARED_SHADOW_NAME.to_string()
    } else {
        format!("kt-meshdebug-shadow-{}", random_suffix())
    }
}

/// Labels for a connect shadow.
///
/// A shared shadow carries no owner labels: it outlives the session that
/// created it and must not be collected as a leftover.
pub fn shadow_labels(name: &str, shared: bool) -> BTreeMap<String, String> {
    let mut labels = if shared {
        [(LABEL_MANAGED_BY, MANAGED_BY), (LABEL_ROLE, ROLE)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    } else {
        ownership_labels(ROLE)
    };
    labels.insert(LABEL_SHADOW.to_string(), name.to_string());
    labels
}

/// Deploy (or reuse) the connect shadow and forward a local port to its sshd.
///
/// Undo steps are recorded as each piece comes up, so a failure part way
/// through is still cleaned up.
pub fn open_connect_shadow(
    ctx: &TunnelContext<'_>,
) -> TunnelResult<(SupervisedProcess, SshEndpoint)> {
    let public_key = ensure_identity(&ctx.shadow.identity)?;
    let shared = ctx.connect.share_shadow;
    let name = shadow_name(shared);

    let spec = ShadowSpec {
        name: name.clone(),
        namespace: ctx.namespace.to_string(),
        image: ctx.shadow.image.clone(),
        labels: shadow_labels(&name, shared),
        container_ports: Vec::new(),
        env: [(
            AUTHORIZED_KEYS_ENV.to_string(),
            public_key,
        )]
        .into_iter()
        .collect(),
    };

    if !shared {
        ctx.ledger
            .record(UndoStep::delete("deployment", &name, ctx.namespace));
    }
    spec.deploy(ctx.kubectl, ctx.shadow.ready_timeout)?;

    let (forward, port) = port_forward(
        ctx.kubectl,
        &name,
        ctx.namespace,
        SHADOW_SSH_PORT,
        ctx.shadow.ready_timeout,
    )?;
    info!("Connect shadow {}/{} reachable on 127.0.0.1:{}", ctx.namespace, name, port);

    Ok((
        forward,
        SshEndpoint {
            user: ctx.shadow.user.clone(),
            port,
            identity: Some(ctx.shadow.identity.clone()),
        },
    ))
}

/// Give a freshly started process a moment, then fail if it already exited.
pub fn ensure_alive(process: &mut SupervisedProcess, grace: Duration) -> TunnelResult<()> {
    std::thread::sleep(grace);
    match process.try_exit_code() {
        Ok(Some(code)) => Err(TunnelError::ProcessExited {
            component: process.component.clone(),
            code,
        }),
        Ok(None) => Ok(()),
        Err(source) => Err(TunnelError::Spawn {
            component: process.component.clone(),
            source,
        }),
    }
}

/// Spawn a helper process, reporting failure as a tunnel error.
pub fn spawn_helper(
    component: &str,
    command: &crate::process::CommandLine,
) -> TunnelResult<SupervisedProcess> {
    SupervisedProcess::spawn(component, command).map_err(|source| TunnelError::Spawn {
        component: component.to_string(),
        source,
    })
}
