//! The mesh shadow: the in-cluster end of the reverse forward to this machine.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::info;

use super::error::{MeshError, MeshResult};
use super::MeshContext;
use crate::cleanup::UndoStep;
use crate::cluster::shadow::{port_forward, AUTHORIZED_KEYS_ENV, SHADOW_SSH_PORT};
use crate::cluster::{ensure_identity, ownership_labels, ShadowSpec, SshEndpoint};
use crate::expose::ExposeRule;
use crate::process::{CommandLine, SupervisedProcess};
use crate::tunnel::LABEL_SHADOW;

const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// `<service>-kt-mesh-<mark>`
pub fn mesh_shadow_name(service: &str, mark_suffix: &str) -> String {
    format!("{}-kt-mesh-{}", service, mark_suffix)
}

/// `ssh -N -R 0.0.0.0:<remote>:127.0.0.1:<local> ...` for every rule.
pub fn reverse_forward_command(endpoint: &SshEndpoint, rules: &[ExposeRule]) -> CommandLine {
    let mut cmd = endpoint.ssh_command().arg("-N");
    for rule in rules {
        cmd = cmd
            .arg("-R")
            .arg(format!("0.0.0.0:{}:127.0.0.1:{}", rule.remote_port, rule.local_port));
    }
    cmd.arg(endpoint.destination())
}

/// Deploy the mesh shadow carrying `extra_labels` plus the version mark, and
/// forward the exposed ports from it to this machine.
///
/// Returns the shadow name and the helper processes.
pub fn open_mesh_shadow(
    ctx: &MeshContext<'_>,
    extra_labels: &BTreeMap<String, String>,
) -> MeshResult<(String, Vec<SupervisedProcess>)> {
    let service = &ctx.service.name;
    let namespace = &ctx.service.namespace;
    let mark = &ctx.mesh.version_mark;
    let name = mesh_shadow_name(service, &mark.name_suffix());

    let mut labels = extra_labels.clone();
    labels.extend(ownership_labels("mesh-shadow"));
    labels.insert(LABEL_SHADOW.to_string(), name.clone());
    labels.insert(mark.key.clone(), mark.value.clone());

    let spec = ShadowSpec {
        name: name.clone(),
        namespace: namespace.clone(),
        image: ctx.shadow.image.clone(),
        labels,
        container_ports: ctx.mesh.expose.iter().map(|r| r.remote_port).collect(),
        env: [(
            AUTHORIZED_KEYS_ENV.to_string(),
            ensure_identity(&ctx.shadow.identity)?,
        )]
        .into_iter()
        .collect(),
    };

    ctx.ledger.record(UndoStep::delete("deployment", &name, namespace));
    spec.deploy(ctx.kubectl, ctx.shadow.ready_timeout)?;

    let (forward, port) = port_forward(
        ctx.kubectl,
        &name,
        namespace,
        SHADOW_SSH_PORT,
        ctx.shadow.ready_timeout,
    )?;

    let endpoint = SshEndpoint {
        user: ctx.shadow.user.clone(),
        port,
        identity: Some(ctx.shadow.identity.clone()),
    };
    let component = "reverse-forward";
    let command = reverse_forward_command(&endpoint, &ctx.mesh.expose);
    let mut reverse =
        SupervisedProcess::spawn(component, &command).map_err(|source| MeshError::Spawn {
            component: component.to_string(),
            source,
        })?;

    std::thread::sleep(STARTUP_GRACE);
    if let Ok(Some(_)) = reverse.try_exit_code() {
        return Err(MeshError::ProcessExited {
            component: component.to_string(),
        });
    }

    info!(
        "Mesh shadow {}/{} forwards {} to this machine",
        namespace,
        name,
        crate::expose::format_expose(&ctx.mesh.expose)
    );
    Ok((name, vec![forward, reverse]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_forward_command() {
        let endpoint = SshEndpoint {
            user: "root".to_string(),
            port: 40023,
            identity: None,
        };
        let rules = vec![
            ExposeRule::same(7001),
            ExposeRule {
                local_port: 8080,
                remote_port: 80,
            },
        ];
        let line = reverse_forward_command(&endpoint, &rules).to_command_line();
        assert!(line.contains("-p 40023 -N"));
        assert!(line.contains("-R 0.0.0.0:7001:127.0.0.1:7001"));
        assert!(line.ends_with("-R 0.0.0.0:80:127.0.0.1:8080 root@127.0.0.1"));
    }

    #[test]
    fn test_mesh_shadow_name() {
        assert_eq!(mesh_shadow_name("tomcat", "a1b2c"), "tomcat-kt-mesh-a1b2c");
    }
}
