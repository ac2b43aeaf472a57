//! Shadow workloads.
//!
//! A shadow is a small sshd deployment created in the target namespace. The
//! tunnel backends reach the cluster network through it, and the mesh
//! backends use one carrying the version mark as the in-cluster end of the
//! reverse forward toward the developer's machine.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info};

use super::error::{ClusterError, ClusterResult};
use super::kubectl::Kubectl;
use crate::process::{CommandLine, SupervisedProcess};

/// sshd port inside every shadow container.
pub const SHADOW_SSH_PORT: u16 = 22;

/// Environment variable the shadow image reads authorized keys from.
pub const AUTHORIZED_KEYS_ENV: &str = "AUTHORIZED_KEYS";

/// Description of a shadow deployment.
#[derive(Debug, Clone)]
pub struct ShadowSpec {
    /// Deployment name.
    pub name: String,
    /// Namespace to create it in.
    pub namespace: String,
    /// Container image (must run sshd on port 22).
    pub image: String,
    /// Pod labels.
    pub labels: BTreeMap<String, String>,
    /// Extra container ports to declare.
    pub container_ports: Vec<u16>,
    /// Container environment.
    pub env: BTreeMap<String, String>,
}

impl ShadowSpec {
    /// Render the Deployment manifest.
    pub fn manifest(&self) -> Value {
        let mut ports = vec![json!({"name": "ssh", "containerPort": SHADOW_SSH_PORT})];
        ports.extend(
            self.container_ports
                .iter()
                .filter(|p| **p != SHADOW_SSH_PORT)
                .map(|p| json!({"containerPort": p})),
        );
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v}))
            .collect();

        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "labels": self.labels,
            },
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": self.labels},
                "template": {
                    "metadata": {"labels": self.labels},
                    "spec": {
                        "containers": [{
                            "name": "shadow",
                            "image": self.image,
                            "imagePullPolicy": "IfNotPresent",
                            "ports": ports,
                            "env": env,
                        }]
                    }
                }
            }
        })
    }

    /// Create the deployment and wait until it is rolled out.
    pub fn deploy(&self, kubectl: &Kubectl, timeout: Duration) -> ClusterResult<()> {
        info!("Creating shadow deployment {}/{}", self.namespace, self.name);
        kubectl.apply(&self.manifest())?;
        kubectl.rollout_status(&self.name, &self.namespace, timeout)
    }
}

/// How to reach a shadow's sshd through a local port-forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    /// Login user.
    pub user: String,
    /// Local port forwarded to the shadow's sshd.
    pub port: u16,
    /// Private key to authenticate with.
    pub identity: Option<PathBuf>,
}

impl SshEndpoint {
    /// `user@127.0.0.1`
    pub fn destination(&self) -> String {
        format!("{}@127.0.0.1", self.user)
    }

    /// `ssh` with host key checking disabled (shadow host keys are
    /// ephemeral) and the identity applied, but no port.
    pub fn ssh_options(&self) -> CommandLine {
        CommandLine::new("ssh")
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "ServerAliveInterval=15"])
            .args(["-o", "ExitOnForwardFailure=yes"])
            .opt("-i", self.identity.as_ref())
    }

    /// [`SshEndpoint::ssh_options`] plus the forwarded port.
    pub fn ssh_command(&self) -> CommandLine {
        self.ssh_options().arg("-p").arg(self.port.to_string())
    }
}

/// Make sure `identity` holds a private key and return its public half.
///
/// A missing key pair is generated with `ssh-keygen`; shadows receive the
/// public key through [`AUTHORIZED_KEYS_ENV`].
pub fn ensure_identity(identity: &Path) -> ClusterResult<String> {
    let public = public_key_path(identity);
    if !identity.exists() {
        if let Some(parent) = identity.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ClusterError::CommandFailed {
                cmd: format!("mkdir -p {}", parent.display()),
                source,
            })?;
        }
        let cmd = CommandLine::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", "kt-meshdebug", "-f"])
            .arg(identity);
        let cmd_str = cmd.to_command_line();
        info!("Generating ssh key pair {}", identity.display());
        let output = cmd
            .to_std()
            .output()
            .map_err(|source| ClusterError::CommandFailed {
                cmd: cmd_str.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ClusterError::CommandError {
                cmd: cmd_str,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
    }

    std::fs::read_to_string(&public)
        .map(|key| key.trim().to_string())
        .map_err(|source| ClusterError::CommandFailed {
            cmd: format!("read {}", public.display()),
            source,
        })
}

/// `<identity>.pub`
pub fn public_key_path(identity: &Path) -> PathBuf {
    let mut name = identity.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

/// Ask the OS for a free local TCP port.
pub fn free_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Poll until something accepts connections on a loopback port.
pub fn wait_for_local_port(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    false
}

/// Start `kubectl port-forward deployment/<name> <local>:<remote>`.
///
/// Returns the supervised forward process and the local port once the
/// forward accepts connections.
pub fn port_forward(
    kubectl: &Kubectl,
    deployment: &str,
    namespace: &str,
    remote_port: u16,
    timeout: Duration,
) -> ClusterResult<(SupervisedProcess, u16)> {
    let target = format!("deployment/{}", deployment);
    let fail = |message: String| ClusterError::PortForward {
        target: target.clone(),
        message,
    };

    let local_port = free_local_port().map_err(|e| fail(e.to_string()))?;
    let cmd = kubectl
        .command_line()
        .args(["port-forward", target.as_str(), "-n", namespace])
        .arg(format!("{}:{}", local_port, remote_port));

    let process = SupervisedProcess::spawn(format!("port-forward/{}", deployment), &cmd)
        .map_err(|e| fail(e.to_string()))?;

    // dropping the handle kills a forward that never became ready
    if !wait_for_local_port(local_port, timeout) {
        return Err(fail(format!(
            "local port {} not ready after {}s",
            local_port,
            timeout.as_secs()
        )));
    }

    debug!("Forwarding 127.0.0.1:{} to {}:{}", local_port, target, remote_port);
    Ok((process, local_port))
}
