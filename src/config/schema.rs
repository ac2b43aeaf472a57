//! Configuration file schema.
//!
//! Settings that rarely change between invocations live in TOML files rather
//! than on the command line:
//!
//! ```toml
//! [cluster]
//! kubeconfig = "/home/dev/.kube/staging"
//! context = "staging"
//! namespace = "dev"
//!
//! [shadow]
//! image = "registry.example.com/kt-meshdebug-shadow:v0.1.0"
//! user = "root"
//!
//! [tunnel]
//! tun_device = "kt0"
//! cluster_cidrs = ["10.96.0.0/12"]
//!
//! [mesh]
//! router_image = "registry.example.com/kt-meshdebug-router"
//! ```
//!
//! Every field is optional. Files are merged in hierarchy order; scalars set
//! by a later file override earlier ones and lists are appended.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default image running sshd for shadow deployments.
pub const DEFAULT_SHADOW_IMAGE: &str =
    "registry.cn-hangzhou.aliyuncs.com/rdc-incubator/kt-connect-shadow";

/// Default router image, without tag.
pub const DEFAULT_ROUTER_IMAGE: &str =
    "registry.cn-hangzhou.aliyuncs.com/rdc-incubator/kt-connect-router";

/// Default tun device name.
pub const DEFAULT_TUN_DEVICE: &str = "kt0";

/// Hosts file that receives cluster service names.
pub const DEFAULT_HOSTS_FILE: &str = "/etc/hosts";

/// Default namespace.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default app home directory name, under the user's home.
pub const APP_HOME_DIR: &str = ".kt-meshdebug";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Cluster access.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Shadow workload settings.
    #[serde(default)]
    pub shadow: ShadowConfig,

    /// Tunnel backend settings.
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Mesh backend settings.
    #[serde(default)]
    pub mesh: MeshFileConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists are appended, scalars are overridden when set.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.cluster.merge(other.cluster);
        self.shadow.merge(other.shadow);
        self.tunnel.merge(other.tunnel);
        self.mesh.merge(other.mesh);
    }
}

fn override_opt<T>(slot: &mut Option<T>, other: Option<T>) {
    if other.is_some() {
        *slot = other;
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct GeneralConfig {
    /// Directory for PID files and generated keys. Defaults to `~/.kt-meshdebug`.
    #[serde(default)]
    pub app_home: Option<PathBuf>,

    /// Seconds to wait for cleanup on exit.
    #[serde(default)]
    pub cleanup_timeout_secs: Option<u64>,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        override_opt(&mut self.app_home, other.app_home);
        override_opt(&mut self.cleanup_timeout_secs, other.cleanup_timeout_secs);
    }
}

/// Cluster access settings, handed to kubectl.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ClusterConfig {
    /// kubectl binary.
    #[serde(default)]
    pub kubectl: Option<PathBuf>,

    /// Kubeconfig file.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context.
    #[serde(default)]
    pub context: Option<String>,

    /// Default namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl ClusterConfig {
    fn merge(&mut self, other: ClusterConfig) {
        override_opt(&mut self.kubectl, other.kubectl);
        override_opt(&mut self.kubeconfig, other.kubeconfig);
        override_opt(&mut self.context, other.context);
        override_opt(&mut self.namespace, other.namespace);
    }
}

/// Shadow workload settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ShadowConfig {
    /// Image running sshd on port 22.
    #[serde(default)]
    pub image: Option<String>,

    /// SSH login user.
    #[serde(default)]
    pub user: Option<String>,

    /// Private key; generated in the app home when unset.
    #[serde(default)]
    pub identity: Option<PathBuf>,

    /// Seconds to wait for a shadow to become ready.
    #[serde(default)]
    pub ready_timeout_secs: Option<u64>,
}

impl ShadowConfig {
    fn merge(&mut self, other: ShadowConfig) {
        override_opt(&mut self.image, other.image);
        override_opt(&mut self.user, other.user);
        override_opt(&mut self.identity, other.identity);
        override_opt(&mut self.ready_timeout_secs, other.ready_timeout_secs);
    }
}

/// Tunnel backend settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct TunnelConfig {
    /// Tun device created by tun2socks.
    #[serde(default)]
    pub tun_device: Option<String>,

    /// tun2socks binary.
    #[serde(default)]
    pub tun2socks_binary: Option<PathBuf>,

    /// sshuttle binary.
    #[serde(default)]
    pub sshuttle_binary: Option<PathBuf>,

    /// Remote for sshuttle (`user@host[:port]`); the connect shadow when unset.
    #[serde(default)]
    pub sshuttle_remote: Option<String>,

    /// Service and pod ranges routed into the cluster.
    #[serde(default)]
    pub cluster_cidrs: Vec<String>,

    /// Hosts file written in the hosts and localDNS modes.
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,
}

impl TunnelConfig {
    fn merge(&mut self, other: TunnelConfig) {
        override_opt(&mut self.tun_device, other.tun_device);
        override_opt(&mut self.tun2socks_binary, other.tun2socks_binary);
        override_opt(&mut self.sshuttle_binary, other.sshuttle_binary);
        override_opt(&mut self.sshuttle_remote, other.sshuttle_remote);
        override_opt(&mut self.hosts_file, other.hosts_file);
        self.cluster_cidrs.extend(other.cluster_cidrs);
    }
}

/// Mesh backend settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct MeshFileConfig {
    /// Router image without tag; the crate version is appended.
    #[serde(default)]
    pub router_image: Option<String>,
}

impl MeshFileConfig {
    fn merge(&mut self, other: MeshFileConfig) {
        override_opt(&mut self.router_image, other.router_image);
    }
}
