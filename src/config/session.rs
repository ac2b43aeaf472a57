//! The immutable per-invocation session configuration.
//!
//! CLI flags are merged over the file hierarchy once, at startup, into a
//! [`SessionConfig`] that is passed by reference to every stage. Mode strings
//! are turned into closed enums here, so an unknown mode is rejected before
//! anything touches the network or the cluster.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::error::ConfigError;
use super::schema::{
    Config, APP_HOME_DIR, DEFAULT_HOSTS_FILE, DEFAULT_NAMESPACE, DEFAULT_ROUTER_IMAGE,
    DEFAULT_SHADOW_IMAGE, DEFAULT_TUN_DEVICE,
};
use crate::cli::Cli;
use crate::cluster::Kubectl;
use crate::expose::{parse_expose, ExposeRule};
use crate::mesh::{MeshError, VersionMark};
use crate::tunnel::cidr::parse_range;

/// Default cleanup wait on exit.
const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 30;

/// Default wait for a shadow to be ready.
const DEFAULT_READY_TIMEOUT_SECS: u64 = 120;

/// Options that only apply to the tun2socks backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tun2SocksOptions {
    /// Local port of the socks5 proxy.
    pub socks_port: u16,
    /// Run the socks5 proxy only, without a tun device.
    pub disable_tun_device: bool,
    /// Create the tun device but add no routes.
    pub disable_tun_route: bool,
}

/// Tunnel backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// socks5 proxy over ssh plus a tun device.
    Tun2Socks(Tun2SocksOptions),
    /// sshuttle transparent proxy.
    Sshuttle,
}

impl ConnectMode {
    /// Name as accepted on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectMode::Tun2Socks(_) => "tun2socks",
            ConnectMode::Sshuttle => "sshuttle",
        }
    }

    /// Parse a mode name, filling tun2socks options from `options`.
    pub fn parse(mode: &str, options: Tun2SocksOptions) -> Result<Self, ConfigError> {
        match mode {
            "tun2socks" => Ok(ConnectMode::Tun2Socks(options)),
            "sshuttle" => Ok(ConnectMode::Sshuttle),
            other => Err(ConfigError::InvalidConnectMode(other.to_string())),
        }
    }
}

impl fmt::Display for ConnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How cluster service names get resolved on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsMode {
    /// Service names of every namespace in the hosts file, refreshed.
    LocalDns,
    /// Resolve through the pod's DNS over the tunnel.
    PodDns,
    /// Write service names to the hosts file; empty means the session namespace.
    Hosts(Vec<String>),
}

impl FromStr for DnsMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "localDNS" => Ok(DnsMode::LocalDns),
            "podDNS" => Ok(DnsMode::PodDns),
            "hosts" => Ok(DnsMode::Hosts(Vec::new())),
            other => match other.strip_prefix("hosts:") {
                Some(list) => {
                    let namespaces: Vec<String> = list
                        .split(',')
                        .map(str::trim)
                        .filter(|ns| !ns.is_empty())
                        .map(str::to_string)
                        .collect();
                    if namespaces.is_empty() {
                        return Err(ConfigError::InvalidDnsMode(other.to_string()));
                    }
                    Ok(DnsMode::Hosts(namespaces))
                }
                None => Err(ConfigError::InvalidDnsMode(other.to_string())),
            },
        }
    }
}

impl fmt::Display for DnsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsMode::LocalDns => f.write_str("localDNS"),
            DnsMode::PodDns => f.write_str("podDNS"),
            DnsMode::Hosts(ns) if ns.is_empty() => f.write_str("hosts"),
            DnsMode::Hosts(ns) => write!(f, "hosts:{}", ns.join(",")),
        }
    }
}

/// Mesh backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMode {
    /// Provision a router in front of the service.
    Auto {
        /// Router image, including tag.
        router_image: String,
    },
    /// Patch existing istio VirtualService and DestinationRule.
    Manual {
        /// VirtualService name; the service name when unset.
        vs_name: Option<String>,
        /// DestinationRule name; the service name when unset.
        dr_name: Option<String>,
    },
}

impl MeshMode {
    /// Name as accepted on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            MeshMode::Auto { .. } => "auto",
            MeshMode::Manual { .. } => "manual",
        }
    }

    /// Parse a mode name.
    pub fn parse(
        mode: &str,
        router_image: String,
        vs_name: Option<String>,
        dr_name: Option<String>,
    ) -> Result<Self, ConfigError> {
        match mode {
            "auto" => Ok(MeshMode::Auto { router_image }),
            "manual" => Ok(MeshMode::Manual { vs_name, dr_name }),
            other => Err(ConfigError::InvalidMeshMode(other.to_string())),
        }
    }
}

impl fmt::Display for MeshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tunnel half of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Tunnel backend.
    pub mode: ConnectMode,
    /// DNS handling.
    pub dns_mode: DnsMode,
    /// Use the shared connect shadow.
    pub share_shadow: bool,
    /// Cluster DNS domain.
    pub cluster_domain: String,
    /// Do not route pod ranges.
    pub disable_pod_ip: bool,
    /// Extra ranges routed into the cluster.
    pub include_ips: Vec<String>,
    /// Ranges never routed into the cluster.
    pub exclude_ips: Vec<String>,
    /// Seconds between hosts file refreshes in localDNS mode.
    pub dns_cache_ttl: u64,
    /// Do not spawn the cleanup task.
    pub skip_cleanup: bool,
}

/// Mesh half of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Mesh backend.
    pub mode: MeshMode,
    /// Header key and value selecting local traffic.
    pub version_mark: VersionMark,
    /// Ports to deliver locally.
    pub expose: Vec<ExposeRule>,
}

/// Shadow workload settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowSettings {
    /// Image running sshd.
    pub image: String,
    /// SSH login user.
    pub user: String,
    /// Private key file.
    pub identity: PathBuf,
    /// How long to wait for rollouts and port-forwards.
    pub ready_timeout: Duration,
}

/// Local tunnel tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSettings {
    /// Tun device name.
    pub tun_device: String,
    /// tun2socks binary.
    pub tun2socks_binary: PathBuf,
    /// sshuttle binary.
    pub sshuttle_binary: PathBuf,
    /// sshuttle remote override.
    pub sshuttle_remote: Option<String>,
    /// Configured cluster ranges.
    pub cluster_cidrs: Vec<String>,
    /// Hosts file receiving service names.
    pub hosts_file: PathBuf,
}

/// Everything one invocation needs, resolved up front.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Resource to mesh, as given.
    pub resource: String,
    /// Namespace of the resource.
    pub namespace: String,
    /// kubectl invocation context.
    pub kubectl: Kubectl,
    /// Tunnel half.
    pub connect: ConnectConfig,
    /// Mesh half.
    pub mesh: MeshConfig,
    /// Shadow settings.
    pub shadow: ShadowSettings,
    /// Tunnel tooling.
    pub tunnel: TunnelSettings,
    /// Directory for PID files and keys.
    pub app_home: PathBuf,
    /// Bounded wait for cleanup on exit.
    pub cleanup_timeout: Duration,
}

impl SessionConfig {
    /// Merge CLI flags for `resource` over the loaded file config.
    pub fn build(resource: &str, cli: &Cli, config: &Config) -> Result<Self, ConfigError> {
        let tun2socks = Tun2SocksOptions {
            socks_port: cli.proxy_port,
            disable_tun_device: cli.disable_tun_device,
            disable_tun_route: cli.disable_tun_route,
        };
        let connect_mode = ConnectMode::parse(&cli.connect_mode, tun2socks)?;

        let router_image = cli.router_image.clone().unwrap_or_else(|| {
            let base = config.mesh.router_image.as_deref().unwrap_or(DEFAULT_ROUTER_IMAGE);
            default_router_image(base)
        });
        let mesh_mode = MeshMode::parse(
            &cli.mesh_mode,
            router_image,
            cli.vs_name.clone(),
            cli.dr_name.clone(),
        )?;

        let dns_mode: DnsMode = cli.dns_mode.parse()?;
        validate_dns(&dns_mode, &connect_mode, cli.dns_cache_ttl)?;
        let expose = parse_expose(&cli.expose)?;
        let version_mark = match cli.version_mark.as_deref() {
            Some(mark) => mark.parse().map_err(|e: MeshError| ConfigError::InvalidValue {
                field: "versionMark".to_string(),
                message: e.to_string(),
            })?,
            None => VersionMark::generate(),
        };

        if cli.proxy_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "proxyPort".to_string(),
                message: "port must be between 1 and 65535".to_string(),
            });
        }
        let include_ips = validate_ranges("includeIps", &cli.include_ips)?;
        let exclude_ips = validate_ranges("excludeIps", &cli.exclude_ips)?;
        let cluster_cidrs = validate_ranges("tunnel.cluster_cidrs", &config.tunnel.cluster_cidrs)?;

        let app_home = match &config.general.app_home {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDirectory)?
                .join(APP_HOME_DIR),
        };

        let namespace = cli
            .namespace
            .clone()
            .or_else(|| config.cluster.namespace.clone())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let kubectl = Kubectl::new(
            config
                .cluster
                .kubectl
                .clone()
                .unwrap_or_else(|| PathBuf::from("kubectl")),
        )
        .with_kubeconfig(cli.kubeconfig.clone().or_else(|| config.cluster.kubeconfig.clone()))
        .with_context(cli.context.clone().or_else(|| config.cluster.context.clone()));

        Ok(Self {
            resource: resource.to_string(),
            namespace,
            kubectl,
            connect: ConnectConfig {
                mode: connect_mode,
                dns_mode,
                share_shadow: cli.share_shadow,
                cluster_domain: cli.cluster_domain.clone(),
                disable_pod_ip: cli.disable_pod_ip,
                include_ips,
                exclude_ips,
                dns_cache_ttl: cli.dns_cache_ttl,
                skip_cleanup: cli.skip_cleanup,
            },
            mesh: MeshConfig {
                mode: mesh_mode,
                version_mark,
                expose,
            },
            shadow: ShadowSettings {
                image: config
                    .shadow
                    .image
                    .clone()
                    .unwrap_or_else(|| {
                        format!("{}:v{}", DEFAULT_SHADOW_IMAGE, env!("CARGO_PKG_VERSION"))
                    }),
                user: config.shadow.user.clone().unwrap_or_else(|| "root".to_string()),
                identity: config
                    .shadow
                    .identity
                    .clone()
                    .unwrap_or_else(|| app_home.join("id_ed25519")),
                ready_timeout: Duration::from_secs(
                    config
                        .shadow
                        .ready_timeout_secs
                        .unwrap_or(DEFAULT_READY_TIMEOUT_SECS),
                ),
            },
            tunnel: TunnelSettings {
                tun_device: config
                    .tunnel
                    .tun_device
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TUN_DEVICE.to_string()),
                tun2socks_binary: config
                    .tunnel
                    .tun2socks_binary
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("tun2socks")),
                sshuttle_binary: config
                    .tunnel
                    .sshuttle_binary
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("sshuttle")),
                sshuttle_remote: config.tunnel.sshuttle_remote.clone(),
                cluster_cidrs,
                hosts_file: config
                    .tunnel
                    .hosts_file
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_HOSTS_FILE)),
            },
            cleanup_timeout: Duration::from_secs(
                config
                    .general
                    .cleanup_timeout_secs
                    .unwrap_or(DEFAULT_CLEANUP_TIMEOUT_SECS),
            ),
            app_home,
        })
    }
}

/// `<base>:v<crate version>`
pub fn default_router_image(base: &str) -> String {
    format!("{}:v{}", base, env!("CARGO_PKG_VERSION"))
}

/// podDNS needs sshuttle's DNS forwarding; localDNS needs a refresh interval.
fn validate_dns(dns: &DnsMode, connect: &ConnectMode, ttl: u64) -> Result<(), ConfigError> {
    let message = match (dns, connect) {
        (DnsMode::PodDns, ConnectMode::Tun2Socks(_)) => {
            "podDNS is only supported with --connectMode sshuttle"
        }
        (DnsMode::LocalDns, _) if ttl == 0 => "dnsCacheTtl must be at least 1 second",
        _ => return Ok(()),
    };
    Err(ConfigError::InvalidValue {
        field: "dnsMode".to_string(),
        message: message.to_string(),
    })
}

/// Accept `a.b.c.d`, `a.b.c.d/n` and the IPv6 equivalents.
fn validate_ranges(field: &str, ranges: &[String]) -> Result<Vec<String>, ConfigError> {
    ranges
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .map(|range| match parse_range(range) {
            Some(_) => Ok(range.to_string()),
            None => Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!("'{}' is not an IP address or CIDR range", range),
            }),
        })
        .collect()
}
