//! Command-line interface definitions for kt-meshdebug.
//!
//! Uses clap's derive API. Long flags keep the camelCase spelling users know
//! from the `connect` and `mesh` commands (`--connectMode`, `--vsName`, ...).

use clap::Parser;
use std::path::PathBuf;

/// Connect to a cluster and mesh a service in one command.
///
/// kt-meshdebug opens a network tunnel into the cluster, then redirects the
/// share of a service's traffic that carries a version mark header to
/// processes running on this machine. Everything it created is removed
/// again when it receives SIGINT or SIGTERM.
#[derive(Parser, Debug, Clone)]
#[command(name = "kt-meshdebug")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Service to mesh (`name`, `svc/name` or `deployment/name`).
    pub resource: Option<String>,

    /// Namespace of the service.
    #[arg(short = 'n', long = "namespace", value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Kubeconfig file to use.
    #[arg(long = "kubeconfig", value_name = "PATH")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use.
    #[arg(long = "context", value_name = "NAME")]
    pub context: Option<String>,

    /// Path to additional config file.
    ///
    /// Merged on top of system and user configs; CLI flags still win.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Connect mode 'tun2socks' or 'sshuttle'.
    #[arg(long = "connectMode", value_name = "MODE", default_value = "tun2socks")]
    pub connect_mode: String,

    /// How to resolve service domains: 'localDNS', 'podDNS' (sshuttle only),
    /// 'hosts' or 'hosts:<namespaces>' (',' separated).
    #[arg(long = "dnsMode", value_name = "MODE", default_value = "localDNS")]
    pub dns_mode: String,

    /// Use the shared shadow pod.
    #[arg(long = "shareShadow")]
    pub share_shadow: bool,

    /// Cluster domain known to the kubernetes api-server.
    #[arg(long = "clusterDomain", value_name = "DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,

    /// Disable access to pod IP addresses.
    #[arg(long = "disablePodIp")]
    pub disable_pod_ip: bool,

    /// Do not clean up residual resources in the cluster.
    #[arg(long = "skipCleanup")]
    pub skip_cleanup: bool,

    /// Extra IP ranges to route to the cluster, ',' separated.
    #[arg(long = "includeIps", value_name = "CIDRS", value_delimiter = ',')]
    pub include_ips: Vec<String>,

    /// IP ranges never routed to the cluster, ',' separated.
    #[arg(long = "excludeIps", value_name = "CIDRS", value_delimiter = ',')]
    pub exclude_ips: Vec<String>,

    /// (tun2socks only) Create the socks5 proxy without a tun device.
    #[arg(long = "disableTunDevice")]
    pub disable_tun_device: bool,

    /// (tun2socks only) Do not set up routes through the tun device.
    #[arg(long = "disableTunRoute")]
    pub disable_tun_route: bool,

    /// (tun2socks only) Local port of the socks5 proxy.
    #[arg(long = "proxyPort", value_name = "PORT", default_value_t = 2223)]
    pub proxy_port: u16,

    /// (localDNS only) Seconds between service name refreshes.
    #[arg(long = "dnsCacheTtl", value_name = "SECONDS", default_value_t = 60)]
    pub dns_cache_ttl: u64,

    /// Ports to expose, ',' separated, as 'port' or 'local:remote'
    /// (e.g. 7001,8080:80).
    #[arg(long = "expose", value_name = "PORTS", required = true)]
    pub expose: String,

    /// Mesh method 'auto' or 'manual'.
    #[arg(long = "meshMode", value_name = "MODE", default_value = "auto")]
    pub mesh_mode: String,

    /// Version of the mesh service, e.g. '0.0.1' or 'mark:local'.
    #[arg(long = "versionMark", value_name = "MARK")]
    pub version_mark: Option<String>,

    /// (auto only) Router image.
    #[arg(long = "routerImage", value_name = "IMAGE")]
    pub router_image: Option<String>,

    /// (manual only) Istio VirtualService name.
    #[arg(long = "vsName", value_name = "NAME")]
    pub vs_name: Option<String>,

    /// (manual only) Istio DestinationRule name.
    #[arg(long = "drName", value_name = "NAME")]
    pub dr_name: Option<String>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["kt-meshdebug", "tomcat", "--expose", "7001"]);
        assert_eq!(cli.resource.as_deref(), Some("tomcat"));
        assert_eq!(cli.expose, "7001");
        assert_eq!(cli.connect_mode, "tun2socks");
        assert_eq!(cli.dns_mode, "localDNS");
        assert_eq!(cli.mesh_mode, "auto");
        assert_eq!(cli.cluster_domain, "cluster.local");
        assert_eq!(cli.proxy_port, 2223);
        assert_eq!(cli.dns_cache_ttl, 60);
        assert!(!cli.skip_cleanup);
        assert!(cli.namespace.is_none());
        assert!(cli.router_image.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_camel_case_flags() {
        let cli = Cli::parse_from([
            "kt-meshdebug",
            "deployment/tomcat",
            "-n",
            "dev",
            "--expose",
            "8080:80",
            "--connectMode",
            "sshuttle",
            "--meshMode",
            "manual",
            "--vsName",
            "tomcat-vs",
            "--drName",
            "tomcat-dr",
            "--versionMark",
            "mark:local",
            "--includeIps",
            "172.2.0.0/16,10.0.0.0/8",
            "--excludeIps",
            "192.168.64.2",
            "--skipCleanup",
            "--disablePodIp",
            "-vv",
        ]);

        assert_eq!(cli.namespace.as_deref(), Some("dev"));
        assert_eq!(cli.connect_mode, "sshuttle");
        assert_eq!(cli.mesh_mode, "manual");
        assert_eq!(cli.vs_name.as_deref(), Some("tomcat-vs"));
        assert_eq!(cli.dr_name.as_deref(), Some("tomcat-dr"));
        assert_eq!(cli.version_mark.as_deref(), Some("mark:local"));
        assert_eq!(cli.include_ips, vec!["172.2.0.0/16", "10.0.0.0/8"]);
        assert_eq!(cli.exclude_ips, vec!["192.168.64.2"]);
        assert!(cli.skip_cleanup);
        assert!(cli.disable_pod_ip);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_expose_is_required() {
        assert!(Cli::try_parse_from(["kt-meshdebug", "tomcat"]).is_err());
    }

    #[test]
    fn test_resource_is_optional_at_parse_time() {
        let cli = Cli::parse_from(["kt-meshdebug", "--expose", "7001"]);
        assert!(cli.resource.is_none());
    }
}
