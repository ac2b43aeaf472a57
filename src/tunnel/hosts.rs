//! Cluster service names in the local hosts file.
//!
//! Entries live in a block fenced by marker comments that carry the session
//! PID. A session only ever rewrites or removes its own block, and a block
//! left by a session that died is found again by the startup sweep.
//!
//! `hosts` and `hosts:<namespaces>` write the names once. `localDNS` covers
//! every namespace and rewrites the block every `--dnsCacheTtl` seconds, so
//! services created during the session become resolvable too. `podDNS` is
//! left to sshuttle's DNS forwarding.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use super::error::{TunnelError, TunnelResult};
use super::{EstablishedTunnel, TunnelContext};
use crate::cleanup::UndoStep;
use crate::cluster::Kubectl;
use crate::config::DnsMode;
use crate::process::process_exists;

const MARKER_BEGIN: &str = "# kt-meshdebug begin";
const MARKER_END: &str = "# kt-meshdebug end";

/// One hosts file line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    /// Service cluster IP.
    pub ip: String,
    /// Names resolving to it.
    pub names: Vec<String>,
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ip, self.names.join(" "))
    }
}

/// What a DNS mode asks of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsPlan {
    /// Write service names to the hosts file.
    Hosts {
        /// Namespaces to cover; every namespace when `None`.
        namespaces: Option<Vec<String>>,
        /// Rewrite interval; written once when `None`.
        refresh: Option<Duration>,
    },
    /// Names resolve through cluster DNS over the tunnel.
    Tunnel,
}

/// Map a DNS mode to what the tunnel does about it.
pub fn dns_plan(mode: &DnsMode, namespace: &str, ttl_secs: u64) -> DnsPlan {
    match mode {
        DnsMode::LocalDns => DnsPlan::Hosts {
            namespaces: None,
            refresh: Some(Duration::from_secs(ttl_secs)),
        },
        DnsMode::Hosts(list) if list.is_empty() => DnsPlan::Hosts {
            namespaces: Some(vec![namespace.to_string()]),
            refresh: None,
        },
        DnsMode::Hosts(list) => DnsPlan::Hosts {
            namespaces: Some(list.clone()),
            refresh: None,
        },
        DnsMode::PodDns => DnsPlan::Tunnel,
    }
}

/// Hosts entries for services with a cluster IP.
///
/// Every service gets `<svc>.<ns>.svc.<domain>` and `<svc>.<ns>`; services
/// in the session namespace also get the bare `<svc>`.
pub fn service_entries(services: &[Value], domain: &str, namespace: &str) -> Vec<HostEntry> {
    services
        .iter()
        .filter_map(|svc| {
            let name = svc.pointer("/metadata/name")?.as_str()?;
            let ns = svc.pointer("/metadata/namespace")?.as_str()?;
            let ip = svc.pointer("/spec/clusterIP")?.as_str()?;
            if ip.is_empty() || ip == "None" {
                return None;
            }
            let mut names = vec![
                format!("{}.{}.svc.{}", name, ns, domain),
                format!("{}.{}", name, ns),
            ];
            if ns == namespace {
                names.push(name.to_string());
            }
            Some(HostEntry {
                ip: ip.to_string(),
                names,
            })
        })
        .collect()
}

/// `content` without the block owned by `pid`.
pub fn strip_block(content: &str, pid: u32) -> String {
    let begin = format!("{} {}", MARKER_BEGIN, pid);
    let end = format!("{} {}", MARKER_END, pid);
    let mut inside = false;
    let mut kept = String::with_capacity(content.len());
    for line in content.lines() {
        if line == begin {
            inside = true;
        } else if inside {
            inside = line != end;
        } else {
            kept.push_str(line);
            kept.push('\n');
        }
    }
    kept
}

/// `content` with the block owned by `pid` replaced by `entries`.
///
/// No entries means no block.
pub fn with_block(content: &str, pid: u32, entries: &[HostEntry]) -> String {
    let mut updated = strip_block(content, pid);
    if entries.is_empty() {
        return updated;
    }
    updated.push_str(&format!("{} {}\n", MARKER_BEGIN, pid));
    for entry in entries {
        updated.push_str(&format!("{}\n", entry));
    }
    updated.push_str(&format!("{} {}\n", MARKER_END, pid));
    updated
}

/// PIDs owning a block in `content`.
pub fn block_owners(content: &str) -> Vec<u32> {
    content
        .lines()
        .filter_map(|line| line.strip_prefix(MARKER_BEGIN)?.trim().parse().ok())
        .collect()
}

fn read_hosts(path: &Path) -> io::Result<String> {
    match fs::read_to_string(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        other => other,
    }
}

/// Write `entries` as the block owned by `pid`.
pub fn write_entries(path: &Path, pid: u32, entries: &[HostEntry]) -> io::Result<()> {
    let content = read_hosts(path)?;
    fs::write(path, with_block(&content, pid, entries))
}

/// Remove the block owned by `pid`. Returns whether there was one.
pub fn remove_entries(path: &Path, pid: u32) -> io::Result<bool> {
    let content = read_hosts(path)?;
    if !block_owners(&content).contains(&pid) {
        return Ok(false);
    }
    fs::write(path, strip_block(&content, pid))?;
    Ok(true)
}

/// Remove blocks whose session no longer runs. Returns how many went.
pub fn remove_stale_blocks(path: &Path) -> io::Result<usize> {
    let mut content = read_hosts(path)?;
    let stale: Vec<u32> = block_owners(&content)
        .into_iter()
        .filter(|pid| !process_exists(*pid))
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }
    for pid in &stale {
        content = strip_block(&content, *pid);
    }
    fs::write(path, content)?;
    Ok(stale.len())
}

/// Writes this session's service names.
#[derive(Debug, Clone)]
pub struct HostsWriter {
    kubectl: Kubectl,
    path: PathBuf,
    domain: String,
    namespace: String,
    namespaces: Option<Vec<String>>,
    pid: u32,
}

impl HostsWriter {
    /// List the services and rewrite the block. Returns the entry count.
    pub fn update(&self) -> TunnelResult<usize> {
        let services = match &self.namespaces {
            None => self.kubectl.list_json("services", None, None)?,
            Some(namespaces) => {
                let mut all = Vec::new();
                for ns in namespaces {
                    all.extend(self.kubectl.list_json("services", Some(ns), None)?);
                }
                all
            }
        };
        let entries = service_entries(&services, &self.domain, &self.namespace);
        write_entries(&self.path, self.pid, &entries).map_err(|source| TunnelError::Hosts {
            path: self.path.clone(),
            source,
        })?;
        Ok(entries.len())
    }
}

/// Periodic rewrite of the service names.
#[derive(Debug, Clone)]
pub struct HostsRefresh {
    /// What gets rewritten.
    pub writer: HostsWriter,
    /// Time between rewrites.
    pub interval: Duration,
}

/// Apply the session's DNS mode on top of an established tunnel.
pub fn apply(ctx: &TunnelContext<'_>, tunnel: &mut EstablishedTunnel) -> TunnelResult<()> {
    let connect = ctx.connect;
    let DnsPlan::Hosts {
        namespaces,
        refresh,
    } = dns_plan(&connect.dns_mode, ctx.namespace, connect.dns_cache_ttl)
    else {
        debug!("Cluster DNS answers through the tunnel");
        return Ok(());
    };
    if tunnel.ranges.is_empty() {
        info!("Nothing routed into the cluster, hosts file left alone");
        return Ok(());
    }

    let writer = HostsWriter {
        kubectl: ctx.kubectl.clone(),
        path: ctx.settings.hosts_file.clone(),
        domain: connect.cluster_domain.clone(),
        namespace: ctx.namespace.to_string(),
        namespaces,
        pid: std::process::id(),
    };
    ctx.ledger.record(UndoStep::RemoveHostsEntries {
        path: writer.path.clone(),
        pid: writer.pid,
    });
    let count = writer.update()?;
    info!("Wrote {} service name(s) to {:?}", count, writer.path);

    tunnel.dns_refresh = refresh.map(|interval| HostsRefresh { writer, interval });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn services() -> Vec<Value> {
        vec![
            json!({
                "metadata": {"name": "tomcat", "namespace": "dev"},
                "spec": {"clusterIP": "10.96.0.20"}
            }),
            json!({
                "metadata": {"name": "redis", "namespace": "cache"},
                "spec": {"clusterIP": "10.96.3.4"}
            }),
            json!({
                "metadata": {"name": "headless", "namespace": "dev"},
                "spec": {"clusterIP": "None"}
            }),
        ]
    }

    #[test]
    fn test_each_dns_mode_has_its_own_plan() {
        assert_eq!(
            dns_plan(&DnsMode::LocalDns, "dev", 60),
            DnsPlan::Hosts {
                namespaces: None,
                refresh: Some(Duration::from_secs(60))
            }
        );
        assert_eq!(
            dns_plan(&DnsMode::Hosts(vec![]), "dev", 60),
            DnsPlan::Hosts {
                namespaces: Some(vec!["dev".to_string()]),
                refresh: None
            }
        );
        assert_eq!(
            dns_plan(&DnsMode::Hosts(vec!["qa".to_string(), "cache".to_string()]), "dev", 60),
            DnsPlan::Hosts {
                namespaces: Some(vec!["qa".to_string(), "cache".to_string()]),
                refresh: None
            }
        );
        assert_eq!(dns_plan(&DnsMode::PodDns, "dev", 60), DnsPlan::Tunnel);
    }

    #[test]
    fn test_service_entries_use_cluster_domain() {
        let entries = service_entries(&services(), "corp.internal", "dev");
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].to_string(),
            "10.96.0.20 tomcat.dev.svc.corp.internal tomcat.dev tomcat"
        );
        assert_eq!(entries[1].to_string(), "10.96.3.4 redis.cache.svc.corp.internal redis.cache");
    }

    #[test]
    fn test_block_replaced_in_place() {
        let entries = service_entries(&services(), "cluster.local", "dev");
        let original = "127.0.0.1 localhost\n::1 localhost\n";

        let first = with_block(original, 42, &entries);
        assert!(first.starts_with(original));
        assert!(first.contains("# kt-meshdebug begin 42\n10.96.0.20 "));
        assert_eq!(block_owners(&first), vec![42]);

        let second = with_block(&first, 42, &entries[..1]);
        assert_eq!(second.matches("# kt-meshdebug begin").count(), 1);
        assert!(!second.contains("redis"));

        assert_eq!(strip_block(&second, 42), original);
        assert_eq!(strip_block(&second, 7), second);
    }

    #[test]
    fn test_write_and_remove_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        let entries = service_entries(&services(), "cluster.local", "dev");

        write_entries(&path, 42, &entries).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("10.96.0.20 tomcat.dev.svc.cluster.local tomcat.dev tomcat"));

        assert!(remove_entries(&path, 42).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "127.0.0.1 localhost\n");
        assert!(!remove_entries(&path, 42).unwrap());
    }

    #[test]
    fn test_remove_stale_blocks_keeps_live_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let entries = service_entries(&services(), "cluster.local", "dev");
        let live = std::process::id();
        let dead = u32::MAX;

        let content = with_block("127.0.0.1 localhost\n", live, &entries);
        fs::write(&path, with_block(&content, dead, &entries)).unwrap();

        assert_eq!(remove_stale_blocks(&path).unwrap(), 1);
        assert_eq!(block_owners(&fs::read_to_string(&path).unwrap()), vec![live]);
        assert_eq!(remove_stale_blocks(&path).unwrap(), 0);
    }
}
