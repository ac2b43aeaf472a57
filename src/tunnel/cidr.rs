//! Working out which address ranges belong to the cluster.
//!
//! Ranges come from three places: the configured cluster CIDRs, the ranges
//! discovered from the cluster itself (service IPs, and pod CIDRs unless pod
//! access is disabled) and `--includeIps`. `--excludeIps` is then carved out
//! of the result, splitting IPv4 ranges where an exclusion falls inside one.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::Kubectl;

/// Parse `a.b.c.d/n`, a bare address (as a host route) or the IPv6
/// equivalents. Host bits are cleared.
pub fn parse_range(range: &str) -> Option<IpNet> {
    let net = match range.parse::<IpNet>() {
        Ok(net) => net,
        Err(_) => match range.parse::<IpAddr>().ok()? {
            IpAddr::V4(addr) => IpNet::V4(Ipv4Net::new(addr, 32).ok()?),
            IpAddr::V6(addr) => IpNet::V6(Ipv6Net::new(addr, 128).ok()?),
        },
    };
    Some(net.trunc())
}

/// The parts of `net` not covered by `excluded`.
pub fn subtract(net: Ipv4Net, excluded: &Ipv4Net) -> Vec<Ipv4Net> {
    if excluded.contains(&net) {
        return Vec::new();
    }
    // CIDR blocks are either nested or disjoint
    if !net.contains(excluded) {
        return vec![net];
    }
    match net.subnets(net.prefix_len() + 1) {
        Ok(halves) => halves.flat_map(|half| subtract(half, excluded)).collect(),
        Err(_) => vec![net],
    }
}

/// Candidate ranges minus exclusions.
///
/// IPv4 ranges are split around exclusions; IPv6 ranges are only dropped
/// when an exclusion covers them entirely. The result is sorted, and ranges
/// covered by (or adjacent to) another entry are merged into it.
pub fn route_ranges(candidates: &[String], excludes: &[String]) -> Vec<String> {
    let mut excluded_v4 = Vec::new();
    let mut excluded_v6 = Vec::new();
    for exclude in excludes {
        match parse_range(exclude) {
            Some(IpNet::V4(net)) => excluded_v4.push(net),
            Some(IpNet::V6(net)) => excluded_v6.push(net),
            None => warn!("Ignoring invalid excluded range '{}'", exclude),
        }
    }

    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for candidate in candidates {
        match parse_range(candidate) {
            Some(IpNet::V4(net)) => {
                let mut parts = vec![net];
                for excluded in &excluded_v4 {
                    parts = parts.into_iter().flat_map(|p| subtract(p, excluded)).collect();
                }
                v4.extend(parts);
            }
            Some(IpNet::V6(net)) => {
                if !excluded_v6.iter().any(|e| e.contains(&net)) {
                    v6.push(net);
                }
            }
            None => warn!("Ignoring invalid range '{}'", candidate),
        }
    }

    let mut v4 = Ipv4Net::aggregate(&v4);
    v4.sort();
    let mut v6 = Ipv6Net::aggregate(&v6);
    v6.sort();
    v4.iter()
        .map(Ipv4Net::to_string)
        .chain(v6.iter().map(Ipv6Net::to_string))
        .collect()
}

/// Widen addresses to the /16 networks containing them.
pub fn collapse_to_16(addrs: impl IntoIterator<Item = Ipv4Addr>) -> BTreeSet<Ipv4Net> {
    addrs
        .into_iter()
        .filter(|a| !a.is_unspecified() && !a.is_loopback())
        .filter_map(|a| Ipv4Net::new(a, 16).ok())
        .map(|net| net.trunc())
        .collect()
}

/// Service cluster IPs from a service list.
pub fn service_ips(services: &[Value]) -> Vec<Ipv4Addr> {
    services
        .iter()
        .filter_map(|svc| svc.pointer("/spec/clusterIP")?.as_str()?.parse().ok())
        .collect()
}

/// Pod CIDRs declared on nodes.
pub fn node_pod_cidrs(nodes: &[Value]) -> Vec<String> {
    nodes
        .iter()
        .flat_map(|node| {
            let spec = node.get("spec");
            let many = spec
                .and_then(|s| s.get("podCIDRs"))
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|c| c.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if many.is_empty() {
                spec.and_then(|s| s.get("podCIDR"))
                    .and_then(Value::as_str)
                    .map(|c| vec![c.to_string()])
                    .unwrap_or_default()
            } else {
                many
            }
        })
        .collect()
}

/// Every range that should be routed into the cluster.
///
/// Discovery failures are logged; configured and included ranges are always
/// used.
pub fn cluster_ranges(
    kubectl: &Kubectl,
    configured: &[String],
    disable_pod_ip: bool,
    include: &[String],
    exclude: &[String],
) -> Vec<String> {
    let mut candidates: Vec<String> = configured.to_vec();

    match kubectl.list_json("services", None, None) {
        Ok(services) => {
            let ranges = collapse_to_16(service_ips(&services));
            candidates.extend(ranges.iter().map(Ipv4Net::to_string));
        }
        Err(e) => warn!("Could not discover service ranges: {}", e),
    }

    if !disable_pod_ip {
        match kubectl.list_json("nodes", None, None) {
            Ok(nodes) => candidates.extend(node_pod_cidrs(&nodes)),
            Err(e) => warn!("Could not discover pod ranges: {}", e),
        }
    }

    candidates.extend(include.iter().cloned());
    let ranges = route_ranges(&candidates, exclude);
    debug!("Cluster ranges: {:?}", ranges);
    ranges
}
