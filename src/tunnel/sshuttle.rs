//! sshuttle backend.

use std::time::Duration;

use tracing::info;

use super::cidr::cluster_ranges;
use super::connect::{ensure_alive, open_connect_shadow, spawn_helper};
use super::error::{TunnelError, TunnelResult};
use super::{EstablishedTunnel, TunnelContext};
use crate::config::DnsMode;
use crate::process::CommandLine;

const STARTUP_GRACE: Duration = Duration::from_secs(2);

/// Build the sshuttle command line.
///
/// Exclusions are passed with `-x` and left to sshuttle; `--dns` is added
/// in podDNS mode.
pub fn sshuttle_command(
    binary: &std::path::Path,
    remote: &str,
    ssh_cmd: Option<&CommandLine>,
    ranges: &[String],
    excludes: &[String],
    dns_mode: &DnsMode,
) -> CommandLine {
    let mut cmd = CommandLine::new(binary)
        .arg("-r")
        .arg(remote)
        .opt("--ssh-cmd", ssh_cmd.map(CommandLine::to_command_line))
        .args(ranges.iter());
    for exclude in excludes {
        cmd = cmd.arg("-x").arg(exclude);
    }
    if *dns_mode == DnsMode::PodDns {
        cmd = cmd.arg("--dns");
    }
    cmd
}

/// Bring the tunnel up in sshuttle mode.
pub fn establish(ctx: &TunnelContext<'_>) -> TunnelResult<EstablishedTunnel> {
    let mut processes = Vec::new();
    let (remote, ssh_cmd) = match &ctx.settings.sshuttle_remote {
        Some(remote) => (remote.clone(), None),
        None => {
            let (forward, endpoint) = open_connect_shadow(ctx)?;
            processes.push(forward);
            (
                format!("{}:{}", endpoint.destination(), endpoint.port),
                Some(endpoint.ssh_options()),
            )
        }
    };

    let ranges = cluster_ranges(
        ctx.kubectl,
        &ctx.settings.cluster_cidrs,
        ctx.connect.disable_pod_ip,
        &ctx.connect.include_ips,
        &[],
    );
    if ranges.is_empty() {
        return Err(TunnelError::NoRanges);
    }

    let cmd = sshuttle_command(
        &ctx.settings.sshuttle_binary,
        &remote,
        ssh_cmd.as_ref(),
        &ranges,
        &ctx.connect.exclude_ips,
        &ctx.connect.dns_mode,
    );
    let mut sshuttle = spawn_helper("sshuttle", &cmd)?;
    ensure_alive(&mut sshuttle, STARTUP_GRACE)?;
    processes.push(sshuttle);

    info!("sshuttle routing {} range(s) via {}", ranges.len(), remote);
    Ok(EstablishedTunnel {
        processes,
        ranges,
        dns_refresh: None,
    })
}
