//! tun2socks backend.
//!
//! 1. `ssh -D` to the connect shadow provides a socks5 proxy on
//!    `127.0.0.1:<proxyPort>`.
//! 2. `tun2socks` turns a tun device into a client of that proxy.
//! 3. Cluster ranges are routed through the tun device.
//!
//! `--disableTunDevice` stops after step 1, `--disableTunRoute` after step 2.

use std::time::Duration;

use tracing::info;

use super::cidr::cluster_ranges;
use super::connect::{ensure_alive, open_connect_shadow, spawn_helper};
use super::error::{TunnelError, TunnelResult};
use super::route::{add_route, link_up, wait_for_device};
use super::{EstablishedTunnel, TunnelContext};
use crate::cleanup::UndoStep;
use crate::cluster::shadow::wait_for_local_port;
use crate::cluster::SshEndpoint;
use crate::config::Tun2SocksOptions;
use crate::process::CommandLine;

const DEVICE_TIMEOUT: Duration = Duration::from_secs(10);
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// `ssh -N -D 127.0.0.1:<port> ...`
pub fn socks_proxy_command(endpoint: &SshEndpoint, socks_port: u16) -> CommandLine {
    endpoint
        .ssh_command()
        .arg("-N")
        .arg("-D")
        .arg(format!("127.0.0.1:{}", socks_port))
        .arg(endpoint.destination())
}

/// `tun2socks -device tun://<dev> -proxy socks5://127.0.0.1:<port>`
pub fn tun2socks_command(binary: &std::path::Path, device: &str, socks_port: u16) -> CommandLine {
    CommandLine::new(binary)
        .arg("-device")
        .arg(format!("tun://{}", device))
        .arg("-proxy")
        .arg(format!("socks5://127.0.0.1:{}", socks_port))
        .args(["-loglevel", "warning"])
}

/// Bring the tunnel up in tun2socks mode.
pub fn establish(
    options: &Tun2SocksOptions,
    ctx: &TunnelContext<'_>,
) -> TunnelResult<EstablishedTunnel> {
    let (forward, endpoint) = open_connect_shadow(ctx)?;
    let mut tunnel = EstablishedTunnel {
        processes: vec![forward],
        ..Default::default()
    };

    let proxy = spawn_helper("socks-proxy", &socks_proxy_command(&endpoint, options.socks_port))?;
    tunnel.processes.push(proxy);
    if !wait_for_local_port(options.socks_port, ctx.shadow.ready_timeout) {
        return Err(TunnelError::NotReady {
            component: "socks-proxy".to_string(),
            message: format!("nothing listening on 127.0.0.1:{}", options.socks_port),
        });
    }

    if options.disable_tun_device {
        info!(
            "Started socks5 proxy at socks5://127.0.0.1:{}, tun device disabled",
            options.socks_port
        );
        return Ok(tunnel);
    }

    let device = ctx.settings.tun_device.as_str();
    let mut tun = spawn_helper(
        "tun2socks",
        &tun2socks_command(&ctx.settings.tun2socks_binary, device, options.socks_port),
    )?;
    ensure_alive(&mut tun, STARTUP_GRACE)?;
    tunnel.processes.push(tun);

    if !wait_for_device(device, DEVICE_TIMEOUT) {
        return Err(TunnelError::NotReady {
            component: "tun2socks".to_string(),
            message: format!("device {} did not appear", device),
        });
    }
    link_up(device)?;

    if options.disable_tun_route {
        info!("Tun device {} is up, routes disabled", device);
        return Ok(tunnel);
    }

    let ranges = cluster_ranges(
        ctx.kubectl,
        &ctx.settings.cluster_cidrs,
        ctx.connect.disable_pod_ip,
        &ctx.connect.include_ips,
        &ctx.connect.exclude_ips,
    );
    if ranges.is_empty() {
        return Err(TunnelError::NoRanges);
    }
    for range in &ranges {
        add_route(range, device)?;
        ctx.ledger.record(UndoStep::DeleteRoute {
            cidr: range.clone(),
            device: device.to_string(),
        });
    }
    info!("Routed {} range(s) through {}", ranges.len(), device);
    tunnel.ranges = ranges;

    Ok(tunnel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn endpoint() -> SshEndpoint {
        SshEndpoint {
            user: "root".to_string(),
            port: 40022,
            identity: Some(PathBuf::from("/home/dev/.kt-meshdebug/id_ed25519")),
        }
    }

    #[test]
    fn test_socks_proxy_command() {
        let line = socks_proxy_command(&endpoint(), 2223).to_command_line();
        assert!(line.starts_with("ssh "));
        assert!(line.contains("-p 40022"));
        assert!(line.ends_with("-N -D 127.0.0.1:2223 root@127.0.0.1"));
    }

    #[test]
    fn test_tun2socks_command() {
        assert_eq!(
            tun2socks_command(Path::new("tun2socks"), "kt0", 2223).to_command_line(),
            "tun2socks -device tun://kt0 -proxy socks5://127.0.0.1:2223 -loglevel warning"
        );
    }
}
