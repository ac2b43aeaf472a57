//! Routing cluster ranges through the tun device.
//!
//! ```text
//!   application ──► kernel route 10.96.0.0/12 dev kt0
//!                        │
//!                        ▼
//!                   tun2socks ──► ssh -D 127.0.0.1:2223 ──► shadow ──► cluster
//! ```
//!
//! # Requirements
//!
//! - `CAP_NET_ADMIN` capability or root access
//! - `ip` command available in PATH

use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::debug;

use super::error::{TunnelError, TunnelResult};

/// Add `cidr` as a route through `device`.
pub fn add_route(cidr: &str, device: &str) -> TunnelResult<()> {
    run_ip(&["route", "add", cidr, "dev", device])
}

/// Remove a route added by [`add_route`].
///
/// A route that is already gone (the device was removed with it) is not an
/// error.
pub fn delete_route(cidr: &str, device: &str) -> TunnelResult<()> {
    if !device_exists(device) {
        debug!("Device {} is gone, route {} went with it", device, cidr);
        return Ok(());
    }
    match run_ip(&["route", "del", cidr, "dev", device]) {
        Err(TunnelError::CommandError { stderr, .. }) if stderr.contains("No such process") => {
            Ok(())
        }
        other => other,
    }
}

/// Bring a link up.
pub fn link_up(device: &str) -> TunnelResult<()> {
    run_ip(&["link", "set", "dev", device, "up"])
}

/// Check if a network device exists.
pub fn device_exists(device: &str) -> bool {
    Path::new("/sys/class/net").join(device).exists()
}

/// Poll until `device` appears.
pub fn wait_for_device(device: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if device_exists(device) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Run an `ip` command.
fn run_ip(args: &[&str]) -> TunnelResult<()> {
    let cmd_str = format!("ip {}", args.join(" "));
    debug!("Running: {}", cmd_str);

    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| TunnelError::CommandFailed {
            cmd: cmd_str.clone(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(TunnelError::CommandError { cmd: cmd_str, stderr });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_device_exists() {
        assert!(device_exists("lo"));
        assert!(!device_exists("kt-definitely-missing"));
    }

    #[test]
    fn test_wait_for_missing_device_times_out() {
        let start = Instant::now();
        assert!(!wait_for_device("kt-definitely-missing", Duration::from_millis(250)));
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_delete_route_on_missing_device_is_ok() {
        assert!(delete_route("10.96.0.0/12", "kt-definitely-missing").is_ok());
    }
}
