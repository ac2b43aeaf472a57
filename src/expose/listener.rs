//! Local listener checks.
//!
//! The validator needs to know whether the developer's application is
//! actually listening on each local port before any cluster resource is
//! created. On Linux the answer comes from the kernel socket tables in
//! `/proc/net/tcp` and `/proc/net/tcp6`, which does not require opening a
//! connection to the application. Both tables must be read: many dev servers
//! (Node.js, Vite, Python's http.server) bind to `::` only.
//!
//! When procfs is not available the check falls back to a loopback TCP
//! connect.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace};

use super::error::{ExposeError, ExposeResult};

/// TCP state code for LISTEN in procfs socket tables.
const TCP_LISTEN: u8 = 0x0A;

/// Answers whether something is listening on a local TCP port.
pub trait ListenerCheck: Send + Sync {
    /// Return true if a local process is bound and listening on `port`.
    fn is_listening(&self, port: u16) -> bool;
}

/// A listening socket read from a procfs table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningSocket {
    /// Bound address (0.0.0.0, 127.0.0.1, ::, ...).
    pub local_addr: IpAddr,
    /// Bound port.
    pub port: u16,
}

/// Listener check backed by the kernel socket tables.
#[derive(Debug, Clone)]
pub struct ProcNetListeners {
    proc_root: PathBuf,
}

impl ProcNetListeners {
    /// Read the host's `/proc`.
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read an alternative procfs root (for testing).
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Whether the socket tables exist under this root.
    pub fn available(&self) -> bool {
        self.proc_root.join("net/tcp").exists() || self.proc_root.join("net/tcp6").exists()
    }

    /// Collect every port in LISTEN state across the IPv4 and IPv6 tables.
    pub fn listening_ports(&self) -> ExposeResult<BTreeSet<u16>> {
        let mut ports = BTreeSet::new();
        let mut read_any = false;

        for (file, is_ipv6) in [("net/tcp", false), ("net/tcp6", true)] {
            let path = self.proc_root.join(file);
            match read_table(&path) {
                Some(content) => {
                    read_any = true;
                    ports.extend(
                        parse_socket_table(&content, is_ipv6)?
                            .into_iter()
                            .map(|s| s.port),
                    );
                }
                None => trace!("Socket table {:?} not readable", path),
            }
        }

        if !read_any {
            return Err(ExposeError::ScanFailed(format!(
                "no socket table readable under {}",
                self.proc_root.display()
            )));
        }

        Ok(ports)
    }
}

impl Default for ProcNetListeners {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerCheck for ProcNetListeners {
    fn is_listening(&self, port: u16) -> bool {
        match self.listening_ports() {
            Ok(ports) => ports.contains(&port),
            Err(e) => {
                debug!("Socket table scan failed: {}", e);
                false
            }
        }
    }
}

/// Listener check that attempts a loopback TCP connection.
#[derive(Debug, Clone)]
pub struct ConnectListeners {
    timeout: Duration,
}

impl ConnectListeners {
    /// Create a connect check with the given per-attempt timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ListenerCheck for ConnectListeners {
    fn is_listening(&self, port: u16) -> bool {
        let candidates = [
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
        ];
        candidates
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.timeout).is_ok())
    }
}

/// Default host check: procfs when present, otherwise loopback connect.
pub struct HostListeners {
    procfs: ProcNetListeners,
    connect: ConnectListeners,
}

impl HostListeners {
    /// Create the default host check.
    pub fn new() -> Self {
        Self {
            procfs: ProcNetListeners::new(),
            connect: ConnectListeners::new(Duration::from_millis(500)),
        }
    }
}

impl Default for HostListeners {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerCheck for HostListeners {
    fn is_listening(&self, port: u16) -> bool {
        if self.procfs.available() {
            self.procfs.is_listening(port)
        } else {
            self.connect.is_listening(port)
        }
    }
}

fn read_table(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// Parse `/proc/net/tcp` or `/proc/net/tcp6` content, keeping LISTEN rows.
///
/// ```text
///    sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
///    0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345
/// ```
pub fn parse_socket_table(content: &str, is_ipv6: bool) -> ExposeResult<Vec<ListeningSocket>> {
    let mut sockets = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let state = u8::from_str_radix(fields[3], 16)
            .map_err(|_| ExposeError::ParseError(format!("Invalid socket state: {}", fields[3])))?;
        if state != TCP_LISTEN {
            continue;
        }

        let (local_addr, port) = if is_ipv6 {
            decode_v6(fields[1])?
        } else {
            let (addr, port) = decode_v4(fields[1])?;
            (IpAddr::V4(addr), port)
        };

        sockets.push(ListeningSocket { local_addr, port });
    }

    Ok(sockets)
}

fn split_addr(s: &str) -> ExposeResult<(&str, u16)> {
    let (addr, port) = s
        .split_once(':')
        .ok_or_else(|| ExposeError::ParseError(format!("Invalid socket address: {}", s)))?;
    // Port is big-endian hex.
    let port = u16::from_str_radix(port, 16)
        .map_err(|_| ExposeError::ParseError(format!("Invalid port: {}", port)))?;
    Ok((addr, port))
}

/// Decode `0100007F:1F90` into 127.0.0.1:8080.
///
/// The address is the in-memory (host order) u32, so the bytes come out
/// reversed on little-endian hosts.
fn decode_v4(s: &str) -> ExposeResult<(Ipv4Addr, u16)> {
    let (addr, port) = split_addr(s)?;
    let raw = u32::from_str_radix(addr, 16)
        .map_err(|_| ExposeError::ParseError(format!("Invalid IPv4 address: {}", addr)))?;
    Ok((Ipv4Addr::from(raw.swap_bytes()), port))
}

/// Decode a 32 hex char IPv6 address stored as four host-order words.
fn decode_v6(s: &str) -> ExposeResult<(IpAddr, u16)> {
    let (addr, port) = split_addr(s)?;
    if addr.len() != 32 {
        return Err(ExposeError::ParseError(format!(
            "Invalid IPv6 address length: expected 32 hex chars, got {}",
            addr.len()
        )));
    }

    let mut octets = [0u8; 16];
    for (i, chunk) in octets.chunks_mut(4).enumerate() {
        let word_hex = &addr[i * 8..(i + 1) * 8];
        let word = u32::from_str_radix(word_hex, 16)
            .map_err(|_| ExposeError::ParseError(format!("Invalid IPv6 word: {}", word_hex)))?;
        chunk.copy_from_slice(&word.swap_bytes().to_be_bytes());
    }

    Ok((IpAddr::V6(Ipv6Addr::from(octets)), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const TCP4: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1B59 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12346 1 0000000000000000 100 0 0 10 0
   2: 0100007F:2382 0100007F:1234 01 00000000:00000000 00:00000000 00000000  1000        0 12347 1 0000000000000000 100 0 0 10 0";

    const TCP6: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0BB8 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12348 1 0000000000000000 100 0 0 10 0";

    #[test]
    fn test_decode_v4_loopback() {
        let (addr, port) = decode_v4("0100007F:1F90").unwrap();
        assert_eq!(addr, Ipv4Addr::LOCALHOST);
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_decode_v6_loopback() {
        let (addr, port) = decode_v6("00000000000000000000000001000000:0050").unwrap();
        assert_eq!(addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(port, 80);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_v4("00000000").is_err());
        assert!(decode_v4("GGGGGGGG:0050").is_err());
        assert!(decode_v6("0000:0050").is_err());
    }

    #[test]
    fn test_parse_table_keeps_listeners_only() {
        let sockets = parse_socket_table(TCP4, false).unwrap();
        let ports: Vec<u16> = sockets.iter().map(|s| s.port).collect();
        // 0x2382 (9090) is an established connection, not a listener
        assert_eq!(ports, vec![7001, 8080]);
    }

    #[test]
    fn test_proc_root_scan_reads_both_tables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/tcp"), TCP4).unwrap();
        std::fs::write(dir.path().join("net/tcp6"), TCP6).unwrap();

        let listeners = ProcNetListeners::with_root(dir.path());
        assert!(listeners.available());
        assert!(listeners.is_listening(7001));
        assert!(listeners.is_listening(3000));
        assert!(!listeners.is_listening(9090));
    }

    #[test]
    fn test_missing_proc_root_is_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let listeners = ProcNetListeners::with_root(dir.path());
        assert!(!listeners.available());
        assert!(matches!(
            listeners.listening_ports(),
            Err(ExposeError::ScanFailed(_))
        ));
        assert!(!listeners.is_listening(7001));
    }

    #[test]
    fn test_connect_check_sees_real_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let listeners = ConnectListeners::new(Duration::from_millis(200));
        assert!(listeners.is_listening(port));
    }
}
