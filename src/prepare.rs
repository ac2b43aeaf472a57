//! Host checks run before a session starts.
//!
//! Makes sure the tools the chosen backends shell out to are installed, that
//! the process has the privileges the tun device and hosts file need, and
//! claims a PID file in the app home. PID files of sessions that no longer exist are removed
//! on the way.

use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cleanup::cleanup_stale_pid_files;
use crate::cleanup::stale::{PID_FILE_PREFIX, PID_FILE_SUFFIX};
use crate::config::{ConnectMode, SessionConfig};
use crate::tunnel::hosts::{dns_plan, DnsPlan};

/// Errors from host preparation.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// A required program is not installed.
    #[error("{tool} not found ({path:?}): {reason}")]
    MissingTool {
        /// What the program is used for.
        tool: &'static str,
        /// Program as configured.
        path: PathBuf,
        /// Lookup failure.
        reason: String,
    },

    /// The session needs root.
    #[error("{0} requires root privileges, please run with sudo")]
    NotRoot(String),

    /// The app home or PID file could not be written.
    #[error("Failed to write {path:?}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// PID file of the running session; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write `meshdebug-<pid>.pid` into `app_home`.
    pub fn create(app_home: &Path) -> Result<Self, PrepareError> {
        fs::create_dir_all(app_home).map_err(|source| PrepareError::Io {
            path: app_home.to_path_buf(),
            source,
        })?;

        let pid = std::process::id();
        let path = app_home.join(format!("{}{}{}", PID_FILE_PREFIX, pid, PID_FILE_SUFFIX));
        fs::write(&path, pid.to_string()).map_err(|source| PrepareError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("Wrote PID file {:?}", path);
        Ok(Self { path })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove PID file {:?}: {}", self.path, e);
        }
    }
}

/// Resolve a configured program: absolute paths must exist, relative paths
/// with a separator are canonicalized, bare names are looked up in `PATH`.
pub fn resolve_tool(tool: &'static str, program: &Path) -> Result<PathBuf, PrepareError> {
    let missing = |reason: String| PrepareError::MissingTool {
        tool,
        path: program.to_path_buf(),
        reason,
    };

    if program.is_absolute() {
        if program.exists() {
            Ok(program.to_path_buf())
        } else {
            Err(missing("no such file".to_string()))
        }
    } else if program.components().count() > 1 {
        fs::canonicalize(program).map_err(|e| missing(e.to_string()))
    } else {
        which::which(program).map_err(|e| missing(e.to_string()))
    }
}

/// Programs the session will run, by purpose.
pub fn required_tools(session: &SessionConfig) -> Vec<(&'static str, PathBuf)> {
    let mut tools = vec![
        ("kubectl", session.kubectl.binary().to_path_buf()),
        ("ssh", PathBuf::from("ssh")),
    ];
    if !session.shadow.identity.exists() {
        tools.push(("ssh-keygen", PathBuf::from("ssh-keygen")));
    }
    match &session.connect.mode {
        ConnectMode::Tun2Socks(options) if !options.disable_tun_device => {
            tools.push(("tun2socks", session.tunnel.tun2socks_binary.clone()));
            tools.push(("ip", PathBuf::from("ip")));
        }
        ConnectMode::Tun2Socks(_) => {}
        ConnectMode::Sshuttle => tools.push(("sshuttle", session.tunnel.sshuttle_binary.clone())),
    }
    tools
}

/// Why the session needs root, if it does.
///
/// Creating a tun device and adding routes does, and so does a hosts file
/// this user cannot write. sshuttle escalates by itself through sudo.
pub fn root_reason(session: &SessionConfig) -> Option<String> {
    let connect = &session.connect;
    let routes = match &connect.mode {
        ConnectMode::Tun2Socks(options) if !options.disable_tun_device => {
            return Some(format!("{} mode with a tun device", connect.mode));
        }
        ConnectMode::Tun2Socks(_) => false,
        ConnectMode::Sshuttle => true,
    };

    let plan = dns_plan(&connect.dns_mode, &session.namespace, connect.dns_cache_ttl);
    let hosts_file = &session.tunnel.hosts_file;
    if routes
        && matches!(plan, DnsPlan::Hosts { .. })
        && access(hosts_file, AccessFlags::W_OK).is_err()
    {
        return Some(format!("dns mode {} writing {:?}", connect.dns_mode, hosts_file));
    }
    None
}

/// Run every host check and claim the PID file.
pub fn prepare(session: &SessionConfig) -> Result<PidFile, PrepareError> {
    for (tool, program) in required_tools(session) {
        let resolved = resolve_tool(tool, &program)?;
        debug!("Using {} at {:?}", tool, resolved);
    }

    if let Some(reason) = root_reason(session)
        && !nix::unistd::geteuid().is_root()
    {
        return Err(PrepareError::NotRoot(reason));
    }

    let removed = cleanup_stale_pid_files(&session.app_home);
    if removed > 0 {
        info!("Removed {} stale PID file(s)", removed);
    }
    PidFile::create(&session.app_home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::cli::Cli;
    use crate::config::Config;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("kt");

        let pid_file = PidFile::create(&home).unwrap();
        let path = pid_file.path().to_path_buf();
        assert_eq!(fs::read_to_string(&path).unwrap(), std::process::id().to_string());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(PID_FILE_PREFIX));

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_resolve_tool() {
        assert!(resolve_tool("shell", Path::new("sh")).is_ok());
        assert!(matches!(
            resolve_tool("tun2socks", Path::new("/nonexistent/tun2socks")),
            Err(PrepareError::MissingTool { .. })
        ));
        assert!(resolve_tool("tun2socks", Path::new("kt-meshdebug-no-such-tool")).is_err());
    }

    fn session(args: &[&str], hosts_file: &Path) -> SessionConfig {
        let mut argv = vec!["kt-meshdebug", "tomcat", "--expose", "7001"];
        argv.extend_from_slice(args);
        let mut config = Config::default();
        config.general.app_home = Some(PathBuf::from("/tmp/kt-home"));
        config.tunnel.hosts_file = Some(hosts_file.to_path_buf());
        SessionConfig::build("tomcat", &Cli::parse_from(argv), &config).unwrap()
    }

    #[test]
    fn test_root_reason() {
        let dir = tempfile::tempdir().unwrap();
        let writable = dir.path().join("hosts");
        fs::write(&writable, "").unwrap();
        let unwritable = Path::new("/nonexistent/kt-meshdebug/hosts");

        let reason = root_reason(&session(&[], &writable)).unwrap();
        assert!(reason.contains("tun device"));
        assert_eq!(root_reason(&session(&["--disableTunDevice"], unwritable)), None);

        let sshuttle = ["--connectMode", "sshuttle"];
        assert_eq!(root_reason(&session(&sshuttle, &writable)), None);
        let reason = root_reason(&session(&sshuttle, unwritable)).unwrap();
        assert!(reason.contains("dns mode localDNS"));

        let pod_dns = ["--connectMode", "sshuttle", "--dnsMode", "podDNS"];
        assert_eq!(root_reason(&session(&pod_dns, unwritable)), None);
    }
}
