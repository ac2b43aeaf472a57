//! Background process handling.
//!
//! Tunnel and mesh backends keep helper processes alive for the whole session
//! (`ssh`, `tun2socks`, `sshuttle`, `kubectl port-forward`). Each one is
//! wrapped in a [`SupervisedProcess`]. The orchestrator owns the child for
//! the whole session, watches for its exit and stops it at the end through
//! the handle, never through a bare PID.

use std::ffi::OsString;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

/// Builder for a helper process command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandLine {
    /// Start a command line for `program`.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `flag value` only when the value is present.
    pub fn opt(self, flag: &str, value: Option<impl Into<OsString>>) -> Self {
        match value {
            Some(v) => self.arg(flag).arg(v),
            None => self,
        }
    }

    /// Program name.
    pub fn program(&self) -> &OsString {
        &self.program
    }

    /// Arguments, without the program.
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Render as a single shell-like string (for logging and error messages).
    pub fn to_command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build a blocking `std::process::Command`.
    pub fn to_std(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Build an async `tokio::process::Command`.
    pub fn to_tokio(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_command_line())
    }
}

/// A helper process that must stay alive for the session.
#[derive(Debug)]
pub struct SupervisedProcess {
    /// Which part of the session owns the process (e.g. `socks-proxy`).
    pub component: String,
    /// OS process id.
    pub pid: u32,
    child: Child,
}

impl SupervisedProcess {
    /// Spawn `command` as a supervised process.
    ///
    /// Stdout is discarded; stderr is inherited so backend diagnostics reach
    /// the user.
    pub fn spawn(component: impl Into<String>, command: &CommandLine) -> std::io::Result<Self> {
        let component = component.into();
        debug!("Starting {}: {}", component, command);

        let child = command
            .to_tokio()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other(format!("{} exited immediately", component)))?;

        Ok(Self {
            component,
            pid,
            child,
        })
    }

    /// Check whether the process has already exited.
    pub fn try_exit_code(&mut self) -> std::io::Result<Option<Option<i32>>> {
        Ok(self.child.try_wait()?.map(|status| status.code()))
    }

    /// Give up the handle, returning the child for an exit watcher.
    pub fn into_child(self) -> Child {
        self.child
    }
}

/// Stop a child: SIGTERM, then SIGKILL once `grace` runs out.
///
/// A child that was already reaped has no PID any more and is left alone,
/// so a recycled PID is never signalled. Returns the exit code, `None` when
/// the child died from a signal.
pub async fn stop_child(child: &mut Child, grace: Duration) -> std::io::Result<Option<i32>> {
    let Some(pid) = child.id() else {
        return Ok(child.try_wait()?.and_then(|status| status.code()));
    };
    if let Ok(raw) = i32::try_from(pid) {
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(status?.code()),
        Err(_) => {
            debug!("PID {} ignored SIGTERM, killing it", pid);
            child.kill().await?;
            Ok(None)
        }
    }
}

/// Check if a process with the given PID exists.
pub fn process_exists(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}
