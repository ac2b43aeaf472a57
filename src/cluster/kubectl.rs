//! Thin wrapper around the `kubectl` binary.
//!
//! Authentication and cluster selection are left to kubectl and the user's
//! kubeconfig; this type only carries the global flags and turns failures
//! into [`ClusterError`]s.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::error::{ClusterError, ClusterResult};
use crate::process::CommandLine;

/// Kind of patch passed to `kubectl patch --type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    /// RFC 6902 JSON patch.
    Json,
    /// RFC 7386 merge patch.
    Merge,
}

impl PatchType {
    fn as_str(self) -> &'static str {
        match self {
            PatchType::Json => "json",
            PatchType::Merge => "merge",
        }
    }
}

/// `kubectl` invocation context.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl Kubectl {
    /// Use the given kubectl binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig: None,
            context: None,
        }
    }

    /// Use a specific kubeconfig file.
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    /// Use a specific kubeconfig context.
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// The kubectl program.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Command line with the global flags applied.
    pub fn command_line(&self) -> CommandLine {
        CommandLine::new(&self.binary)
            .opt("--kubeconfig", self.kubeconfig.as_ref())
            .opt("--context", self.context.as_ref())
    }

    /// Run kubectl and return stdout.
    pub fn run(&self, args: &[&str]) -> ClusterResult<String> {
        self.run_inner(args, None)
    }

    /// Run kubectl with `input` on stdin and return stdout.
    pub fn run_with_input(&self, args: &[&str], input: &str) -> ClusterResult<String> {
        self.run_inner(args, Some(input))
    }

    fn run_inner(&self, args: &[&str], input: Option<&str>) -> ClusterResult<String> {
        let cmd_line = self.command_line().args(args.iter().copied());
        let cmd_str = cmd_line.to_command_line();
        debug!("Running: {}", cmd_str);

        let failed = |source| ClusterError::CommandFailed {
            cmd: cmd_str.clone(),
            source,
        };

        let mut cmd = cmd_line.to_std();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(failed)?;
        if let Some(input) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(input.as_bytes()).map_err(failed)?;
        }
        let output = child.wait_with_output().map_err(failed)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ClusterError::CommandError {
                cmd: cmd_str,
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Fetch a single object as JSON.
    ///
    /// A missing object is reported as [`ClusterError::NotFound`].
    pub fn get_json(&self, kind: &str, name: &str, namespace: &str) -> ClusterResult<Value> {
        let args = ["get", kind, name, "-n", namespace, "-o", "json", "--ignore-not-found"];
        let stdout = self.run(&args)?;
        if stdout.trim().is_empty() {
            return Err(ClusterError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        parse_json(&args, &stdout)
    }

    /// List objects of `kind`, optionally filtered by label selector.
    pub fn list_json(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> ClusterResult<Vec<Value>> {
        let mut args = vec!["get", kind, "-o", "json"];
        match namespace {
            Some(ns) => args.extend(["-n", ns]),
            None => args.push("--all-namespaces"),
        }
        if let Some(selector) = selector {
            args.extend(["-l", selector]);
        }

        let list = parse_json(&args, &self.run(&args)?)?;
        Ok(list
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Create or update an object from a manifest.
    pub fn apply(&self, manifest: &Value) -> ClusterResult<()> {
        self.run_with_input(&["apply", "-f", "-"], &manifest.to_string())?;
        Ok(())
    }

    /// Patch an existing object.
    pub fn patch(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        patch_type: PatchType,
        patch: &Value,
    ) -> ClusterResult<()> {
        let patch = patch.to_string();
        self.run(&[
            "patch",
            kind,
            name,
            "-n",
            namespace,
            "--type",
            patch_type.as_str(),
            "-p",
            &patch,
        ])?;
        Ok(())
    }

    /// Delete an object; deleting something already gone is not an error.
    pub fn delete(&self, kind: &str, name: &str, namespace: &str) -> ClusterResult<()> {
        self.run(&[
            "delete",
            kind,
            name,
            "-n",
            namespace,
            "--ignore-not-found=true",
            "--wait=false",
        ])?;
        Ok(())
    }

    /// Wait for a deployment rollout to finish.
    pub fn rollout_status(
        &self,
        deployment: &str,
        namespace: &str,
        timeout: Duration,
    ) -> ClusterResult<()> {
        let target = format!("deployment/{}", deployment);
        let timeout_arg = format!("--timeout={}s", timeout.as_secs());
        self.run(&["rollout", "status", &target, "-n", namespace, &timeout_arg])
            .map_err(|e| match e {
                ClusterError::CommandError { .. } => ClusterError::NotReady {
                    kind: "deployment".to_string(),
                    name: deployment.to_string(),
                    timeout_secs: timeout.as_secs(),
                },
                other => other,
            })?;
        Ok(())
    }
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

fn parse_json(args: &[&str], stdout: &str) -> ClusterResult<Value> {
    serde_json::from_str(stdout).map_err(|e| ClusterError::InvalidResponse {
        cmd: format!("kubectl {}", args.join(" ")),
        message: e.to_string(),
    })
}
