//! Expose rule parsing.
//!
//! The `--expose` flag takes a comma separated list where each entry is
//! either a bare port (`7001`, local and remote are the same) or a
//! `local:remote` pair (`8080:80`).

use std::fmt;
use std::str::FromStr;

use super::error::{ExposeError, ExposeResult};

/// A single local-port to remote-port mapping requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExposeRule {
    /// Port the developer's application listens on locally.
    pub local_port: u16,
    /// Target port of the service in the cluster.
    pub remote_port: u16,
}

impl ExposeRule {
    /// Create a rule where the local and remote ports are the same.
    pub fn same(port: u16) -> Self {
        Self {
            local_port: port,
            remote_port: port,
        }
    }
}

impl fmt::Display for ExposeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local_port == self.remote_port {
            write!(f, "{}", self.local_port)
        } else {
            write!(f, "{}:{}", self.local_port, self.remote_port)
        }
    }
}

impl FromStr for ExposeRule {
    type Err = ExposeError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ExposeError::InvalidToken {
            token: token.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = token.split(':').collect();
        match parts.as_slice() {
            [port] => {
                let port = parse_port(port).ok_or_else(|| invalid("not a valid port number"))?;
                Ok(Self::same(port))
            }
            [local, remote] => {
                let local_port = parse_port(local)
                    .ok_or_else(|| invalid("local port is not a valid port number"))?;
                let remote_port = parse_port(remote)
                    .ok_or_else(|| invalid("remote port is not a valid port number"))?;
                Ok(Self {
                    local_port,
                    remote_port,
                })
            }
            _ => Err(invalid("expected 'port' or 'local:remote'")),
        }
    }
}

/// Parse a port number, rejecting 0 and anything outside u16.
fn parse_port(s: &str) -> Option<u16> {
    match s.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Parse an `--expose` value into an ordered list of rules.
///
/// Order is preserved so that diagnostics always name the first offending
/// entry as written by the user.
pub fn parse_expose(spec: &str) -> ExposeResult<Vec<ExposeRule>> {
    if spec.trim().is_empty() {
        return Err(ExposeError::Empty);
    }

    spec.split(',')
        .map(str::trim)
        .map(|token| {
            if token.is_empty() {
                Err(ExposeError::InvalidToken {
                    token: token.to_string(),
                    reason: "empty entry".to_string(),
                })
            } else {
                token.parse()
            }
        })
        .collect()
}

/// Render rules back into `--expose` syntax.
pub fn format_expose(rules: &[ExposeRule]) -> String {
    rules
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
