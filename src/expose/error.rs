//! Error types for `--expose` value handling.
//!
//! This module defines errors for:
//! - Parsing the `--expose` value
//! - Scanning local listening sockets

use thiserror::Error;

/// Errors from `--expose` value parsing and local port checks.
#[derive(Debug, Error)]
pub enum ExposeError {
    /// The `--expose` value was empty.
    #[error("Expose value is empty, expected 'port' or 'local:remote' entries")]
    Empty,

    /// A token in the `--expose` value could not be parsed.
    #[error("Invalid expose entry '{token}': {reason}")]
    InvalidToken {
        /// The offending token, as written by the user.
        token: String,
        /// Why the token was rejected.
        reason: String,
    },

    /// Failed to scan local listening sockets.
    #[error("Failed to scan local ports: {0}")]
    ScanFailed(String),

    /// Failed to parse a procfs socket table.
    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Result type for expose operations.
pub type ExposeResult<T> = Result<T, ExposeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_token_names_token() {
        let err = ExposeError::InvalidToken {
            token: "80:abc".to_string(),
            reason: "remote port is not a number".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("80:abc"));
        assert!(msg.contains("remote port"));
    }

    #[test]
    fn test_scan_failed_error() {
        let err = ExposeError::ScanFailed("permission denied".to_string());
        assert!(err.to_string().contains("permission denied"));
    }
}
