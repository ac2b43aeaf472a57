//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::expose::ExposeError;

/// Errors that can occur while loading configuration or building a session.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the file that couldn't be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse a TOML configuration file.
    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the file that couldn't be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        source: toml::de::Error,
    },

    /// Unknown `--connectMode`.
    #[error("invalid connect mode: '{0}', supported modes are tun2socks, sshuttle")]
    InvalidConnectMode(String),

    /// Unknown `--meshMode`.
    #[error("invalid mesh method '{0}', supported are auto, manual")]
    InvalidMeshMode(String),

    /// Unknown `--dnsMode`.
    #[error("invalid dns mode: '{0}', supported are localDNS, podDNS, hosts, hosts:<namespaces>")]
    InvalidDnsMode(String),

    /// Malformed `--expose`.
    #[error("invalid expose value: {0}")]
    Expose(#[from] ExposeError),

    /// A configuration value is invalid.
    #[error("Invalid config value for {field}: {message}")]
    InvalidValue {
        /// The field name that has an invalid value.
        field: String,
        /// Description of why the value is invalid.
        message: String,
    },

    /// Failed to determine user's home directory.
    #[error("Could not determine home directory")]
    NoHomeDirectory,
}
