//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/kt-meshdebug/config.toml`
//! 3. User config: `~/.config/kt-meshdebug/config.toml`
//! 4. Additional config file (via `--config` flag)
//!
//! CLI flags are applied on top when the session is built.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/kt-meshdebug/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "kt-meshdebug";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all files.
    ///
    /// Missing system and user files are skipped. A missing `extra` file is an
    /// error, since the user named it explicitly. Invalid TOML is always an
    /// error.
    pub fn load(&self, extra: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for path in [&self.system_path, &self.user_path] {
            match self.load_file(path)? {
                Some(file_config) => {
                    config.merge(file_config);
                    debug!("Loaded config from {:?}", path);
                }
                None => debug!("No config found at {:?}", path),
            }
        }

        if let Some(extra) = extra {
            match self.load_file(extra)? {
                Some(file_config) => {
                    config.merge(file_config);
                    debug!("Loaded additional config from {:?}", extra);
                }
                None => {
                    return Err(ConfigError::ReadError {
                        path: extra.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::with_paths(
            dir.path().join("nonexistent_system.toml"),
            dir.path().join("nonexistent_user.toml"),
        );

        let config = loader.load(None).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_user_config_overrides_system() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("system.toml"),
            "[cluster]\nnamespace = \"dev\"\ncontext = \"staging\"\n",
        )
        .unwrap();
        fs::write(dir.path().join("user.toml"), "[cluster]\nnamespace = \"qa\"\n").unwrap();

        let loader =
            ConfigLoader::with_paths(dir.path().join("system.toml"), dir.path().join("user.toml"));
        let config = loader.load(None).unwrap();

        assert_eq!(config.cluster.namespace.as_deref(), Some("qa"));
        assert_eq!(config.cluster.context.as_deref(), Some("staging"));
    }

    #[test]
    fn test_lists_are_merged() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("system.toml"),
            "[tunnel]\ncluster_cidrs = [\"10.96.0.0/12\"]\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("extra.toml"),
            "[tunnel]\ncluster_cidrs = [\"172.16.0.0/16\"]\n",
        )
        .unwrap();

        let loader =
            ConfigLoader::with_paths(dir.path().join("system.toml"), dir.path().join("user.toml"));
        let config = loader.load(Some(&dir.path().join("extra.toml"))).unwrap();

        assert_eq!(config.tunnel.cluster_cidrs, vec!["10.96.0.0/12", "172.16.0.0/16"]);
    }

    #[test]
    fn test_missing_extra_file_is_error() {
        let dir = tempdir().unwrap();
        let loader =
            ConfigLoader::with_paths(dir.path().join("system.toml"), dir.path().join("user.toml"));

        let result = loader.load(Some(&dir.path().join("missing.toml")));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("invalid.toml"), "this is not valid TOML [[[").unwrap();

        let loader =
            ConfigLoader::with_paths(dir.path().join("invalid.toml"), dir.path().join("user.toml"));

        assert!(matches!(loader.load(None), Err(ConfigError::ParseError { .. })));
    }
}
