//! Configuration system for kt-meshdebug.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/kt-meshdebug/config.toml`
//! 3. User config: `~/.config/kt-meshdebug/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! All files are optional. The merged file config and the CLI flags are
//! resolved once into an immutable [`SessionConfig`].
//!
//! # Merge Behavior
//!
//! - **Lists** (cluster CIDRs) are **merged** (appended)
//! - **Scalars** (namespace, images, timeouts) are **overridden**

mod error;
mod loader;
mod schema;
mod session;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    ClusterConfig, Config, GeneralConfig, MeshFileConfig, ShadowConfig, TunnelConfig,
    DEFAULT_ROUTER_IMAGE,
};
pub use session::{
    default_router_image, ConnectConfig, ConnectMode, DnsMode, MeshConfig, MeshMode,
    SessionConfig, ShadowSettings, Tun2SocksOptions, TunnelSettings,
};
