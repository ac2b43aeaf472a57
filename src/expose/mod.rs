//! `--expose` parsing and validation.
//!
//! `--expose` names the ports a developer wants traffic delivered to:
//! - `7001` exposes local port 7001 as the service's target port 7001
//! - `8080:80` exposes local port 8080 as target port 80
//!
//! Validation answers two independent questions before anything is created
//! in the cluster: is each local port actually served by a running process,
//! and is each remote port a target port the service declares.

mod error;
pub mod listener;
mod rule;
mod validator;

pub use error::{ExposeError, ExposeResult};
pub use listener::{ConnectListeners, HostListeners, ListenerCheck, ProcNetListeners};
pub use rule::{format_expose, parse_expose, ExposeRule};
pub use validator::{validate_local, validate_remote};
