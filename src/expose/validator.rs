//! Expose request validation.
//!
//! Both checks run before any cluster-side mutation. A failing check
//! returns the first offending port in the order the user wrote the rules.

use std::collections::BTreeSet;

use tracing::debug;

use super::listener::ListenerCheck;
use super::rule::ExposeRule;

/// Return the first local port with nothing listening on it.
pub fn validate_local(rules: &[ExposeRule], listeners: &dyn ListenerCheck) -> Option<u16> {
    let broken = rules
        .iter()
        .map(|r| r.local_port)
        .find(|port| !listeners.is_listening(*port));
    if let Some(port) = broken {
        debug!("No local listener on port {}", port);
    }
    broken
}

/// Return the first remote port that is not a declared target port.
pub fn validate_remote(rules: &[ExposeRule], declared: &BTreeSet<u16>) -> Option<u16> {
    let missing = rules
        .iter()
        .map(|r| r.remote_port)
        .find(|port| !declared.contains(port));
    if let Some(port) = missing {
        debug!("Port {} not in declared target ports {:?}", port, declared);
    }
    missing
}
