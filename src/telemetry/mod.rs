//! Audit logging for kt-meshdebug.
//!
//! A session changes shared cluster state, so what it did is recorded in
//! syslog under the `KT_MESHDEBUG` tag, separately from the `tracing`
//! diagnostics on stderr.
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"session_start","user":"developer","service":"dev/tomcat","pid":12345}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::AuditEvent;
pub use syslog::{audit, init_logger, AuditLogger, SYSLOG_TAG};
