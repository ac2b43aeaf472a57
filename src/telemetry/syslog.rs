//! Syslog integration for audit logging.
//!
//! All audit events are logged to syslog with the `KT_MESHDEBUG` tag.

use std::sync::{Mutex, OnceLock};

use serde::Serialize;
use syslog::{Facility, Formatter3164};
use tracing::{debug, error, warn};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "KT_MESHDEBUG";

/// Global audit logger instance.
static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Audit logger that writes structured JSON events to syslog.
///
/// Uses interior mutability (Mutex) to allow logging from shared references,
/// which is necessary since the logger is stored in a global OnceLock.
pub struct AuditLogger {
    /// Syslog writer protected by a mutex for interior mutability.
    /// None indicates a null logger.
    writer: Option<Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>>,
}

impl AuditLogger {
    /// Create a new audit logger connected to syslog.
    ///
    /// Uses Unix socket connection to local syslog daemon.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter)
            .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create a null audit logger that discards all events.
    pub fn new_null() -> Self {
        Self { writer: None }
    }

    /// Log an audit event to syslog.
    ///
    /// The event is serialized to JSON with an ISO8601 timestamp.
    /// If this is a null logger, the event is silently discarded.
    pub fn log(&self, event: AuditEvent) {
        self.write(&event.with_timestamp());
    }

    /// Log an audit event with additional context (usually an error message).
    pub fn log_with_context(&self, event: AuditEvent, context: &str) {
        #[derive(Serialize)]
        struct WithContext<'a, T> {
            #[serde(flatten)]
            inner: T,
            context: &'a str,
        }

        self.write(&WithContext {
            inner: event.with_timestamp(),
            context,
        });
    }

    fn write(&self, record: &impl Serialize) {
        let Some(ref writer) = self.writer else {
            return;
        };

        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match writer.lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.info(&json) {
                    error!("Failed to write to syslog: {}", e);
                }
            }
            Err(e) => error!("Failed to acquire syslog writer lock: {}", e),
        }
        debug!("Logged audit event: {}", json);
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        self.writer.is_none()
    }
}

/// Initialize the global audit logger.
///
/// A missing syslog daemon is not fatal: events are then discarded with a
/// warning. Calling this twice is an error.
pub fn init_logger() -> Result<(), TelemetryError> {
    let logger = AuditLogger::new().unwrap_or_else(|e| {
        warn!("Audit events will not be recorded: {}", e);
        AuditLogger::new_null()
    });

    AUDIT_LOGGER
        .set(logger)
        .map_err(|_| TelemetryError::AlreadyInitialized)
}

/// Get the global audit logger, or a null logger if none was initialized.
pub fn audit() -> &'static AuditLogger {
    AUDIT_LOGGER.get_or_init(AuditLogger::new_null)
}
