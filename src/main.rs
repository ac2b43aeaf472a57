//! kt-meshdebug: connect to a cluster and mesh a service in one command.
//!
//! Parses the command line, loads configuration, runs the host checks and
//! then drives one session on a multi-threaded tokio runtime.
//!
//! Diagnostics go to stderr through `tracing`; the audit trail of what was
//! changed in the cluster goes to syslog.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use kt_meshdebug::{
    cli::Cli,
    config::{ConfigLoader, SessionConfig},
    orchestrator, prepare,
    session::SessionError,
    telemetry::{self, AuditEvent},
};
use tracing::{debug, info};

fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;
    debug!("Parsed CLI arguments: {:?}", cli);

    telemetry::init_logger().context("Failed to initialize telemetry")?;

    let resource = cli.resource.clone().ok_or_else(|| {
        SessionError::Usage("name of service to meshDebug is required".to_string())
    })?;

    let config = ConfigLoader::new()
        .load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    debug!("Loaded configuration: {:?}", config);

    let session = SessionConfig::build(&resource, &cli, &config)?;
    info!(
        "Meshing {}/{} ({} tunnel, {} mesh, version mark {})",
        session.namespace,
        session.resource,
        session.connect.mode,
        session.mesh.mode,
        session.mesh.version_mark
    );

    let _pid_file = prepare::prepare(&session).context("Host checks failed")?;

    let started = Instant::now();
    telemetry::audit().log(AuditEvent::SessionStart {
        user: whoami(),
        service: format!("{}/{}", session.namespace, session.resource),
        pid: std::process::id(),
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    let result = rt.block_on(orchestrator::run_session(&session));

    let end = |reason: String| AuditEvent::SessionEnd {
        user: whoami(),
        reason,
        duration_sec: started.elapsed().as_secs(),
    };
    match result {
        Ok(outcome) => {
            telemetry::audit().log(end(outcome.event.to_string()));
            if !outcome.is_clean() {
                anyhow::bail!("Session ended abnormally: {}", outcome.event);
            }
            Ok(())
        }
        Err(e) => {
            telemetry::audit().log_with_context(end("error".to_string()), &e.to_string());
            Err(e.into())
        }
    }
}

/// Initialize the tracing subscriber for diagnostics on stderr.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors, unless `RUST_LOG` says otherwise
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

/// Get the current username for audit logging.
fn whoami() -> String {
    std::env::var("SUDO_USER")
        .or_else(|_| std::env::var("USER"))
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
