//! Session orchestration and lifecycle management.
//!
//! The orchestrator runs one session: it validates the expose rules, brings
//! the tunnel up, configures mesh routing, and then waits for the first
//! completion event. The backends are synchronous (they shell out to
//! `kubectl`, `ssh` and friends) and run under `block_in_place`, so a
//! multi-threaded runtime is required.
//!
//! Helper processes handed back by the backends stay owned by their exit
//! watchers. On the way out the ledger is unwound first, while routes and
//! forwards still have their processes, and the watchers then stop their
//! children through the handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::{block_in_place, JoinHandle};
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupExecutor, CleanupReport, CleanupTask, Ledger, SystemCleanup};
use crate::cluster::{KubectlResolver, ServiceDescriptor, ServiceResolver};
use crate::config::SessionConfig;
use crate::expose::{format_expose, validate_local, validate_remote, HostListeners, ListenerCheck};
use crate::mesh::{MeshBackend, MeshContext, MeshSelector};
use crate::process::{stop_child, SupervisedProcess};
use crate::session::{SessionError, SessionEvent, SessionOutcome, SessionResult, SessionState};
use crate::telemetry::{self, AuditEvent};
use crate::tunnel::{HostsRefresh, TunnelBackend, TunnelContext, TunnelError, TunnelSelector};

const EVENT_BUFFER: usize = 16;

/// How long a helper gets between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// The systems a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Local listener check.
    pub listeners: Arc<dyn ListenerCheck>,
    /// Resource name to service lookup.
    pub resolver: Arc<dyn ServiceResolver>,
    /// Tunnel backend.
    pub tunnel: Arc<dyn TunnelBackend>,
    /// Mesh backend.
    pub mesh: Arc<dyn MeshBackend>,
    /// Undo step executor.
    pub cleanup: Arc<dyn CleanupExecutor>,
}

impl Collaborators {
    /// Collaborators talking to this host and the session's cluster.
    pub fn system(session: &SessionConfig) -> Self {
        Self {
            listeners: Arc::new(HostListeners::new()),
            resolver: Arc::new(KubectlResolver::new(session.kubectl.clone())),
            tunnel: Arc::new(TunnelSelector),
            mesh: Arc::new(MeshSelector),
            cleanup: Arc::new(SystemCleanup::new(
                session.kubectl.clone(),
                session.tunnel.hosts_file.clone(),
            )),
        }
    }
}

/// Runs one session.
pub struct Orchestrator<'a> {
    session: &'a SessionConfig,
    collaborators: Collaborators,
    ledger: Ledger,
    state_tx: watch::Sender<SessionState>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    stop_tx: watch::Sender<bool>,
    /// Exit watchers, each owning one helper process.
    process_watchers: Vec<JoinHandle<()>>,
    /// Signal listener and hosts refresh.
    tasks: Vec<JoinHandle<()>>,
}

impl<'a> Orchestrator<'a> {
    /// Create an orchestrator for `session`.
    pub fn new(session: &'a SessionConfig, collaborators: Collaborators) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, _) = watch::channel(false);
        Self {
            session,
            collaborators,
            ledger: Ledger::new(),
            state_tx,
            events_tx,
            events_rx,
            stop_tx,
            process_watchers: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Follow the session state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Sender for completion events, e.g. to request shutdown.
    pub fn event_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Run the session to completion.
    ///
    /// Errors before the cleanup task is spawned leave nothing behind. Errors
    /// after it, and every completion event, release the cleanup task before
    /// returning.
    pub async fn run(mut self) -> SessionResult<SessionOutcome> {
        let started = Instant::now();
        self.set_state(SessionState::Validating);
        let service = self.validate()?;

        let cleanup = if self.session.connect.skip_cleanup {
            info!("Cleanup skipped, cluster resources will be left in place");
            None
        } else {
            Some(CleanupTask::spawn(
                self.ledger.clone(),
                self.collaborators.cleanup.clone(),
            ))
        };

        let result = self.bring_up(&service).await;
        let duration = started.elapsed();

        self.set_state(SessionState::Terminating);
        // a refresh still running would rewrite the hosts file after cleanup
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        let report = match cleanup {
            Some(task) => task.release(self.session.cleanup_timeout).await,
            None => None,
        };
        if let Some(report) = &report {
            audit_cleanup(report);
        }
        self.stop_processes().await;
        self.set_state(SessionState::Done);

        result.map(|event| SessionOutcome {
            event,
            cleanup: report,
            duration,
        })
    }

    /// Check the expose rules locally and against the service.
    fn validate(&self) -> SessionResult<ServiceDescriptor> {
        let session = self.session;
        let rules = &session.mesh.expose;

        if let Some(port) = validate_local(rules, self.collaborators.listeners.as_ref()) {
            return Err(SessionError::LocalPortNotListening(port));
        }

        let resolver = &self.collaborators.resolver;
        let service = block_in_place(|| resolver.resolve(&session.resource, &session.namespace))?;

        if let Some(port) = validate_remote(rules, &service.target_ports()) {
            return Err(SessionError::RemotePortNotDeclared {
                port,
                service: service.name,
            });
        }
        debug!("Expose rules {} are valid", format_expose(rules));
        Ok(service)
    }

    /// Tunnel, mesh, then wait for the first completion event.
    async fn bring_up(&mut self, service: &ServiceDescriptor) -> SessionResult<SessionEvent> {
        let session = self.session;
        let signals = spawn_signal_listener(self.events_tx.clone())?;
        self.tasks.push(signals);

        let tunnel_ctx = TunnelContext::new(session, &self.ledger);
        let tunnel = self.collaborators.tunnel.clone();
        let mut established =
            block_in_place(|| tunnel.establish(&session.connect.mode, &tunnel_ctx))?;

        telemetry::audit().log(AuditEvent::TunnelUp {
            mode: session.connect.mode.name().to_string(),
            ranges: established.ranges.clone(),
        });
        self.set_state(SessionState::TunnelUp);

        // A tunnel that already died must not get mesh routing on top.
        for process in &mut established.processes {
            if let Ok(Some(code)) = process.try_exit_code() {
                return Err(TunnelError::ProcessExited {
                    component: process.component.clone(),
                    code,
                }
                .into());
            }
        }
        self.watch_processes(established.processes);
        if let Some(refresh) = established.dns_refresh {
            self.tasks.push(spawn_hosts_refresh(refresh));
        }
        if let Ok(event) = self.events_rx.try_recv() {
            return match event {
                SessionEvent::ProcessExited { component, code } => {
                    Err(TunnelError::ProcessExited { component, code }.into())
                }
                other => {
                    info!("Stopping before mesh setup: {}", other);
                    Ok(other)
                }
            };
        }

        let mesh_ctx = MeshContext::new(session, service, &self.ledger);
        let mesh = self.collaborators.mesh.clone();
        let configured = block_in_place(|| mesh.configure(&session.mesh.mode, &mesh_ctx))?;
        self.watch_processes(configured.processes);

        telemetry::audit().log(AuditEvent::MeshConfigured {
            mode: session.mesh.mode.name().to_string(),
            service: format!("{}/{}", service.namespace, service.name),
            version_mark: session.mesh.version_mark.to_string(),
            expose: format_expose(&session.mesh.expose),
        });
        self.set_state(SessionState::MeshConfigured);

        println!("---------------------------------------------------------------");
        println!(" All looks good, now you can access to resources in the kubernetes cluster");
        println!(
            " Requests with header '{}' to {} are now served by this machine",
            session.mesh.version_mark, service.name
        );
        println!("---------------------------------------------------------------");
        self.set_state(SessionState::Running);

        let event = self
            .events_rx
            .recv()
            .await
            .unwrap_or(SessionEvent::ShutdownRequested);
        match &event {
            SessionEvent::Signal(name) => info!("Terminal Signal is {}", name),
            other => warn!("Session ending: {}", other),
        }
        Ok(event)
    }

    /// Report each process's exit as a completion event, or stop the
    /// process once the session ends.
    fn watch_processes(&mut self, processes: Vec<SupervisedProcess>) {
        for process in processes {
            let component = process.component.clone();
            let tx = self.events_tx.clone();
            let mut stop = self.stop_tx.subscribe();
            let mut child = process.into_child();
            self.process_watchers.push(tokio::spawn(async move {
                let exited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = stop.wait_for(|stopping| *stopping) => None,
                };
                let Some(status) = exited else {
                    match stop_child(&mut child, STOP_GRACE).await {
                        Ok(code) => debug!("Stopped {} ({:?})", component, code),
                        Err(e) => warn!("Failed to stop {}: {}", component, e),
                    }
                    return;
                };
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!("Lost track of {}: {}", component, e);
                        None
                    }
                };
                debug!("{} exited ({:?})", component, code);
                let _ = tx.send(SessionEvent::ProcessExited { component, code }).await;
            }));
        }
    }

    /// Stop every helper that is still running and wait for it to go.
    async fn stop_processes(&mut self) {
        self.stop_tx.send_replace(true);
        for watcher in self.process_watchers.drain(..) {
            let _ = watcher.await;
        }
    }

    fn set_state(&self, state: SessionState) {
        debug!("Session state: {}", state);
        self.state_tx.send_replace(state);
    }
}

/// Forward SIGINT and SIGTERM as completion events.
fn spawn_signal_listener(tx: mpsc::Sender<SessionEvent>) -> SessionResult<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(SessionError::Signals)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(SessionError::Signals)?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        let _ = tx.send(SessionEvent::Signal(name.to_string())).await;
    }))
}

/// Rewrite the service names every refresh interval.
fn spawn_hosts_refresh(refresh: HostsRefresh) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(refresh.interval);
        // the first tick is immediate and the names were just written
        ticks.tick().await;
        loop {
            ticks.tick().await;
            match block_in_place(|| refresh.writer.update()) {
                Ok(count) => debug!("Refreshed {} service name(s)", count),
                Err(e) => warn!("Failed to refresh service names: {}", e),
            }
        }
    })
}

fn audit_cleanup(report: &CleanupReport) {
    telemetry::audit().log(AuditEvent::Cleanup {
        undone: report.undone,
        failed: report.failed.len(),
        swept: report.swept,
    });
}

/// Convenience wrapper running `session` against the real system.
pub async fn run_session(session: &SessionConfig) -> SessionResult<SessionOutcome> {
    Orchestrator::new(session, Collaborators::system(session)).run().await
}
