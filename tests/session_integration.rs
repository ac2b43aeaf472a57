use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use clap::Parser;
use kt_meshdebug::cleanup::{CleanupExecutor, CleanupResult, UndoStep};
use kt_meshdebug::cli::Cli;
use kt_meshdebug::cluster::{ClusterResult, ServiceDescriptor, ServicePort, ServiceResolver};
use kt_meshdebug::config::{Config, ConfigError, ConfigLoader, ConnectMode, MeshMode, SessionConfig};
use kt_meshdebug::expose::{
    parse_expose, validate_local, validate_remote, ExposeRule, HostListeners,
};
use kt_meshdebug::mesh::{ConfiguredMesh, MeshBackend, MeshContext, MeshResult};
use kt_meshdebug::orchestrator::{Collaborators, Orchestrator};
use kt_meshdebug::session::{SessionEvent, SessionState};
use kt_meshdebug::tunnel::{EstablishedTunnel, TunnelBackend, TunnelContext, TunnelResult};

fn config_in(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.general.app_home = Some(dir.to_path_buf());
    config
}

fn build(args: &[&str], config: &Config) -> Result<SessionConfig, ConfigError> {
    let mut argv = vec!["kt-meshdebug", "tomcat"];
    argv.extend_from_slice(args);
    SessionConfig::build("tomcat", &Cli::parse_from(argv), config)
}

#[test]
fn test_expose_against_declared_ports() {
    let rules = parse_expose("7001").unwrap();
    assert_eq!(rules, vec![ExposeRule::same(7001)]);
    assert_eq!(validate_remote(&rules, &[7001, 9090].into()), None);

    let rules = parse_expose("8080:80").unwrap();
    assert_eq!(
        rules,
        vec![ExposeRule {
            local_port: 8080,
            remote_port: 80
        }]
    );
    assert_eq!(validate_remote(&rules, &[9090].into()), Some(80));
}

#[test]
fn test_host_listeners_see_real_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let rules = vec![ExposeRule::same(port)];
    assert_eq!(validate_local(&rules, &HostListeners::new()), None);

    drop(listener);
    assert_eq!(validate_local(&rules, &HostListeners::new()), Some(port));
}

#[test]
fn test_unknown_connect_mode_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let args = ["--expose", "7001", "--connectMode", "wireguard"];
    let err = build(&args, &config_in(dir.path())).unwrap_err();

    assert!(matches!(err, ConfigError::InvalidConnectMode(ref mode) if mode == "wireguard"));
    let message = err.to_string();
    assert!(message.contains("wireguard"));
    assert!(message.contains("tun2socks"));
    assert!(message.contains("sshuttle"));
    // Nothing was written to the app home.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_unknown_mesh_mode_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let args = ["--expose", "7001", "--meshMode", "magic"];
    let err = build(&args, &config_in(dir.path())).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidMeshMode(_)));
    assert!(err.to_string().contains("auto, manual"));
}

#[test]
fn test_file_config_under_cli_flags() {
    let dir = tempfile::tempdir().unwrap();
    let user = dir.path().join("user.toml");
    std::fs::write(
        &user,
        format!(
            concat!(
                "[general]\napp_home = {:?}\n\n",
                "[cluster]\nnamespace = \"dev\"\n\n",
                "[mesh]\nrouter_image = \"registry.local/router\"\n",
            ),
            dir.path().join("home")
        ),
    )
    .unwrap();

    let config = ConfigLoader::with_paths(dir.path().join("system.toml"), user)
        .load(None)
        .unwrap();

    let session = build(&["--expose", "7001", "--versionMark", "mark:local"], &config).unwrap();
    assert_eq!(session.namespace, "dev");
    assert_eq!(session.mesh.version_mark.to_string(), "mark:local");
    assert!(matches!(
        session.mesh.mode,
        MeshMode::Auto { ref router_image } if router_image.starts_with("registry.local/router:v")
    ));
    assert!(matches!(session.connect.mode, ConnectMode::Tun2Socks(o) if o.socks_port == 2223));

    let session = build(&["--expose", "7001", "-n", "qa"], &config).unwrap();
    assert_eq!(session.namespace, "qa");
}

struct StaticResolver;

impl ServiceResolver for StaticResolver {
    fn resolve(&self, resource: &str, namespace: &str) -> ClusterResult<ServiceDescriptor> {
        Ok(ServiceDescriptor {
            name: resource.to_string(),
            namespace: namespace.to_string(),
            selector: BTreeMap::from([("app".to_string(), resource.to_string())]),
            ports: [7001u16, 9090]
                .iter()
                .map(|p| ServicePort {
                    name: None,
                    port: *p,
                    target_port: *p,
                    protocol: "TCP".to_string(),
                })
                .collect(),
        })
    }
}

struct NoopTunnel;

impl TunnelBackend for NoopTunnel {
    fn establish(
        &self,
        _mode: &ConnectMode,
        ctx: &TunnelContext<'_>,
    ) -> TunnelResult<EstablishedTunnel> {
        ctx.ledger.record(UndoStep::DeleteRoute {
            cidr: "10.96.0.0/16".to_string(),
            device: "kt0".to_string(),
        });
        Ok(EstablishedTunnel::default())
    }
}

struct NoopMesh;

impl MeshBackend for NoopMesh {
    fn configure(&self, _mode: &MeshMode, ctx: &MeshContext<'_>) -> MeshResult<ConfiguredMesh> {
        ctx.ledger
            .record(UndoStep::delete("service", "tomcat-kt-stuntman", &ctx.service.namespace));
        Ok(ConfiguredMesh::default())
    }
}

#[derive(Default)]
struct RecordingCleanup(Mutex<Vec<String>>);

impl CleanupExecutor for RecordingCleanup {
    fn undo(&self, step: &UndoStep) -> CleanupResult<()> {
        self.0.lock().unwrap().push(step.to_string());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_with_real_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();

    let mut session = build(&["--expose", "7001"], &config_in(dir.path())).unwrap();
    // Expose the port actually listening as service port 7001.
    session.mesh.expose = vec![ExposeRule {
        local_port: port,
        remote_port: 7001,
    }];

    let cleanup = Arc::new(RecordingCleanup::default());
    let collaborators = Collaborators {
        listeners: Arc::new(HostListeners::new()),
        resolver: Arc::new(StaticResolver),
        tunnel: Arc::new(NoopTunnel),
        mesh: Arc::new(NoopMesh),
        cleanup: cleanup.clone(),
    };

    let orchestrator = Orchestrator::new(&session, collaborators);
    let mut state = orchestrator.subscribe();
    let tx = orchestrator.event_sender();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            if *state.borrow() == SessionState::Running {
                let _ = tx.send(SessionEvent::Signal("SIGTERM".to_string())).await;
                return;
            }
        }
    });

    let outcome = orchestrator.run().await.unwrap();
    assert_eq!(outcome.event, SessionEvent::Signal("SIGTERM".to_string()));
    assert!(outcome.is_clean());
    assert_eq!(
        *cleanup.0.lock().unwrap(),
        vec![
            "delete service default/tomcat-kt-stuntman",
            "delete route 10.96.0.0/16 dev kt0"
        ]
    );
}
