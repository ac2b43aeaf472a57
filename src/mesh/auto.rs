//! Auto mesh: put a router in front of the service.
//!
//! No service mesh is needed. The session provisions:
//!
//! - `<svc>-kt-stuntman`: a Service selecting the original pods
//! - `<svc>-kt-mesh-<mark>`: a Service selecting the mesh shadow
//! - `<svc>-kt-router`: a router Deployment sending requests that carry the
//!   version mark header to the mesh service and everything else to the
//!   stuntman
//!
//! and finally points the service's selector at the router. The original
//! selector and the owning session are kept as annotations on the service,
//! so a later session can restore it if this one dies without cleaning up.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::error::{MeshError, MeshResult};
use super::mark::VersionMark;
use super::shadow::open_mesh_shadow;
use super::{ConfiguredMesh, MeshContext};
use crate::cleanup::UndoStep;
use crate::cluster::service::string_map;
use crate::cluster::{local_hostname, ownership_labels, PatchType, ServiceDescriptor};
use crate::expose::ExposeRule;
use crate::process::process_exists;
use crate::tunnel::LABEL_SHADOW;

/// Service annotation holding the selector as it was before meshing.
pub const ANNOTATION_ORIGINAL_SELECTOR: &str = "kt-meshdebug/original-selector";

/// Service annotation naming the session (`host:pid`) that redirected it.
pub const ANNOTATION_OWNER: &str = "kt-meshdebug/owner";

/// Pod label on router pods naming the service they front.
pub const LABEL_ROUTER: &str = "kt-meshdebug/router";

/// Router Deployment name.
pub fn router_name(service: &str) -> String {
    format!("{}-kt-router", service)
}

/// Service keeping the original pods reachable.
pub fn stuntman_name(service: &str) -> String {
    format!("{}-kt-stuntman", service)
}

/// Service in front of the mesh shadow.
pub fn mesh_service_name(service: &str, mark_suffix: &str) -> String {
    format!("{}-kt-mesh-{}", service, mark_suffix)
}

/// `host:pid` of this session.
pub fn owner_annotation() -> String {
    format!("{}:{}", local_hostname(), std::process::id())
}

/// Split a `host:pid` owner annotation.
pub fn parse_owner_annotation(value: &str) -> Option<(&str, u32)> {
    let (host, pid) = value.rsplit_once(':')?;
    Some((host, pid.parse().ok()?))
}

/// JSON pointer token for an object key.
fn pointer_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn annotation_path(key: &str) -> String {
    format!("/metadata/annotations/{}", pointer_token(key))
}

/// Patch pointing the service at the router and recording where it pointed
/// before.
///
/// The leading `test` makes the patch fail if the selector changed since
/// `current` was read.
pub fn redirect_selector_patch(
    service: &Value,
    current: &BTreeMap<String, String>,
    original: &BTreeMap<String, String>,
    router_selector: &BTreeMap<String, String>,
    owner: &str,
) -> Value {
    let original_json = serde_json::to_string(original).unwrap_or_else(|_| "{}".to_string());
    let mut ops = vec![
        json!({"op": "test", "path": "/spec/selector", "value": current}),
        json!({"op": "replace", "path": "/spec/selector", "value": router_selector}),
    ];

    match service.pointer("/metadata/annotations") {
        Some(Value::Object(_)) => {
            ops.push(json!({
                "op": "add",
                "path": annotation_path(ANNOTATION_ORIGINAL_SELECTOR),
                "value": original_json
            }));
            ops.push(json!({
                "op": "add",
                "path": annotation_path(ANNOTATION_OWNER),
                "value": owner
            }));
        }
        _ => ops.push(json!({
            "op": "add",
            "path": "/metadata/annotations",
            "value": {ANNOTATION_ORIGINAL_SELECTOR: original_json, ANNOTATION_OWNER: owner}
        })),
    }
    Value::Array(ops)
}

/// Patch putting `original` back as the selector and dropping our
/// annotations.
pub fn restore_selector_patch(original: &BTreeMap<String, String>) -> Value {
    json!([
        {"op": "replace", "path": "/spec/selector", "value": original},
        {"op": "remove", "path": annotation_path(ANNOTATION_ORIGINAL_SELECTOR)},
        {"op": "remove", "path": annotation_path(ANNOTATION_OWNER)}
    ])
}

/// Undo step restoring a redirected service from its annotation, if it has
/// one that parses.
pub fn restore_selector_step(service: &Value, name: &str, namespace: &str) -> Option<UndoStep> {
    let original = service
        .pointer("/metadata/annotations")?
        .get(ANNOTATION_ORIGINAL_SELECTOR)?
        .as_str()?;
    let original: BTreeMap<String, String> = match serde_json::from_str(original) {
        Ok(map) => map,
        Err(e) => {
            warn!("Ignoring unreadable selector annotation on {}/{}: {}", namespace, name, e);
            return None;
        }
    };
    Some(UndoStep::Patch {
        kind: "service".to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        patch_type: PatchType::Json,
        patch: restore_selector_patch(&original),
    })
}

/// The selector to restore on cleanup.
///
/// A service already redirected by a live session is refused. One left
/// behind by a dead session on this host is taken over, keeping the
/// selector that session recorded.
pub fn original_selector(
    service: &Value,
    name: &str,
    is_alive: impl Fn(u32) -> bool,
) -> MeshResult<BTreeMap<String, String>> {
    let current = string_map(service.pointer("/spec/selector"));
    let annotations = service.pointer("/metadata/annotations");
    let Some(owner) = annotations
        .and_then(|a| a.get(ANNOTATION_OWNER))
        .and_then(Value::as_str)
    else {
        return Ok(current);
    };

    let already_meshed = || MeshError::AlreadyMeshed {
        service: name.to_string(),
        owner: owner.to_string(),
    };
    match parse_owner_annotation(owner) {
        Some((host, pid)) if host == local_hostname() && !is_alive(pid) => {
            info!("Taking over {} from dead session {}", name, owner);
            let recorded = annotations
                .and_then(|a| a.get(ANNOTATION_ORIGINAL_SELECTOR))
                .and_then(Value::as_str)
                .and_then(|s| serde_json::from_str(s).ok());
            recorded.ok_or_else(already_meshed)
        }
        _ => Err(already_meshed()),
    }
}

fn service_port(port: u16) -> Value {
    json!({"name": format!("port-{}", port), "port": port, "targetPort": port, "protocol": "TCP"})
}

/// Service selecting the original pods on the original target ports.
pub fn stuntman_manifest(
    service: &ServiceDescriptor,
    selector: &BTreeMap<String, String>,
) -> Value {
    let ports: Vec<Value> = service.target_ports().into_iter().map(service_port).collect();
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": stuntman_name(&service.name),
            "namespace": service.namespace,
            "labels": ownership_labels("stuntman")
        },
        "spec": {"selector": selector, "ports": ports}
    })
}

/// Service selecting the mesh shadow on the exposed ports.
pub fn mesh_service_manifest(
    service: &ServiceDescriptor,
    mark: &VersionMark,
    shadow_name: &str,
    rules: &[ExposeRule],
) -> Value {
    let mut labels = ownership_labels("mesh-service");
    labels.insert(mark.key.clone(), mark.value.clone());
    let mut remote: Vec<u16> = rules.iter().map(|r| r.remote_port).collect();
    remote.sort_unstable();
    remote.dedup();
    let ports: Vec<Value> = remote.into_iter().map(service_port).collect();

    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": mesh_service_name(&service.name, &mark.name_suffix()),
            "namespace": service.namespace,
            "labels": labels
        },
        "spec": {"selector": {LABEL_SHADOW: shadow_name}, "ports": ports}
    })
}

/// Selector the service is switched to.
pub fn router_selector(service: &str) -> BTreeMap<String, String> {
    [(LABEL_ROUTER.to_string(), service.to_string())].into_iter().collect()
}

/// Router Deployment fronting the service.
pub fn router_manifest(service: &ServiceDescriptor, image: &str, mark: &VersionMark) -> Value {
    let name = router_name(&service.name);
    let mut labels = ownership_labels("router");
    labels.extend(router_selector(&service.name));

    let target_ports = service.target_ports();
    let ports_arg = target_ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let container_ports: Vec<Value> = target_ports
        .iter()
        .map(|p| json!({"containerPort": p}))
        .collect();

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": service.namespace, "labels": labels},
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": router_selector(&service.name)},
            "template": {
                "metadata": {"labels": labels},
                "spec": {
                    "containers": [{
                        "name": "router",
                        "image": image,
                        "imagePullPolicy": "IfNotPresent",
                        "args": [
                            "--service", stuntman_name(&service.name),
                            "--mesh", mesh_service_name(&service.name, &mark.name_suffix()),
                            "--ports", ports_arg,
                            "--header", mark.to_string()
                        ],
                        "ports": container_ports
                    }]
                }
            }
        }
    })
}

/// Configure auto mesh.
pub fn configure(router_image: &str, ctx: &MeshContext<'_>) -> MeshResult<ConfiguredMesh> {
    let service = ctx.service;
    let namespace = service.namespace.as_str();
    let mark = &ctx.mesh.version_mark;

    let current = ctx.kubectl.get_json("service", &service.name, namespace)?;
    let original = original_selector(&current, &service.name, process_exists)?;
    if original.is_empty() {
        return Err(MeshError::InvalidResource {
            kind: "service".to_string(),
            name: service.name.clone(),
            message: "service has no selector".to_string(),
        });
    }

    // The mesh shadow must not carry the original selector labels, or the
    // stuntman would send unmarked traffic to it too.
    let (shadow_name, processes) = open_mesh_shadow(ctx, &BTreeMap::new())?;

    for manifest in [
        mesh_service_manifest(service, mark, &shadow_name, &ctx.mesh.expose),
        stuntman_manifest(service, &original),
    ] {
        let name = manifest
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        ctx.ledger.record(UndoStep::delete("service", &name, namespace));
        ctx.kubectl.apply(&manifest)?;
    }

    let router = router_name(&service.name);
    ctx.ledger.record(UndoStep::delete("deployment", &router, namespace));
    ctx.kubectl.apply(&router_manifest(service, router_image, mark))?;
    ctx.kubectl
        .rollout_status(&router, namespace, ctx.shadow.ready_timeout)?;

    let patch = redirect_selector_patch(
        &current,
        &string_map(current.pointer("/spec/selector")),
        &original,
        &router_selector(&service.name),
        &owner_annotation(),
    );
    ctx.kubectl
        .patch("service", &service.name, namespace, PatchType::Json, &patch)?;
    ctx.ledger.record(UndoStep::Patch {
        kind: "service".to_string(),
        name: service.name.clone(),
        namespace: namespace.to_string(),
        patch_type: PatchType::Json,
        patch: restore_selector_patch(&original),
    });

    info!(
        "Service {}/{} now routes '{}' traffic to this machine through {}",
        namespace, service.name, mark, router
    );
    Ok(ConfiguredMesh { processes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ServicePort;

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor {
            name: "tomcat".to_string(),
            namespace: "dev".to_string(),
            selector: [("app".to_string(), "tomcat".to_string())].into_iter().collect(),
            ports: vec![
                ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: 8080,
                    protocol: "TCP".to_string(),
                },
                ServicePort {
                    name: Some("admin".to_string()),
                    port: 9090,
                    target_port: 9090,
                    protocol: "TCP".to_string(),
                },
            ],
        }
    }

    fn mark() -> VersionMark {
        "mark:local".parse().unwrap()
    }

    fn selector(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_owner_annotation_round_trip() {
        let owner = owner_annotation();
        let (host, pid) = parse_owner_annotation(&owner).unwrap();
        assert_eq!(host, local_hostname());
        assert_eq!(pid, std::process::id());

        assert_eq!(parse_owner_annotation("my:host:12"), Some(("my:host", 12)));
        assert_eq!(parse_owner_annotation("nohost"), None);
        assert_eq!(parse_owner_annotation("host:abc"), None);
    }

    #[test]
    fn test_redirect_patch_without_annotations() {
        let svc = json!({"metadata": {"name": "tomcat"}, "spec": {"selector": {"app": "tomcat"}}});
        let original = selector(&[("app", "tomcat")]);
        let router = router_selector("tomcat");
        let patch = redirect_selector_patch(&svc, &original, &original, &router, "box:1");

        assert_eq!(patch[0]["op"], "test");
        assert_eq!(patch[0]["value"]["app"], "tomcat");
        assert_eq!(patch[1]["value"][LABEL_ROUTER], "tomcat");
        assert_eq!(patch[2]["path"], "/metadata/annotations");
        assert_eq!(patch[2]["value"][ANNOTATION_OWNER], "box:1");
        assert_eq!(
            patch[2]["value"][ANNOTATION_ORIGINAL_SELECTOR],
            "{\"app\":\"tomcat\"}"
        );
    }

    #[test]
    fn test_redirect_patch_escapes_annotation_keys() {
        let svc = json!({
            "metadata": {"name": "tomcat", "annotations": {"team": "web"}},
            "spec": {"selector": {"app": "tomcat"}}
        });
        let original = selector(&[("app", "tomcat")]);
        let router = router_selector("tomcat");
        let patch = redirect_selector_patch(&svc, &original, &original, &router, "box:1");

        assert_eq!(patch[2]["path"], "/metadata/annotations/kt-meshdebug~1original-selector");
        assert_eq!(patch[3]["path"], "/metadata/annotations/kt-meshdebug~1owner");
    }

    #[test]
    fn test_restore_selector_step_reads_annotation() {
        let svc = json!({
            "metadata": {
                "name": "tomcat",
                "annotations": {ANNOTATION_ORIGINAL_SELECTOR: "{\"app\":\"tomcat\"}"}
            },
            "spec": {"selector": {LABEL_ROUTER: "tomcat"}}
        });
        let Some(UndoStep::Patch { kind, patch, .. }) = restore_selector_step(&svc, "tomcat", "dev")
        else {
            panic!("expected a patch step");
        };
        assert_eq!(kind, "service");
        assert_eq!(patch[0]["value"]["app"], "tomcat");
        assert_eq!(patch[1]["op"], "remove");

        let broken = json!({
            "metadata": {"annotations": {ANNOTATION_ORIGINAL_SELECTOR: "not json"}}
        });
        assert!(restore_selector_step(&broken, "tomcat", "dev").is_none());
        assert!(restore_selector_step(&json!({"metadata": {}}), "tomcat", "dev").is_none());
    }

    #[test]
    fn test_original_selector_plain_service() {
        let svc = json!({"spec": {"selector": {"app": "tomcat"}}});
        assert_eq!(
            original_selector(&svc, "tomcat", |_| true).unwrap(),
            selector(&[("app", "tomcat")])
        );
    }

    #[test]
    fn test_original_selector_refuses_live_owner() {
        let owner = format!("{}:4242", local_hostname());
        let svc = json!({
            "metadata": {"annotations": {
                ANNOTATION_OWNER: owner,
                ANNOTATION_ORIGINAL_SELECTOR: "{\"app\":\"tomcat\"}"
            }},
            "spec": {"selector": {LABEL_ROUTER: "tomcat"}}
        });
        assert!(matches!(
            original_selector(&svc, "tomcat", |_| true),
            Err(MeshError::AlreadyMeshed { .. })
        ));
        assert_eq!(
            original_selector(&svc, "tomcat", |_| false).unwrap(),
            selector(&[("app", "tomcat")])
        );
    }

    #[test]
    fn test_original_selector_refuses_other_host() {
        let svc = json!({
            "metadata": {"annotations": {ANNOTATION_OWNER: "some-other-machine-x:1"}},
            "spec": {"selector": {LABEL_ROUTER: "tomcat"}}
        });
        assert!(original_selector(&svc, "tomcat", |_| false).is_err());
    }

    #[test]
    fn test_router_manifest() {
        let manifest = router_manifest(&descriptor(), "router:v1", &mark());
        assert_eq!(manifest["metadata"]["name"], "tomcat-kt-router");
        assert_eq!(manifest["spec"]["selector"]["matchLabels"][LABEL_ROUTER], "tomcat");

        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "router:v1");
        let args: Vec<&str> = container["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a.as_str().unwrap())
            .collect();
        assert_eq!(
            args,
            vec![
                "--service",
                "tomcat-kt-stuntman",
                "--mesh",
                "tomcat-kt-mesh-local",
                "--ports",
                "8080,9090",
                "--header",
                "mark:local"
            ]
        );
    }

    #[test]
    fn test_service_manifests() {
        let svc = descriptor();
        let stuntman = stuntman_manifest(&svc, &svc.selector);
        assert_eq!(stuntman["metadata"]["name"], "tomcat-kt-stuntman");
        assert_eq!(stuntman["spec"]["selector"]["app"], "tomcat");
        assert_eq!(stuntman["spec"]["ports"][0]["port"], 8080);
        assert_eq!(stuntman["spec"]["ports"][0]["targetPort"], 8080);

        let rules = vec![ExposeRule {
            local_port: 18080,
            remote_port: 8080,
        }];
        let mesh = mesh_service_manifest(&svc, &mark(), "tomcat-kt-mesh-local", &rules);
        assert_eq!(mesh["metadata"]["name"], "tomcat-kt-mesh-local");
        assert_eq!(mesh["metadata"]["labels"]["mark"], "local");
        assert_eq!(mesh["spec"]["selector"][LABEL_SHADOW], "tomcat-kt-mesh-local");
        assert_eq!(mesh["spec"]["ports"].as_array().unwrap().len(), 1);
    }
}
