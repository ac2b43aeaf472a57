//! Manual mesh: patch the service's existing istio resources.
//!
//! A subset selecting the version mark label is appended to the
//! DestinationRule, and a route matching the version mark header is put in
//! front of the VirtualService's HTTP routes. The mesh shadow carries the
//! service's own selector labels plus the mark, so it joins the service and
//! falls into the new subset.
//!
//! Undo patches `test` the entry they remove, so a resource edited by
//! someone else in the meantime is left alone rather than damaged.

use serde_json::{json, Value};
use tracing::info;

use super::error::{MeshError, MeshResult};
use super::mark::VersionMark;
use super::shadow::open_mesh_shadow;
use super::{ConfiguredMesh, MeshContext};
use crate::cleanup::UndoStep;
use crate::cluster::PatchType;

/// Istio DestinationRule resource name for kubectl.
pub const DESTINATION_RULE: &str = "destinationrule";

/// Istio VirtualService resource name for kubectl.
pub const VIRTUAL_SERVICE: &str = "virtualservice";

/// Subset and route name for a mark.
pub fn entry_name(mark: &VersionMark) -> String {
    format!("kt-meshdebug-{}", mark.name_suffix())
}

/// Patch appending the subset, and the patch removing it again.
pub fn destination_rule_patches(dr: &Value, mark: &VersionMark) -> MeshResult<(Value, Value)> {
    let name = entry_name(mark);
    let subset = json!({"name": name, "labels": {mark.key.as_str(): mark.value}});

    match dr.pointer("/spec/subsets") {
        None | Some(Value::Null) => Ok((
            json!([{"op": "add", "path": "/spec/subsets", "value": [subset]}]),
            json!([
                {"op": "test", "path": "/spec/subsets/0/name", "value": name},
                {"op": "remove", "path": "/spec/subsets"}
            ]),
        )),
        Some(Value::Array(subsets)) => {
            let taken = subsets
                .iter()
                .any(|s| s.get("name").and_then(Value::as_str) == Some(name.as_str()));
            if taken {
                let message = format!("subset {} already exists", name);
                return Err(invalid(DESTINATION_RULE, dr, message));
            }
            let index = subsets.len();
            Ok((
                json!([{"op": "add", "path": "/spec/subsets/-", "value": subset}]),
                json!([
                    {"op": "test", "path": format!("/spec/subsets/{}/name", index), "value": name},
                    {"op": "remove", "path": format!("/spec/subsets/{}", index)}
                ]),
            ))
        }
        Some(_) => Err(invalid(DESTINATION_RULE, dr, "spec.subsets is not a list".to_string())),
    }
}

/// Patch prepending the header route, and the patch removing it again.
pub fn virtual_service_patches(
    vs: &Value,
    mark: &VersionMark,
    default_host: &str,
) -> MeshResult<(Value, Value)> {
    let name = entry_name(mark);
    let host = vs
        .pointer("/spec/http/0/route/0/destination/host")
        .and_then(Value::as_str)
        .unwrap_or(default_host);
    let route = json!({
        "name": name,
        "match": [{"headers": {mark.key.as_str(): {"exact": mark.value}}}],
        "route": [{"destination": {"host": host, "subset": name}}]
    });
    let undo = json!([
        {"op": "test", "path": "/spec/http/0/name", "value": name},
        {"op": "remove", "path": "/spec/http/0"}
    ]);

    match vs.pointer("/spec/http") {
        None | Some(Value::Null) => Ok((
            json!([{"op": "add", "path": "/spec/http", "value": [route]}]),
            undo,
        )),
        Some(Value::Array(_)) => Ok((
            json!([{"op": "add", "path": "/spec/http/0", "value": route}]),
            undo,
        )),
        Some(_) => Err(invalid(VIRTUAL_SERVICE, vs, "spec.http is not a list".to_string())),
    }
}

fn invalid(kind: &str, resource: &Value, message: String) -> MeshError {
    MeshError::InvalidResource {
        kind: kind.to_string(),
        name: resource
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .to_string(),
        message,
    }
}

/// Configure manual mesh.
pub fn configure(
    vs_name: Option<&str>,
    dr_name: Option<&str>,
    ctx: &MeshContext<'_>,
) -> MeshResult<ConfiguredMesh> {
    let service = ctx.service;
    let namespace = service.namespace.as_str();
    let vs_name = vs_name.unwrap_or(&service.name);
    let dr_name = dr_name.unwrap_or(&service.name);
    let mark = &ctx.mesh.version_mark;

    // Fetch both first so a missing resource fails before anything changes.
    let dr = ctx.kubectl.get_json(DESTINATION_RULE, dr_name, namespace)?;
    let vs = ctx.kubectl.get_json(VIRTUAL_SERVICE, vs_name, namespace)?;
    let (dr_patch, dr_undo) = destination_rule_patches(&dr, mark)?;
    let (vs_patch, vs_undo) = virtual_service_patches(&vs, mark, &service.name)?;

    let (_, processes) = open_mesh_shadow(ctx, &service.selector)?;

    ctx.kubectl
        .patch(DESTINATION_RULE, dr_name, namespace, PatchType::Json, &dr_patch)?;
    ctx.ledger.record(UndoStep::Patch {
        kind: DESTINATION_RULE.to_string(),
        name: dr_name.to_string(),
        namespace: namespace.to_string(),
        patch_type: PatchType::Json,
        patch: dr_undo,
    });

    ctx.kubectl
        .patch(VIRTUAL_SERVICE, vs_name, namespace, PatchType::Json, &vs_patch)?;
    ctx.ledger.record(UndoStep::Patch {
        kind: VIRTUAL_SERVICE.to_string(),
        name: vs_name.to_string(),
        namespace: namespace.to_string(),
        patch_type: PatchType::Json,
        patch: vs_undo,
    });

    info!(
        "Added subset and route {} to {}/{} and {}/{}",
        entry_name(mark),
        namespace,
        dr_name,
        namespace,
        vs_name
    );
    Ok(ConfiguredMesh { processes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark() -> VersionMark {
        "mark:local".parse().unwrap()
    }

    #[test]
    fn test_destination_rule_append() {
        let dr = json!({
            "metadata": {"name": "tomcat"},
            "spec": {"host": "tomcat", "subsets": [{"name": "v1", "labels": {"version": "v1"}}]}
        });
        let (patch, undo) = destination_rule_patches(&dr, &mark()).unwrap();

        assert_eq!(patch[0]["op"], "add");
        assert_eq!(patch[0]["path"], "/spec/subsets/-");
        assert_eq!(patch[0]["value"]["name"], "kt-meshdebug-local");
        assert_eq!(patch[0]["value"]["labels"]["mark"], "local");

        assert_eq!(undo[0]["op"], "test");
        assert_eq!(undo[0]["path"], "/spec/subsets/1/name");
        assert_eq!(undo[1]["path"], "/spec/subsets/1");
    }

    #[test]
    fn test_destination_rule_without_subsets() {
        let dr = json!({"metadata": {"name": "tomcat"}, "spec": {"host": "tomcat"}});
        let (patch, undo) = destination_rule_patches(&dr, &mark()).unwrap();
        assert_eq!(patch[0]["path"], "/spec/subsets");
        assert_eq!(undo[1]["path"], "/spec/subsets");
    }

    #[test]
    fn test_destination_rule_duplicate_subset() {
        let dr = json!({
            "metadata": {"name": "tomcat"},
            "spec": {"subsets": [{"name": "kt-meshdebug-local"}]}
        });
        assert!(matches!(
            destination_rule_patches(&dr, &mark()),
            Err(MeshError::InvalidResource { .. })
        ));
    }

    #[test]
    fn test_virtual_service_prepend() {
        let vs = json!({
            "metadata": {"name": "tomcat"},
            "spec": {"http": [{"route": [{"destination": {
                "host": "tomcat.dev.svc.cluster.local",
                "subset": "v1"
            }}]}]}
        });
        let (patch, undo) = virtual_service_patches(&vs, &mark(), "tomcat").unwrap();

        assert_eq!(patch[0]["path"], "/spec/http/0");
        let route = &patch[0]["value"];
        assert_eq!(route["match"][0]["headers"]["mark"]["exact"], "local");
        assert_eq!(
            route["route"][0]["destination"]["host"],
            "tomcat.dev.svc.cluster.local"
        );
        assert_eq!(route["route"][0]["destination"]["subset"], "kt-meshdebug-local");
        assert_eq!(undo[0]["value"], "kt-meshdebug-local");
        assert_eq!(undo[1]["op"], "remove");
    }

    #[test]
    fn test_virtual_service_without_routes_uses_service_host() {
        let vs = json!({"metadata": {"name": "tomcat"}, "spec": {"hosts": ["tomcat"]}});
        let (patch, _) = virtual_service_patches(&vs, &mark(), "tomcat").unwrap();
        assert_eq!(patch[0]["path"], "/spec/http");
        assert_eq!(patch[0]["value"][0]["route"][0]["destination"]["host"], "tomcat");
    }

    #[test]
    fn test_virtual_service_bad_shape() {
        let vs = json!({"metadata": {"name": "tomcat"}, "spec": {"http": "nope"}});
        assert!(virtual_service_patches(&vs, &mark(), "tomcat").is_err());
    }
}
