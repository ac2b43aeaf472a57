//! Resolving a user-supplied resource name into a service descriptor.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, warn};

use super::error::{ClusterError, ClusterResult};
use super::kubectl::Kubectl;

/// A port declared by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    /// Port name, if any.
    pub name: Option<String>,
    /// Port the service listens on.
    pub port: u16,
    /// Numeric target port on the pods.
    pub target_port: u16,
    /// Protocol (TCP unless stated).
    pub protocol: String,
}

/// Immutable snapshot of the service being meshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service name.
    pub name: String,
    /// Service namespace.
    pub namespace: String,
    /// Pod selector.
    pub selector: BTreeMap<String, String>,
    /// Declared ports with numeric target ports.
    pub ports: Vec<ServicePort>,
}

impl ServiceDescriptor {
    /// The set of declared numeric target ports.
    pub fn target_ports(&self) -> BTreeSet<u16> {
        self.ports.iter().map(|p| p.target_port).collect()
    }

    /// Build a descriptor from a `kubectl get service -o json` object.
    ///
    /// Named target ports cannot be resolved without a pod and are skipped.
    /// A missing target port defaults to the service port.
    pub fn from_json(service: &Value) -> ClusterResult<Self> {
        let invalid = |message: &str| ClusterError::InvalidResponse {
            cmd: "kubectl get service".to_string(),
            message: message.to_string(),
        };

        let metadata = service.get("metadata").ok_or_else(|| invalid("missing metadata"))?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing metadata.name"))?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        let spec = service.get("spec").ok_or_else(|| invalid("missing spec"))?;
        let selector = string_map(spec.get("selector"));

        let mut ports = Vec::new();
        for entry in spec.get("ports").and_then(Value::as_array).into_iter().flatten() {
            let Some(port) = entry.get("port").and_then(as_port) else {
                warn!("Skipping service port without a valid number in {}", name);
                continue;
            };
            let target_port = match entry.get("targetPort") {
                None => port,
                Some(target) => match as_port(target) {
                    Some(p) => p,
                    None => {
                        debug!("Skipping named target port {} of service {}", target, name);
                        continue;
                    }
                },
            };
            ports.push(ServicePort {
                name: entry.get("name").and_then(Value::as_str).map(str::to_string),
                port,
                target_port,
                protocol: entry
                    .get("protocol")
                    .and_then(Value::as_str)
                    .unwrap_or("TCP")
                    .to_string(),
            });
        }

        Ok(Self {
            name,
            namespace,
            selector,
            ports,
        })
    }

    /// Whether this service's selector picks pods carrying `labels`.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
    }
}

/// Number or numeric string as a port.
fn as_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse::<u16>().ok(),
        _ => None,
    };
    port.filter(|p| *p != 0)
}

/// Read a JSON object of strings into an ordered map.
pub(crate) fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Kind part of a `kind/name` resource reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A service, referenced directly.
    Service,
    /// A deployment, resolved to the service selecting its pods.
    Deployment,
}

/// A parsed resource reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
}

impl ResourceRef {
    /// Parse `name`, `svc/name`, `service/name` or `deployment/name`.
    pub fn parse(resource: &str) -> ClusterResult<Self> {
        let (kind, name) = match resource.split_once('/') {
            None => (ResourceKind::Service, resource),
            Some((kind, name)) => {
                let kind = match kind.to_ascii_lowercase().as_str() {
                    "svc" | "service" | "services" => ResourceKind::Service,
                    "deploy" | "deployment" | "deployments" => ResourceKind::Deployment,
                    _ => return Err(ClusterError::UnsupportedResource(kind.to_string())),
                };
                (kind, name)
            }
        };

        if name.is_empty() {
            return Err(ClusterError::UnsupportedResource(resource.to_string()));
        }

        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

/// Looks up the service a resource name refers to.
pub trait ServiceResolver: Send + Sync {
    /// Resolve `resource` in `namespace` into a service descriptor.
    fn resolve(&self, resource: &str, namespace: &str) -> ClusterResult<ServiceDescriptor>;
}

/// Resolver backed by `kubectl get`.
pub struct KubectlResolver {
    kubectl: Kubectl,
}

impl KubectlResolver {
    /// Create a resolver using the given kubectl context.
    pub fn new(kubectl: Kubectl) -> Self {
        Self { kubectl }
    }

    fn resolve_deployment(&self, name: &str, namespace: &str) -> ClusterResult<ServiceDescriptor> {
        let deployment = self.kubectl.get_json("deployment", name, namespace)?;
        let labels = string_map(deployment.pointer("/spec/template/metadata/labels"));

        let services = self.kubectl.list_json("service", Some(namespace), None)?;
        services
            .iter()
            .filter_map(|svc| ServiceDescriptor::from_json(svc).ok())
            .find(|svc| svc.selects(&labels))
            .ok_or_else(|| ClusterError::NoMatchingService {
                kind: "deployment".to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }
}

impl ServiceResolver for KubectlResolver {
    fn resolve(&self, resource: &str, namespace: &str) -> ClusterResult<ServiceDescriptor> {
        let reference = ResourceRef::parse(resource)?;
        let descriptor = match reference.kind {
            ResourceKind::Service => ServiceDescriptor::from_json(&self.kubectl.get_json(
                "service",
                &reference.name,
                namespace,
            )?)?,
            ResourceKind::Deployment => self.resolve_deployment(&reference.name, namespace)?,
        };
        debug!(
            "Resolved {} to service {}/{} with target ports {:?}",
            resource,
            descriptor.namespace,
            descriptor.name,
            descriptor.target_ports()
        );
        Ok(descriptor)
    }
}
