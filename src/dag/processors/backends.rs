use k8s_openapi::api::core::v1::Service;
use thiserror::Error;

use crate::{common::NamespacedName, dag::Cluster, state::Objects};

const EXTERNAL_NAME_TYPE: &str = "ExternalName";
const UPSTREAM_PROTOCOL_ANNOTATION: &str = "projectcontour.io/upstream-protocol.";
const UPSTREAM_PROTOCOLS: [&str; 3] = ["h2", "h2c", "tls"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("service {0} not found")]
    ServiceNotFound(NamespacedName),
    #[error("service {0} has no port {1}")]
    PortNotFound(NamespacedName, i32),
}

/// Resolves a service reference to a cluster carrying the service level settings. The
/// caller adds route level settings and names the cluster.
pub fn resolve_backend(objects: &Objects, service: &NamespacedName, port: i32) -> Result<Cluster, BackendError> {
    let found = objects.services.get(service).ok_or_else(|| BackendError::ServiceNotFound(service.clone()))?;
    let spec = found.spec.as_ref();
    let external_name = spec
        .filter(|spec| spec.type_.as_deref() == Some(EXTERNAL_NAME_TYPE))
        .and_then(|spec| spec.external_name.clone());
    let ports = spec.and_then(|spec| spec.ports.as_ref());
    let port_name = ports.and_then(|ports| ports.iter().find(|p| p.port == port)).map(|p| p.name.clone().unwrap_or_default());
    if port_name.is_none() && external_name.is_none() {
        return Err(BackendError::PortNotFound(service.clone(), port));
    }

    let mut cluster = Cluster::new(service.clone(), port);
    cluster.external_name = external_name;
    cluster.protocol = upstream_protocol(found, port, port_name.as_deref());
    Ok(cluster)
}

/// Protocol annotations list the ports (by number or name) that speak a protocol.
fn upstream_protocol(service: &Service, port: i32, port_name: Option<&str>) -> Option<String> {
    let annotations = service.metadata.annotations.as_ref()?;
    let port_number = port.to_string();
    UPSTREAM_PROTOCOLS
        .iter()
        .find(|protocol| {
            annotations
                .get(&format!("{UPSTREAM_PROTOCOL_ANNOTATION}{protocol}"))
                .is_some_and(|ports| {
                    ports
                        .split(',')
                        .map(str::trim)
                        .any(|p| p == port_number || port_name.is_some_and(|name| !name.is_empty() && p == name))
                })
        })
        .map(|protocol| (*protocol).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::test_support::{objects_from_yaml, service};

    #[test]
    fn missing_service_and_port() {
        let mut objects = Objects::default();
        objects.insert(service("team-a", "web", &[80]));
        let web = NamespacedName::new("team-a", "web");
        assert!(resolve_backend(&objects, &web, 80).is_ok());
        assert_eq!(resolve_backend(&objects, &web, 81), Err(BackendError::PortNotFound(web.clone(), 81)));
        let missing = NamespacedName::new("team-a", "missing");
        assert_eq!(resolve_backend(&objects, &missing, 80), Err(BackendError::ServiceNotFound(missing.clone())));
    }

    #[test]
    fn protocol_annotation() {
        let objects = objects_from_yaml(
            r#"
kind: Service
metadata:
  name: grpc
  namespace: team-a
  annotations:
    projectcontour.io/upstream-protocol.h2c: "8080,admin"
spec:
  ports:
    - name: admin
      port: 9000
    - name: grpc
      port: 8080
    - name: plain
      port: 80
"#,
        );
        let grpc = NamespacedName::new("team-a", "grpc");
        assert_eq!(resolve_backend(&objects, &grpc, 8080).unwrap().protocol.as_deref(), Some("h2c"));
        assert_eq!(resolve_backend(&objects, &grpc, 9000).unwrap().protocol.as_deref(), Some("h2c"));
        assert_eq!(resolve_backend(&objects, &grpc, 80).unwrap().protocol, None);
    }

    #[test]
    fn external_name_service() {
        let objects = objects_from_yaml(
            r"
kind: Service
metadata:
  name: external
  namespace: team-a
spec:
  type: ExternalName
  externalName: api.example.org
",
        );
        let cluster = resolve_backend(&objects, &NamespacedName::new("team-a", "external"), 443).unwrap();
        assert_eq!(cluster.external_name.as_deref(), Some("api.example.org"));
    }
}
