use std::fmt::Display;

use k8s_openapi::chrono::{DateTime, Utc};
use kube::Resource;
use serde::{Deserialize, Serialize};

pub const GATEWAY_GROUP_NAME: &str = "gateway.networking.k8s.io";
pub const CONTOUR_GROUP_NAME: &str = "projectcontour.io";
pub const CORE_GROUP_NAME: &str = "";
pub const DEFAULT_NAMESPACE_NAME: &str = "default";
pub const DEFAULT_ROUTE_HOSTNAME: &str = "*";

pub const GATEWAY_KIND: &str = "Gateway";
pub const SECRET_KIND: &str = "Secret";
pub const SERVICE_KIND: &str = "Service";

/// Namespace and name of an object, unique within one kind.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }

    /// Parses either `name` or `namespace/name`.
    pub fn parse(reference: &str, default_namespace: &str) -> Self {
        match reference.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() => Self::new(namespace, name),
            Some((_, name)) => Self::new(default_namespace, name),
            None => Self::new(default_namespace, reference),
        }
    }

    pub fn of<R: Resource>(resource: &R) -> Self {
        let meta = resource.meta();
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct ResourceKey {
    pub group: String,
    pub namespace: String,
    pub name: String,
    pub kind: String,
}

impl ResourceKey {
    pub fn new(group: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_owned(),
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            kind: kind.to_owned(),
        }
    }

    pub fn from_resource<R: Resource<DynamicType = ()>>(resource: &R) -> Self {
        let meta = resource.meta();
        Self {
            group: R::group(&()).into_owned(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: match (meta.name.as_ref(), meta.generate_name.as_ref()) {
                (Some(name), _) | (None, Some(name)) => name.clone(),
                (None, None) => String::new(),
            },
            kind: R::kind(&()).into_owned(),
        }
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.name)
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.namespaced_name())
    }
}

pub fn creation_timestamp<R: Resource>(resource: &R) -> Option<DateTime<Utc>> {
    resource.meta().creation_timestamp.as_ref().map(|time| time.0)
}
