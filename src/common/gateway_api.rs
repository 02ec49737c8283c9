//! Helpers over the generated Gateway API types.

use gateway_api::apis::{
    experimental::{tcproutes::TCPRouteParentRefs, tlsroutes::TLSRouteParentRefs},
    standard::{
        grpcroutes::GRPCRouteParentRefs,
        httproutes::{HTTPRouteParentRefs, HTTPRouteStatusParentsParentRef},
    },
};
use serde::Serialize;

/// Most lists in the generated types are optional; an absent list reads as an empty one.
pub trait Listed<T> {
    fn listed(&self) -> &[T];
}

impl<T> Listed<T> for Vec<T> {
    fn listed(&self) -> &[T] {
        self
    }
}

impl<T> Listed<T> for Option<Vec<T>> {
    fn listed(&self) -> &[T] {
        self.as_deref().unwrap_or_default()
    }
}

/// The value a generated enum takes on the wire, e.g. `GET` for an HTTP method match.
pub fn wire_name<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => Some(name),
        _ => None,
    }
}

/// A route's parent reference, whichever route kind it came from. Ordered so route status
/// can be kept per parent.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    pub group: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
    pub section_name: Option<String>,
    pub port: Option<i32>,
}

macro_rules! parent_reference {
    ($($parent:ty),*) => {
        $(
            impl From<&$parent> for ParentReference {
                fn from(parent: &$parent) -> Self {
                    Self {
                        group: parent.group.clone(),
                        kind: parent.kind.clone(),
                        namespace: parent.namespace.clone(),
                        name: parent.name.clone(),
                        section_name: parent.section_name.clone(),
                        port: parent.port,
                    }
                }
            }
        )*
    };
}

parent_reference!(HTTPRouteParentRefs, GRPCRouteParentRefs, TLSRouteParentRefs, TCPRouteParentRefs);

impl From<&ParentReference> for HTTPRouteStatusParentsParentRef {
    fn from(parent: &ParentReference) -> Self {
        Self {
            group: parent.group.clone(),
            kind: parent.kind.clone(),
            namespace: parent.namespace.clone(),
            name: parent.name.clone(),
            section_name: parent.section_name.clone(),
            port: parent.port,
        }
    }
}
