use gateway_api::apis::standard::referencegrants::ReferenceGrant;

use crate::state::Objects;

/// One side of a cross namespace reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceFrom<'a> {
    pub group: &'a str,
    pub kind: &'a str,
    pub namespace: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceTo<'a> {
    pub group: &'a str,
    pub kind: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
}

/// Answers whether a ReferenceGrant in the target namespace permits a reference.
pub struct ReferenceGrants<'a> {
    objects: &'a Objects,
}

impl<'a> ReferenceGrants<'a> {
    pub fn new(objects: &'a Objects) -> Self {
        Self { objects }
    }

    pub fn allows(&self, from: ReferenceFrom<'_>, to: ReferenceTo<'_>) -> bool {
        if from.namespace == to.namespace {
            return true;
        }
        self.objects
            .reference_grants
            .values()
            .filter(|grant| grant.metadata.namespace.as_deref() == Some(to.namespace))
            .any(|grant| grants(grant, from, to))
    }
}

fn grants(grant: &ReferenceGrant, from: ReferenceFrom<'_>, to: ReferenceTo<'_>) -> bool {
    let from_matches = grant
        .spec
        .from
        .iter()
        .any(|f| f.group == from.group && f.kind == from.kind && f.namespace == from.namespace);
    let to_matches = grant
        .spec
        .to
        .iter()
        .any(|t| t.group == to.group && t.kind == to.kind && t.name.as_deref().is_none_or(|name| name == to.name));
    from_matches && to_matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::test_support::objects_from_yaml;

    const ROUTE: ReferenceFrom<'static> = ReferenceFrom {
        group: "gateway.networking.k8s.io",
        kind: "HTTPRoute",
        namespace: "team-a",
    };

    fn service(namespace: &'static str, name: &'static str) -> ReferenceTo<'static> {
        ReferenceTo {
            group: "",
            kind: "Service",
            namespace,
            name,
        }
    }

    #[test]
    fn grant_in_target_namespace() {
        let objects = objects_from_yaml(
            r"
kind: ReferenceGrant
metadata:
  name: allow-team-a
  namespace: backends
spec:
  from:
    - group: gateway.networking.k8s.io
      kind: HTTPRoute
      namespace: team-a
  to:
    - group: ''
      kind: Service
      name: web
",
        );
        let grants = ReferenceGrants::new(&objects);
        assert!(grants.allows(ROUTE, service("backends", "web")));
        assert!(!grants.allows(ROUTE, service("backends", "db")));
        assert!(!grants.allows(ReferenceFrom { namespace: "team-b", ..ROUTE }, service("backends", "web")));
        assert!(grants.allows(ROUTE, service("team-a", "anything")));
    }

    #[test]
    fn grant_in_wrong_namespace_is_ignored() {
        let objects = objects_from_yaml(
            r"
kind: ReferenceGrant
metadata:
  name: misplaced
  namespace: team-a
spec:
  from:
    - group: gateway.networking.k8s.io
      kind: HTTPRoute
      namespace: team-a
  to:
    - group: ''
      kind: Service
",
        );
        assert!(!ReferenceGrants::new(&objects).allows(ROUTE, service("backends", "web")));
    }
}
