//! Gateway API: GatewayClasses naming this controller, their Gateways and the routes that
//! attach to them.

mod attachment;
mod listeners;
mod routes;

use std::collections::{BTreeMap, BTreeSet};

pub use listeners::{ListenerError, ProtocolType};
use gateway_api::apis::standard::gateways::Gateway;
use listeners::{detect_conflicts, resolve_listener, PortClaims, ResolvedListener};
use tracing::{debug, info_span};

use super::{BuildContext, Processor};
use crate::{
    common::{creation_timestamp, reason, ConditionSet, ErrorKind, NamespacedName, ResourceKey, Scope},
    dag::{
        conflict::{tie_break, Origin, Schema},
        fragment::Fragment,
        status::ListenerState,
    },
};

/// A managed Gateway with its validated listeners. Listeners that failed validation outright
/// only exist as status.
pub struct ResolvedGateway {
    pub key: ResourceKey,
    pub name: NamespacedName,
    pub listeners: Vec<ResolvedListener>,
    rejected: BTreeMap<String, ListenerState>,
}

#[derive(Default)]
pub struct GatewayProcessor;

impl GatewayProcessor {
    fn resolve_gateway(ctx: &mut BuildContext<'_>, gateway: &Gateway, ports: &mut PortClaims, fragment: &mut Fragment) -> ResolvedGateway {
        let key = ctx.status.touch(gateway).key.clone();
        let name = key.namespaced_name();
        let mut listeners = vec![];
        let mut rejected = BTreeMap::new();
        for listener in &gateway.spec.listeners {
            match resolve_listener(ctx, &name.namespace, listener, fragment) {
                Ok(resolved) => listeners.push(resolved),
                Err(e) => {
                    debug!("Listener {} of gateway {name} rejected: {e}", listener.name);
                    let mut conditions = ConditionSet::default();
                    e.record(&mut conditions);
                    rejected.insert(
                        listener.name.clone(),
                        ListenerState {
                            conditions,
                            ..Default::default()
                        },
                    );
                },
            }
        }
        detect_conflicts(&mut listeners);
        ports.claim(&name, &mut listeners);

        for listener in listeners.iter().filter(|listener| listener.is_ready()) {
            fragment.declare_listener(listener.decl.clone());
        }
        if !gateway.spec.listeners.is_empty() && !listeners.iter().any(ResolvedListener::is_ready) {
            ctx.status
                .entry(&key)
                .conditions
                .record(ErrorKind::InvalidShape, Scope::Object, reason::LISTENERS_NOT_VALID, "no listener of this Gateway is valid");
        }
        ResolvedGateway {
            key,
            name,
            listeners,
            rejected,
        }
    }

    fn write_listener_status(ctx: &mut BuildContext<'_>, gateway: ResolvedGateway) {
        let status = ctx.status.entry(&gateway.key);
        status.listeners = gateway.rejected;
        for listener in gateway.listeners {
            status.listeners.insert(
                listener.name,
                ListenerState {
                    attached_routes: listener.attached_routes,
                    supported_kinds: listener.supported_kinds,
                    conditions: listener.conditions,
                },
            );
        }
    }
}

impl Processor for GatewayProcessor {
    fn name(&self) -> &'static str {
        "gateway"
    }

    fn process(&self, ctx: &mut BuildContext<'_>) -> Fragment {
        let _span = info_span!("GatewayProcessor").entered();
        let objects = ctx.objects;
        let mut fragment = Fragment::default();

        let mut classes = BTreeSet::new();
        for class in objects.gateway_classes.values() {
            if class.spec.controller_name == ctx.config.controller_name {
                ctx.status.touch(class);
                classes.insert(class.metadata.name.clone().unwrap_or_default());
            }
        }

        // Older Gateways claim their ports first.
        let mut managed: Vec<(Origin, &Gateway)> = objects
            .gateways
            .values()
            .filter(|gateway| classes.contains(&gateway.spec.gateway_class_name))
            .map(|gateway| (Origin::new(ResourceKey::from_resource(gateway), Schema::GatewayApi, creation_timestamp(gateway)), gateway))
            .collect();
        managed.sort_by(|(a, _), (b, _)| tie_break(a, b));

        let mut ports = PortClaims::new(ctx.config);
        let mut gateways = BTreeMap::new();
        for (_, gateway) in managed {
            let resolved = Self::resolve_gateway(ctx, gateway, &mut ports, &mut fragment);
            gateways.insert(resolved.name.clone(), resolved);
        }
        if gateways.is_empty() {
            return fragment;
        }

        for route in objects.http_routes.values() {
            routes::http_route(ctx, &mut gateways, route, &mut fragment);
        }
        for route in objects.grpc_routes.values() {
            routes::grpc_route(ctx, &mut gateways, route, &mut fragment);
        }
        for route in objects.tls_routes.values() {
            routes::tls_route(ctx, &mut gateways, route, &mut fragment);
        }
        for route in objects.tcp_routes.values() {
            routes::tcp_route(ctx, &mut gateways, route, &mut fragment);
        }

        for gateway in gateways.into_values() {
            Self::write_listener_status(ctx, gateway);
        }
        fragment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::{ParentReference, GATEWAY_GROUP_NAME},
        configuration::DagConfiguration,
        dag::{
            matching::{PathMatch, StringMatch},
            test_support::{add_yaml, objects_from_yaml, tls_secret},
            DirectResponse, RouteAction,
        },
        state::Objects,
    };

    const GATEWAY: &str = r"
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
kind: GatewayClass
metadata:
  name: other
spec:
  controllerName: example.com/other
---
kind: Gateway
metadata:
  name: public
  namespace: infra
spec:
  gatewayClassName: contour
  listeners:
    - name: http
      port: 80
      protocol: HTTP
      allowedRoutes:
        namespaces:
          from: All
---
kind: Gateway
metadata:
  name: foreign
  namespace: infra
spec:
  gatewayClassName: other
  listeners:
    - name: http
      port: 80
      protocol: HTTP
---
kind: Service
metadata:
  name: web
  namespace: team-a
spec:
  ports:
    - port: 80
";

    fn process(objects: &Objects) -> (Fragment, BTreeMap<ResourceKey, crate::dag::status::ObjectStatus>) {
        let config = DagConfiguration::default();
        let mut ctx = BuildContext::new(objects, &config);
        let fragment = GatewayProcessor.process(&mut ctx);
        (fragment, ctx.status.into_statuses())
    }

    /// Parent references as written in the fixtures, which leave group and kind out.
    fn parent(namespace: Option<&str>, section: Option<&str>) -> ParentReference {
        ParentReference {
            group: None,
            kind: None,
            namespace: namespace.map(str::to_owned),
            name: "public".to_owned(),
            section_name: section.map(str::to_owned),
            port: None,
        }
    }

    fn key(kind: &str, namespace: &str, name: &str) -> ResourceKey {
        ResourceKey::new(GATEWAY_GROUP_NAME, kind, namespace, name)
    }

    #[test]
    fn http_route_attaches() {
        let mut objects = objects_from_yaml(GATEWAY);
        add_yaml(
            &mut objects,
            r"
kind: HTTPRoute
metadata:
  name: web
  namespace: team-a
spec:
  parentRefs:
    - name: public
      namespace: infra
  hostnames: [web.example.com]
  rules:
    - matches:
        - path: {type: PathPrefix, value: /app}
          method: GET
          headers:
            - {name: X-Canary, value: 'true'}
      backendRefs:
        - name: web
          port: 80
      filters:
        - type: RequestHeaderModifier
          requestHeaderModifier:
            set: [{name: X-Env, value: prod}]
",
        );
        let (fragment, statuses) = process(&objects);

        assert_eq!(fragment.listeners.len(), 1);
        assert_eq!(fragment.listeners[0].name, "http-80");
        assert_eq!(fragment.virtual_hosts.len(), 1);
        let vhost = &fragment.virtual_hosts[0];
        assert_eq!(vhost.hostname, "web.example.com");
        assert_eq!(vhost.routes.len(), 1);
        let route = &vhost.routes[0];
        assert_eq!(route.route_match.path, PathMatch::segment("/app"));
        assert_eq!(route.route_match.method.as_deref(), Some("GET"));
        assert_eq!(route.route_match.headers[0].name, "x-canary");
        assert_eq!(route.policies.request_headers.set.get("x-env").map(String::as_str), Some("prod"));
        assert_eq!(route.action.clusters().collect::<Vec<_>>(), vec!["team-a/web/80"]);
        assert_eq!(route.origin.parent, Some(parent(Some("infra"), None)));

        assert!(statuses.contains_key(&key("GatewayClass", "", "contour")));
        assert!(!statuses.contains_key(&key("GatewayClass", "", "other")));
        assert!(!statuses.contains_key(&key("Gateway", "infra", "foreign")));
        let gateway = &statuses[&key("Gateway", "infra", "public")];
        assert_eq!(gateway.listeners["http"].attached_routes, 1);
        assert_eq!(gateway.listeners["http"].supported_kinds.len(), 2);
        let route_status = &statuses[&key("HTTPRoute", "team-a", "web")];
        assert!(route_status.is_accepted());
        assert!(route_status.parents[&parent(Some("infra"), None)].is_clean());
    }

    #[test]
    fn listener_hostname_isolation() {
        let objects = objects_from_yaml(
            r"
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
kind: Gateway
metadata:
  name: public
  namespace: default
spec:
  gatewayClassName: contour
  listeners:
    - {name: wildcard, port: 80, protocol: HTTP, hostname: '*.example.com'}
    - {name: foo, port: 80, protocol: HTTP, hostname: foo.example.com}
---
kind: HTTPRoute
metadata:
  name: both
  namespace: default
spec:
  parentRefs: [{name: public}]
  hostnames: [foo.example.com, bar.example.com]
  rules:
    - backendRefs: [{name: web, port: 80}]
---
kind: Service
metadata:
  name: web
  namespace: default
spec:
  ports: [{port: 80}]
",
        );
        let (fragment, statuses) = process(&objects);
        let mut hosts: Vec<_> = fragment.virtual_hosts.iter().map(|vhost| vhost.hostname.as_str()).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["bar.example.com", "foo.example.com"]);
        let gateway = &statuses[&key("Gateway", "default", "public")];
        assert_eq!(gateway.listeners["wildcard"].attached_routes, 1);
        assert_eq!(gateway.listeners["foo"].attached_routes, 1);
    }

    #[test]
    fn cross_namespace_backend_needs_grant() {
        let route = r"
kind: HTTPRoute
metadata:
  name: web
  namespace: infra
spec:
  parentRefs: [{name: public}]
  rules:
    - backendRefs: [{name: web, namespace: team-a, port: 80}]
";
        let mut objects = objects_from_yaml(GATEWAY);
        add_yaml(&mut objects, route);
        let (fragment, statuses) = process(&objects);
        let action = &fragment.virtual_hosts[0].routes[0].action;
        assert_eq!(action, &RouteAction::DirectResponse(DirectResponse { status_code: 500, body: None }));
        let conditions = &statuses[&key("HTTPRoute", "infra", "web")].parents[&parent(None, None)];
        assert!(conditions.has_reason(reason::REF_NOT_PERMITTED));
        assert!(!conditions.resolved_refs().status);
        assert!(conditions.accepted(reason::ACCEPTED).status);

        add_yaml(
            &mut objects,
            r"
kind: ReferenceGrant
metadata:
  name: routes
  namespace: team-a
spec:
  from: [{group: gateway.networking.k8s.io, kind: HTTPRoute, namespace: infra}]
  to: [{group: '', kind: Service}]
",
        );
        let (fragment, _) = process(&objects);
        assert_eq!(fragment.virtual_hosts[0].routes[0].action.clusters().collect::<Vec<_>>(), vec!["team-a/web/80"]);
    }

    #[test]
    fn unsupported_match_drops_rule() {
        let mut objects = objects_from_yaml(GATEWAY);
        add_yaml(
            &mut objects,
            r"
kind: HTTPRoute
metadata:
  name: web
  namespace: team-a
spec:
  parentRefs: [{name: public, namespace: infra}]
  rules:
    - matches:
        - path: {type: Exact, value: app}
      backendRefs: [{name: web, port: 80}]
    - matches:
        - queryParams: [{type: RegularExpression, name: page, value: '[0-9]+'}]
      backendRefs: [{name: web, port: 80}]
",
        );
        let (fragment, statuses) = process(&objects);
        let routes = &fragment.virtual_hosts[0].routes;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].origin.rule, 1);
        assert_eq!(routes[0].route_match.queries[0].matcher, StringMatch::Regex("[0-9]+".to_owned()));
        let conditions = &statuses[&key("HTTPRoute", "team-a", "web")].parents[&parent(Some("infra"), None)];
        assert!(conditions.has_reason(reason::UNSUPPORTED_VALUE));
        assert!(conditions.is_partial());
    }

    #[test]
    fn namespaces_and_section_names() {
        let objects = objects_from_yaml(
            r"
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
kind: Gateway
metadata:
  name: public
  namespace: infra
spec:
  gatewayClassName: contour
  listeners:
    - {name: http, port: 80, protocol: HTTP}
---
kind: HTTPRoute
metadata:
  name: other-namespace
  namespace: team-a
spec:
  parentRefs: [{name: public, namespace: infra}]
  rules: [{}]
---
kind: HTTPRoute
metadata:
  name: wrong-section
  namespace: infra
spec:
  parentRefs: [{name: public, sectionName: https}]
  rules: [{}]
---
kind: TCPRoute
metadata:
  name: wrong-kind
  namespace: infra
spec:
  parentRefs: [{name: public}]
  rules: [{backendRefs: [{name: web, port: 80}]}]
",
        );
        let (fragment, statuses) = process(&objects);
        assert!(fragment.virtual_hosts.is_empty());
        assert!(fragment.tcp.is_empty());
        let reason_of = |kind: &str, namespace: &str, name: &str, parent: ParentReference| {
            statuses[&key(kind, namespace, name)].parents[&parent].accepted(reason::ACCEPTED).reason
        };
        assert_eq!(
            reason_of("HTTPRoute", "team-a", "other-namespace", parent(Some("infra"), None)),
            reason::NOT_ALLOWED_BY_LISTENERS
        );
        assert_eq!(
            reason_of("HTTPRoute", "infra", "wrong-section", parent(None, Some("https"))),
            reason::NO_MATCHING_PARENT
        );
        let gateway = &statuses[&key("Gateway", "infra", "public")];
        assert_eq!(gateway.listeners["http"].attached_routes, 0);
    }

    #[test]
    fn grpc_method_paths() {
        let mut objects = objects_from_yaml(GATEWAY);
        add_yaml(
            &mut objects,
            r"
kind: GRPCRoute
metadata:
  name: greeter
  namespace: team-a
spec:
  parentRefs: [{name: public, namespace: infra}]
  hostnames: [grpc.example.com]
  rules:
    - matches:
        - method: {service: helloworld.Greeter, method: SayHello}
        - method: {service: helloworld.Admin}
        - method: {method: Health}
      backendRefs: [{name: web, port: 80}]
",
        );
        let (fragment, _) = process(&objects);
        let paths: Vec<_> = fragment.virtual_hosts[0].routes.iter().map(|route| route.route_match.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathMatch::Exact("/helloworld.Greeter/SayHello".to_owned()),
                PathMatch::segment("/helloworld.Admin/"),
                PathMatch::Regex("/[^/]+/Health".to_owned()),
            ]
        );
        let cluster = fragment.clusters.values().next().unwrap();
        assert_eq!(cluster.protocol.as_deref(), Some("h2c"));
    }

    #[test]
    fn https_and_passthrough_listeners() {
        let mut objects = objects_from_yaml(
            r"
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
kind: Gateway
metadata:
  name: public
  namespace: default
spec:
  gatewayClassName: contour
  listeners:
    - name: https
      port: 8443
      protocol: HTTPS
      hostname: secure.example.com
      tls:
        certificateRefs: [{name: cert}]
    - name: passthrough
      port: 8443
      protocol: TLS
      hostname: tls.example.com
      tls:
        mode: Passthrough
    - name: broken
      port: 9443
      protocol: HTTPS
      tls:
        mode: Passthrough
---
kind: TLSRoute
metadata:
  name: db
  namespace: default
spec:
  parentRefs: [{name: public, sectionName: passthrough}]
  rules:
    - backendRefs: [{name: db, port: 5432}]
---
kind: Service
metadata:
  name: db
  namespace: default
spec:
  ports: [{port: 5432}]
",
        );
        objects.insert(tls_secret("default", "cert"));
        let (fragment, statuses) = process(&objects);

        assert_eq!(fragment.listeners.len(), 1);
        assert_eq!(fragment.listeners[0].name, "ingress_https");
        assert!(fragment.secrets.contains_key("default/cert"));
        let vhost = fragment.virtual_hosts.iter().find(|vhost| vhost.hostname == "tls.example.com").unwrap();
        assert!(vhost.tls.as_ref().is_some_and(|tls| tls.passthrough));
        assert_eq!(vhost.tcp_proxy.as_ref().map(|proxy| proxy.clusters.len()), Some(1));

        let gateway = &statuses[&key("Gateway", "default", "public")];
        assert!(gateway.conditions.is_clean());
        let broken = &gateway.listeners["broken"];
        assert_eq!(broken.conditions.accepted(reason::ACCEPTED).reason, reason::UNSUPPORTED_TLS_MODE);
        assert!(broken.supported_kinds.is_empty());
        assert_eq!(gateway.listeners["passthrough"].attached_routes, 1);
    }

    #[test]
    fn protocol_conflict_rejects_gateway() {
        let objects = objects_from_yaml(
            r"
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
kind: Gateway
metadata:
  name: public
  namespace: default
spec:
  gatewayClassName: contour
  listeners:
    - {name: http, port: 80, protocol: HTTP}
    - {name: tcp, port: 80, protocol: TCP}
",
        );
        let (fragment, statuses) = process(&objects);
        assert!(fragment.listeners.is_empty());
        let gateway = &statuses[&key("Gateway", "default", "public")];
        assert!(gateway.conditions.has_reason(reason::LISTENERS_NOT_VALID));
        assert!(gateway.listeners.values().all(|listener| listener.conditions.is_conflicted()));
    }

    fn port_sharing_gateways(a_created: &str, b_created: &str) -> Objects {
        objects_from_yaml(&format!(
            r"
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
kind: Gateway
metadata:
  name: a
  namespace: default
  creationTimestamp: '{a_created}'
spec:
  gatewayClassName: contour
  listeners:
    - {{name: web, port: 9000, protocol: HTTP}}
---
kind: Gateway
metadata:
  name: b
  namespace: default
  creationTimestamp: '{b_created}'
spec:
  gatewayClassName: contour
  listeners:
    - {{name: stream, port: 9000, protocol: TCP}}
"
        ))
    }

    #[test]
    fn port_conflict_across_gateways() {
        let (fragment, statuses) = process(&port_sharing_gateways("2024-01-01T00:00:00Z", "2024-06-01T00:00:00Z"));
        let names: Vec<_> = fragment.listeners.iter().map(|listener| listener.name.as_str()).collect();
        assert_eq!(names, vec!["http-9000"]);
        assert!(statuses[&key("Gateway", "default", "a")].listeners["web"].conditions.is_clean());
        let loser = &statuses[&key("Gateway", "default", "b")].listeners["stream"].conditions;
        assert!(loser.has_reason(reason::PROTOCOL_CONFLICT));
        assert!(!loser.programmed().status);

        let (fragment, statuses) = process(&port_sharing_gateways("2024-06-01T00:00:00Z", "2024-01-01T00:00:00Z"));
        let names: Vec<_> = fragment.listeners.iter().map(|listener| listener.name.as_str()).collect();
        assert_eq!(names, vec!["tcp-9000"]);
        assert!(statuses[&key("Gateway", "default", "a")].listeners["web"].conditions.has_reason(reason::PROTOCOL_CONFLICT));
    }

    #[test]
    fn configured_https_port_is_reserved() {
        let objects = objects_from_yaml(
            r"
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
kind: Gateway
metadata:
  name: public
  namespace: default
spec:
  gatewayClassName: contour
  listeners:
    - {name: plain, port: 8443, protocol: HTTP}
    - {name: web, port: 9000, protocol: HTTP}
",
        );
        let (fragment, statuses) = process(&objects);
        let names: Vec<_> = fragment.listeners.iter().map(|listener| listener.name.as_str()).collect();
        assert_eq!(names, vec!["http-9000"]);
        let gateway = &statuses[&key("Gateway", "default", "public")];
        let plain = &gateway.listeners["plain"].conditions;
        assert!(plain.has_reason(reason::PROTOCOL_CONFLICT));
        assert!(!plain.programmed().status);
        assert!(gateway.listeners["web"].conditions.is_clean());
    }

    #[test]
    fn tcp_route() {
        let objects = objects_from_yaml(
            r"
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
kind: Gateway
metadata:
  name: public
  namespace: default
spec:
  gatewayClassName: contour
  listeners:
    - {name: postgres, port: 5432, protocol: TCP}
---
kind: TCPRoute
metadata:
  name: db
  namespace: default
spec:
  parentRefs: [{name: public}]
  rules:
    - backendRefs: [{name: db, port: 5432}, {name: missing, port: 5432}]
---
kind: Service
metadata:
  name: db
  namespace: default
spec:
  ports: [{port: 5432}]
",
        );
        let (fragment, statuses) = process(&objects);
        assert_eq!(fragment.tcp.len(), 1);
        assert_eq!(fragment.tcp[0].listener, "tcp-5432");
        assert_eq!(fragment.tcp[0].proxy.clusters.len(), 1);
        let route = &statuses[&key("TCPRoute", "default", "db")];
        assert!(route.is_accepted());
        assert!(route.parents.values().all(|parent| parent.has_reason(reason::BACKEND_NOT_FOUND)));
    }
}
