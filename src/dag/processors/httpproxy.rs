use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use tracing::debug;

use super::{check_regexes, class_matches, resolve_backend, BuildContext, Processor, Rejection};
use crate::{
    apis::httpproxy::{self, AuthorizationServer, HTTPProxy, TLS},
    common::{creation_timestamp, reason, ErrorKind, NamespacedName, ResourceKey, Scope},
    dag::{
        fragment::{Fragment, VirtualHostFragment},
        hostname,
        matching::{include_identity, merge_conditions, RouteMatch},
        policies, DirectResponse, ExternalAuthorization, Origin, PathRewrite, Redirect, Rewrite, Route, RouteAction,
        RoutePolicies, Schema, TcpProxy, UpstreamValidation, VirtualHostTls, WeightedCluster,
    },
};

const UPSTREAM_PROTOCOLS: [&str; 3] = ["h2", "h2c", "tls"];
const TLS_VERSIONS: [&str; 2] = ["1.2", "1.3"];

type Proxies<'a> = BTreeMap<NamespacedName, &'a HTTPProxy>;

/// Builds virtual hosts from root HTTPProxies by walking their include trees.
pub struct HttpProxyProcessor;

impl Processor for HttpProxyProcessor {
    fn name(&self) -> &'static str {
        "HTTPProxy"
    }

    fn process(&self, ctx: &mut BuildContext<'_>) -> Fragment {
        let objects = ctx.objects;
        let configured_class = ctx.config.ingress_class_name.as_deref();
        let proxies: Proxies<'_> = objects
            .proxies
            .iter()
            .filter(|(_, proxy)| class_matches(configured_class, *proxy, proxy.spec.ingress_class_name.as_deref()))
            .map(|(name, proxy)| (name.clone(), proxy))
            .collect();
        for proxy in proxies.values() {
            ctx.status.touch(*proxy);
        }

        let mut fragment = Fragment::default();
        let mut reached = BTreeSet::new();
        for (name, root) in claimed_roots(ctx, &proxies) {
            debug!("Building virtual host of HTTPProxy {name}");
            build_root(ctx, &proxies, root, &mut fragment, &mut reached);
        }

        for (name, proxy) in &proxies {
            if !proxy.is_root() && !reached.contains(name) {
                ctx.status.record(
                    &origin(proxy),
                    ErrorKind::Unreachable,
                    Scope::Object,
                    reason::ORPHANED,
                    "this HTTPProxy is not part of a delegation chain from a root HTTPProxy",
                );
            }
        }
        fragment
    }
}

fn origin(proxy: &HTTPProxy) -> Origin {
    Origin::new(ResourceKey::from_resource(proxy), Schema::HttpProxy, creation_timestamp(proxy))
}

fn namespace_of(proxy: &HTTPProxy) -> String {
    proxy.metadata.namespace.clone().unwrap_or_default()
}

/// Roots with a valid fqdn that no other root claims. Every claimant of a shared fqdn is
/// rejected.
fn claimed_roots<'a>(ctx: &mut BuildContext<'_>, proxies: &Proxies<'a>) -> Vec<(NamespacedName, &'a HTTPProxy)> {
    let mut claims: BTreeMap<String, Vec<(NamespacedName, &'a HTTPProxy)>> = BTreeMap::new();
    for (name, proxy) in proxies {
        let Some(vhost) = &proxy.spec.virtualhost else {
            continue;
        };
        let fqdn = vhost.fqdn.to_ascii_lowercase();
        if fqdn == "*" || !hostname::is_valid_hostname(&fqdn) {
            ctx.status.record(
                &origin(proxy),
                ErrorKind::InvalidShape,
                Scope::Object,
                reason::FQDN_NOT_VALID,
                format!("Spec.VirtualHost.Fqdn \"{}\" is not a valid hostname", vhost.fqdn),
            );
            continue;
        }
        claims.entry(fqdn).or_default().push((name.clone(), *proxy));
    }

    let mut roots = vec![];
    for (fqdn, claimants) in claims {
        if claimants.len() == 1 {
            roots.extend(claimants);
            continue;
        }
        let names = claimants.iter().map(|(name, _)| name.to_string()).join(", ");
        for (_, proxy) in &claimants {
            ctx.status.record(
                &origin(proxy),
                ErrorKind::Conflict,
                Scope::Object,
                reason::DUPLICATE_VHOST,
                format!("fqdn \"{fqdn}\" is used in multiple HTTPProxies: {names}"),
            );
        }
    }
    roots
}

fn build_root(ctx: &mut BuildContext<'_>, proxies: &Proxies<'_>, root: &HTTPProxy, fragment: &mut Fragment, reached: &mut BTreeSet<NamespacedName>) {
    let Some(vhost) = &root.spec.virtualhost else {
        return;
    };
    let root_origin = origin(root);
    let namespace = namespace_of(root);
    let fqdn = vhost.fqdn.to_ascii_lowercase();

    let settings = root_settings(ctx, &namespace, vhost, fragment);
    let (tls, authorization) = match settings {
        Ok(settings) => settings,
        Err(rejection) => {
            rejection.record(ctx, &root_origin, Scope::Object);
            return;
        },
    };

    if let Some(tcpproxy) = &root.spec.tcpproxy {
        let Some(tls) = tls else {
            Rejection::new(ErrorKind::InvalidShape, reason::TCP_PROXY_NOT_VALID, "tcpproxy requires TLS on the virtual host").record(
                ctx,
                &root_origin,
                Scope::Object,
            );
            return;
        };
        match tcp_proxy(ctx, proxies, &namespace, tcpproxy, fragment, reached) {
            Ok(proxy) => {
                let https = ctx.https_listener();
                let mut secure = VirtualHostFragment::new(&https.name, &fqdn, root_origin);
                secure.tls = Some(tls);
                secure.tcp_proxy = Some(proxy);
                fragment.declare_listener(https);
                fragment.virtual_hosts.push(secure);
            },
            Err(rejection) => rejection.record(ctx, &root_origin, Scope::Object),
        }
        return;
    }
    if tls.as_ref().is_some_and(|tls| tls.passthrough) {
        Rejection::new(ErrorKind::InvalidShape, reason::TCP_PROXY_NOT_VALID, "TLS passthrough requires a tcpproxy").record(ctx, &root_origin, Scope::Object);
        return;
    }

    let sort_routes = !(ctx.config.disable_route_sorting || vhost.disable_route_sorting.unwrap_or_default());
    let routes = walk_routes(ctx, proxies, root, vhost, fragment, reached);

    let http = ctx.http_listener();
    let mut insecure = VirtualHostFragment::new(&http.name, &fqdn, root_origin.clone());
    insecure.sort_routes = sort_routes;
    insecure.rate_limit.clone_from(&vhost.rate_limit_policy);
    fragment.declare_listener(http);

    match tls {
        Some(tls) => {
            insecure.routes = routes
                .iter()
                .map(|(route, permit_insecure)| {
                    if *permit_insecure {
                        Route {
                            policies: RoutePolicies {
                                authorization: None,
                                ..route.policies.clone()
                            },
                            ..route.clone()
                        }
                    } else {
                        Route {
                            action: RouteAction::Redirect(Redirect::to_https()),
                            policies: RoutePolicies::default(),
                            ..route.clone()
                        }
                    }
                })
                .collect();

            let https = ctx.https_listener();
            let mut secure = VirtualHostFragment::new(&https.name, &fqdn, root_origin);
            secure.tls = Some(tls);
            secure.rate_limit.clone_from(&vhost.rate_limit_policy);
            secure.authorization = authorization;
            secure.sort_routes = sort_routes;
            secure.routes = routes.into_iter().map(|(route, _)| route).collect();
            fragment.declare_listener(https);
            fragment.virtual_hosts.push(secure);
        },
        None => insecure.routes = routes.into_iter().map(|(route, _)| route).collect(),
    }
    fragment.virtual_hosts.push(insecure);
}

fn root_settings(
    ctx: &mut BuildContext<'_>,
    namespace: &str,
    vhost: &httpproxy::VirtualHost,
    fragment: &mut Fragment,
) -> Result<(Option<VirtualHostTls>, Option<ExternalAuthorization>), Rejection> {
    let tls = vhost.tls.as_ref().map(|tls| virtual_host_tls(ctx, namespace, tls, fragment)).transpose()?;
    if let Some(rate_limit) = &vhost.rate_limit_policy {
        policies::validate_rate_limit(rate_limit)?;
    }
    let authorization = match &vhost.authorization {
        None => None,
        Some(_) if tls.as_ref().is_none_or(|tls| tls.passthrough) => {
            return Err(Rejection::new(
                ErrorKind::InvalidShape,
                reason::AUTH_NOT_PERMITTED,
                "authorization requires a virtual host that terminates TLS",
            ));
        },
        Some(server) => Some(external_authorization(ctx, namespace, server, fragment)?),
    };
    Ok((tls, authorization))
}

fn virtual_host_tls(ctx: &mut BuildContext<'_>, namespace: &str, tls: &TLS, fragment: &mut Fragment) -> Result<VirtualHostTls, Rejection> {
    let invalid = |message: String| Rejection::new(ErrorKind::InvalidShape, reason::TLS_CONFIG_NOT_VALID, message);
    let passthrough = tls.passthrough.unwrap_or_default();
    match (&tls.secret_name, passthrough) {
        (Some(_), true) => return Err(invalid("tls.passthrough cannot be combined with tls.secretName".to_owned())),
        (None, false) => return Err(invalid("tls.secretName is required unless tls.passthrough is set".to_owned())),
        _ => {},
    }
    let minimum_protocol_version = tls.minimum_protocol_version.clone().filter(|version| !version.is_empty());
    if let Some(version) = &minimum_protocol_version {
        if !TLS_VERSIONS.contains(&version.as_str()) {
            return Err(invalid(format!("minimum TLS version {version} is not supported")));
        }
    }

    let secret = match &tls.secret_name {
        Some(secret_name) => {
            let name = NamespacedName::parse(secret_name, namespace);
            Some(fragment.add_secret(ctx.secrets.delegated_keypair(&name, namespace)?))
        },
        None => None,
    };

    let client_validation = match &tls.client_validation {
        None => None,
        Some(_) if passthrough => return Err(invalid("client validation cannot be combined with TLS passthrough".to_owned())),
        Some(validation) => {
            let name = NamespacedName::parse(&validation.ca_secret, namespace);
            Some(fragment.add_secret(ctx.secrets.ca_bundle(&name)?))
        },
    };

    let fallback_certificate = if tls.enable_fallback_certificate.unwrap_or_default() {
        if client_validation.is_some() {
            return Err(invalid("fallback certificate cannot be combined with client validation".to_owned()));
        }
        let Some(fallback) = &ctx.config.fallback_certificate else {
            return Err(invalid("fallback certificate is enabled but none is configured".to_owned()));
        };
        Some(fragment.add_secret(ctx.secrets.keypair(fallback)?))
    } else {
        None
    };

    Ok(VirtualHostTls {
        secret,
        passthrough,
        minimum_protocol_version,
        client_validation,
        fallback_certificate,
    })
}

fn external_authorization(
    ctx: &mut BuildContext<'_>,
    namespace: &str,
    server: &AuthorizationServer,
    fragment: &mut Fragment,
) -> Result<ExternalAuthorization, Rejection> {
    let reference = &server.extension_ref;
    let service = NamespacedName::new(reference.namespace.as_deref().unwrap_or(namespace), &reference.name);
    let mut cluster = resolve_backend(ctx.objects, &service, reference.port)?;
    cluster.protocol = Some("h2".to_owned());
    let cluster = fragment.add_cluster(cluster.named());
    let response_timeout = server.response_timeout.as_deref().map(policies::parse_timeout).transpose()?;
    Ok(ExternalAuthorization {
        cluster,
        fail_open: server.fail_open.unwrap_or_default(),
        response_timeout,
        context: server.auth_policy.as_ref().map(|policy| policy.context.clone()).unwrap_or_default(),
        order: policies::filter_order(ctx.config.auth_before_rate_limit),
    })
}

fn tcp_proxy(
    ctx: &mut BuildContext<'_>,
    proxies: &Proxies<'_>,
    namespace: &str,
    tcpproxy: &httpproxy::TCPProxy,
    fragment: &mut Fragment,
    reached: &mut BTreeSet<NamespacedName>,
) -> Result<TcpProxy, Rejection> {
    let invalid = |message: String| Rejection::new(ErrorKind::InvalidShape, reason::TCP_PROXY_NOT_VALID, message);
    let (owner_namespace, spec) = match (&tcpproxy.include, tcpproxy.services.is_empty()) {
        (Some(_), false) => return Err(invalid("tcpproxy cannot specify both services and include".to_owned())),
        (None, true) => return Err(invalid("tcpproxy must specify services or include".to_owned())),
        (None, false) => (namespace.to_owned(), tcpproxy),
        (Some(include), true) => {
            let child_name = NamespacedName::new(include.namespace.as_deref().unwrap_or(namespace), &include.name);
            let child = proxies.get(&child_name).ok_or_else(|| {
                Rejection::new(
                    ErrorKind::MalformedReference,
                    reason::INCLUDE_NOT_FOUND,
                    format!("tcpproxy include {child_name} not found"),
                )
            })?;
            if child.is_root() {
                return Err(Rejection::new(
                    ErrorKind::InvalidShape,
                    reason::ROOT_INCLUDES_ROOT,
                    format!("tcpproxy cannot include root HTTPProxy {child_name}"),
                ));
            }
            let included = child
                .spec
                .tcpproxy
                .as_ref()
                .filter(|included| included.include.is_none() && !included.services.is_empty())
                .ok_or_else(|| invalid(format!("included HTTPProxy {child_name} has no tcpproxy services")))?;
            reached.insert(child_name.clone());
            (child_name.namespace, included)
        },
    };

    let weighted = spec.services.iter().any(|service| service.weight.is_some());
    let mut clusters = vec![];
    for service in &spec.services {
        let mut cluster = resolve_backend(ctx.objects, &NamespacedName::new(&owner_namespace, &service.name), service.port)?;
        cluster.load_balancer_strategy = policies::load_balancer_strategy(spec.load_balancer_policy.as_ref());
        clusters.push(WeightedCluster {
            cluster: fragment.add_cluster(cluster.named()),
            weight: if weighted { service.weight.unwrap_or(0) } else { 1 },
        });
    }
    Ok(TcpProxy { clusters })
}

struct Visit {
    proxy: NamespacedName,
    inherited: RouteMatch,
    path: Vec<NamespacedName>,
}

/// Depth first walk of the include tree of one root. Routes come out in pre-order: a proxy's
/// own routes, then those of each include in declaration order. The path of ancestors of
/// every visit is kept so an include back onto it is refused instead of followed.
fn walk_routes(
    ctx: &mut BuildContext<'_>,
    proxies: &Proxies<'_>,
    root: &HTTPProxy,
    vhost: &httpproxy::VirtualHost,
    fragment: &mut Fragment,
    reached: &mut BTreeSet<NamespacedName>,
) -> Vec<(Route, bool)> {
    let root_name = NamespacedName::of(root);
    let mut routes = vec![];
    let mut stack = vec![Visit {
        proxy: root_name.clone(),
        inherited: RouteMatch::default(),
        path: vec![root_name],
    }];

    while let Some(visit) = stack.pop() {
        let Some(proxy) = proxies.get(&visit.proxy).copied() else {
            continue;
        };
        if !proxy.is_root() {
            reached.insert(visit.proxy.clone());
        }
        let proxy_origin = origin(proxy);
        let namespace = namespace_of(proxy);
        for (index, route) in proxy.spec.routes.iter().enumerate() {
            match build_route(ctx, &namespace, &proxy_origin.with_rule(index), &visit.inherited, route, vhost, fragment) {
                Ok(built) => routes.push((built, route.permit_insecure.unwrap_or_default())),
                Err(rejection) => rejection.record(ctx, &proxy_origin, Scope::Fragment),
            }
        }
        let children = includes(ctx, proxies, proxy, &proxy_origin, &visit);
        stack.extend(children.into_iter().rev());
    }
    routes
}

fn includes(ctx: &mut BuildContext<'_>, proxies: &Proxies<'_>, proxy: &HTTPProxy, proxy_origin: &Origin, visit: &Visit) -> Vec<Visit> {
    let namespace = namespace_of(proxy);
    let mut seen = BTreeSet::new();
    let mut children = vec![];
    for include in &proxy.spec.includes {
        let child_name = NamespacedName::new(include.namespace.as_deref().unwrap_or(&namespace), &include.name);
        let problem = match include_identity(&include.conditions) {
            Err(e) => Some(Rejection::from(e)),
            Ok(Some(identity)) if !seen.insert(identity.clone()) => Some(Rejection::new(
                ErrorKind::Conflict,
                reason::DUPLICATE_MATCH_CONDITIONS,
                format!("duplicate conditions defined on an include to {child_name}"),
            )),
            Ok(_) => match proxies.get(&child_name) {
                None => Some(Rejection::new(
                    ErrorKind::MalformedReference,
                    reason::INCLUDE_NOT_FOUND,
                    format!("include {child_name} not found"),
                )),
                Some(child) if child.is_root() => Some(Rejection::new(
                    ErrorKind::InvalidShape,
                    reason::ROOT_INCLUDES_ROOT,
                    format!("root HTTPProxy {child_name} cannot be included"),
                )),
                Some(_) if visit.path.contains(&child_name) => Some(Rejection::new(
                    ErrorKind::InvalidShape,
                    reason::INCLUDE_CREATES_CYCLE,
                    format!("include creates a cycle: {} -> {child_name}", visit.path.iter().join(" -> ")),
                )),
                Some(_) => None,
            },
        };
        if let Some(problem) = problem {
            problem.record(ctx, proxy_origin, Scope::Fragment);
            continue;
        }
        match merge_conditions(&visit.inherited, &include.conditions) {
            Ok(inherited) => {
                let mut path = visit.path.clone();
                path.push(child_name.clone());
                children.push(Visit {
                    proxy: child_name,
                    inherited,
                    path,
                });
            },
            Err(e) => Rejection::from(e).record(ctx, proxy_origin, Scope::Fragment),
        }
    }
    children
}

fn build_route(
    ctx: &mut BuildContext<'_>,
    namespace: &str,
    proxy_origin: &Origin,
    inherited: &RouteMatch,
    route: &httpproxy::Route,
    vhost: &httpproxy::VirtualHost,
    fragment: &mut Fragment,
) -> Result<Route, Rejection> {
    let route_match = merge_conditions(inherited, &route.conditions)?;
    check_regexes(ctx, proxy_origin, &route_match)?;
    let (action, mirrors) = route_action(ctx, namespace, route, fragment)?;
    let policies = route_policies(ctx, route, vhost)?;
    Ok(Route {
        route_match,
        action,
        policies: RoutePolicies { mirrors, ..policies },
        origin: proxy_origin.clone(),
    })
}

fn route_action(ctx: &mut BuildContext<'_>, namespace: &str, route: &httpproxy::Route, fragment: &mut Fragment) -> Result<(RouteAction, Vec<String>), Rejection> {
    let invalid = |message: &str| Rejection::new(ErrorKind::InvalidShape, reason::ROUTE_NOT_VALID, message);
    let actions = [route.request_redirect_policy.is_some(), route.direct_response_policy.is_some(), !route.services.is_empty()];
    if actions.iter().filter(|set| **set).count() > 1 {
        return Err(invalid("route must specify only one of services, requestRedirectPolicy or directResponsePolicy"));
    }

    if let Some(redirect) = &route.request_redirect_policy {
        if redirect.path.is_some() && redirect.prefix.is_some() {
            return Err(invalid("redirect cannot specify both path and prefix"));
        }
        let port = redirect
            .port
            .map(u16::try_from)
            .transpose()
            .map_err(|_| invalid("redirect port must be between 1 and 65535"))?;
        let path = redirect
            .path
            .clone()
            .map(PathRewrite::ReplaceFullPath)
            .or_else(|| redirect.prefix.clone().map(PathRewrite::ReplacePrefix));
        return Ok((
            RouteAction::Redirect(Redirect {
                scheme: redirect.scheme.clone(),
                hostname: redirect.hostname.clone(),
                port,
                path,
                status_code: policies::redirect_status(redirect.status_code)?,
            }),
            vec![],
        ));
    }

    if let Some(direct) = &route.direct_response_policy {
        return Ok((
            RouteAction::DirectResponse(DirectResponse {
                status_code: policies::direct_response_status(direct.status_code)?,
                body: direct.body.clone(),
            }),
            vec![],
        ));
    }

    if route.services.is_empty() {
        return Err(invalid("route must have at least one service"));
    }
    if route.services.iter().filter(|service| service.mirror.unwrap_or_default()).count() > 1 {
        return Err(invalid("only one service per route may be nominated as mirror"));
    }

    let weighted = route.services.iter().any(|service| service.weight.is_some());
    let mut clusters = vec![];
    let mut mirrors = vec![];
    for service in &route.services {
        let cluster = service_cluster(ctx, namespace, service, route, fragment)?;
        if service.mirror.unwrap_or_default() {
            mirrors.push(cluster);
        } else {
            clusters.push(WeightedCluster {
                cluster,
                weight: if weighted { service.weight.unwrap_or(0) } else { 1 },
            });
        }
    }
    if clusters.is_empty() {
        return Err(invalid("route must have at least one service that is not a mirror"));
    }
    Ok((RouteAction::Forward(clusters), mirrors))
}

fn service_cluster(
    ctx: &mut BuildContext<'_>,
    namespace: &str,
    service: &httpproxy::Service,
    route: &httpproxy::Route,
    fragment: &mut Fragment,
) -> Result<String, Rejection> {
    let mut cluster = resolve_backend(ctx.objects, &NamespacedName::new(namespace, &service.name), service.port)?;
    if let Some(protocol) = &service.protocol {
        if !UPSTREAM_PROTOCOLS.contains(&protocol.as_str()) {
            return Err(Rejection::new(
                ErrorKind::InvalidShape,
                reason::ROUTE_NOT_VALID,
                format!("unsupported protocol \"{protocol}\" on service {}", service.name),
            ));
        }
        cluster.protocol = Some(protocol.clone());
    }
    cluster.load_balancer_strategy = policies::load_balancer_strategy(route.load_balancer_policy.as_ref());
    cluster.health_check.clone_from(&route.health_check_policy);
    if let Some(validation) = &service.validation {
        let ca_secret = NamespacedName::parse(&validation.ca_secret, namespace);
        if !ctx.secrets.is_delegated(&ca_secret, namespace) {
            return Err(crate::dag::secrets::SecretError::NotDelegated(ca_secret, namespace.to_owned()).into());
        }
        let ca_secret = fragment.add_secret(ctx.secrets.ca_bundle(&ca_secret)?);
        cluster.upstream_validation = Some(UpstreamValidation {
            ca_secret,
            subject_name: validation.subject_name.clone(),
        });
    }
    if let Some(headers) = &service.request_headers_policy {
        cluster.request_headers = policies::header_policy(headers, false)?;
    }
    if let Some(headers) = &service.response_headers_policy {
        cluster.response_headers = policies::header_policy(headers, true)?;
    }
    Ok(fragment.add_cluster(cluster.named()))
}

fn route_policies(ctx: &BuildContext<'_>, route: &httpproxy::Route, vhost: &httpproxy::VirtualHost) -> Result<RoutePolicies, Rejection> {
    let default_request = policies::default_headers(&ctx.config.default_request_headers);
    let default_response = policies::default_headers(&ctx.config.default_response_headers);
    let mut request = route
        .request_headers_policy
        .as_ref()
        .map(|headers| policies::header_policy(headers, false))
        .transpose()?
        .unwrap_or_default();
    let response = route
        .response_headers_policy
        .as_ref()
        .map(|headers| policies::header_policy(headers, true))
        .transpose()?
        .unwrap_or_default();
    let rewrite = request.set.remove("host").map(|hostname| Rewrite {
        hostname: Some(hostname),
        path: None,
    });
    if let Some(rate_limit) = &route.rate_limit_policy {
        policies::validate_rate_limit(rate_limit)?;
    }

    Ok(RoutePolicies {
        timeout: route.timeout_policy.as_ref().map(policies::timeout_policy).transpose()?,
        retry: route.retry_policy.as_ref().map(policies::retry_policy).transpose()?,
        request_headers: policies::merge_headers(&[&request, &default_request]),
        response_headers: policies::merge_headers(&[&response, &default_response]),
        rate_limit: policies::effective_rate_limit(vhost.rate_limit_policy.as_ref(), route.rate_limit_policy.as_ref()),
        authorization: vhost
            .authorization
            .as_ref()
            .map(|server| policies::authorization_context(server.auth_policy.as_ref(), route.auth_policy.as_ref())),
        mirrors: vec![],
        websockets: route.enable_websockets.unwrap_or_default(),
        rewrite,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configuration::DagConfiguration,
        dag::{
            matching::PathMatch,
            status::ObjectStatus,
            test_support::{invalid_tls_secret, objects_from_yaml, service, tls_secret},
        },
        state::Objects,
    };

    fn process(objects: &Objects) -> (Fragment, BTreeMap<ResourceKey, ObjectStatus>) {
        let config = DagConfiguration::default();
        let mut ctx = BuildContext::new(objects, &config);
        let fragment = HttpProxyProcessor.process(&mut ctx);
        (fragment, ctx.status.into_statuses())
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("projectcontour.io", "HTTPProxy", "default", name)
    }

    fn with_services(yaml: &str) -> Objects {
        let mut objects = objects_from_yaml(yaml);
        for name in ["root-svc", "a-svc", "b-svc", "c-svc"] {
            objects.insert(service("default", name, &[80]));
        }
        objects
    }

    fn paths(fragment: &Fragment, listener: &str) -> Vec<PathMatch> {
        fragment
            .virtual_hosts
            .iter()
            .filter(|vhost| vhost.listener == listener)
            .flat_map(|vhost| vhost.routes.iter().map(|route| route.route_match.path.clone()))
            .collect()
    }

    #[test]
    fn include_conditions_are_anded() {
        let objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: example.com
  includes:
    - name: child
      conditions:
        - prefix: /a
---
kind: HTTPProxy
metadata:
  name: child
  namespace: default
spec:
  routes:
    - conditions:
        - prefix: /b
      services:
        - name: a-svc
          port: 80
",
        );
        let (fragment, statuses) = process(&objects);
        let routes = paths(&fragment, "ingress_http");
        assert_eq!(routes, vec![PathMatch::segment("/a/b")]);
        assert!(routes[0].matches("/a/b/c"));
        assert!(!routes[0].matches("/ab"));
        assert!(statuses[&key("child")].conditions.is_clean());
    }

    #[test]
    fn duplicate_includes() {
        let objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: example.com
  includes:
    - name: a
    - name: b
      conditions:
        - prefix: /
    - name: c
      conditions:
        - prefix: /blog
    - name: dup
      conditions:
        - prefix: /blog
---
kind: HTTPProxy
metadata:
  name: a
  namespace: default
spec:
  routes:
    - conditions:
        - prefix: /a
      services:
        - name: a-svc
          port: 80
---
kind: HTTPProxy
metadata:
  name: b
  namespace: default
spec:
  routes:
    - conditions:
        - prefix: /b
      services:
        - name: b-svc
          port: 80
---
kind: HTTPProxy
metadata:
  name: c
  namespace: default
spec:
  routes:
    - services:
        - name: c-svc
          port: 80
---
kind: HTTPProxy
metadata:
  name: dup
  namespace: default
spec:
  routes:
    - services:
        - name: c-svc
          port: 80
",
        );
        let (fragment, statuses) = process(&objects);
        assert_eq!(
            paths(&fragment, "ingress_http"),
            vec![PathMatch::segment("/a"), PathMatch::segment("/b"), PathMatch::segment("/blog")]
        );

        let root = &statuses[&key("root")].conditions;
        assert!(root.has_reason(reason::DUPLICATE_MATCH_CONDITIONS));
        assert!(!root.is_rejected());
        assert!(root.is_partial());
        assert!(statuses[&key("dup")].conditions.has_reason(reason::ORPHANED));
        for name in ["a", "b", "c"] {
            assert!(statuses[&key(name)].conditions.is_clean(), "{name}");
        }
    }

    #[test]
    fn duplicate_include_target_reachable_elsewhere_is_not_orphaned() {
        let objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: example.com
  includes:
    - name: a
      conditions:
        - prefix: /x
    - name: b
      conditions:
        - prefix: /x
    - name: b
      conditions:
        - prefix: /y
---
kind: HTTPProxy
metadata:
  name: a
  namespace: default
spec:
  routes:
    - services:
        - name: a-svc
          port: 80
---
kind: HTTPProxy
metadata:
  name: b
  namespace: default
spec:
  routes:
    - services:
        - name: b-svc
          port: 80
",
        );
        let (fragment, statuses) = process(&objects);
        assert_eq!(paths(&fragment, "ingress_http"), vec![PathMatch::segment("/x"), PathMatch::segment("/y")]);
        assert!(statuses[&key("b")].conditions.is_clean());
    }

    #[test]
    fn include_cycle_is_refused() {
        let objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: example.com
  includes:
    - name: a
      conditions:
        - prefix: /a
    - name: b
      conditions:
        - prefix: /b
---
kind: HTTPProxy
metadata:
  name: a
  namespace: default
spec:
  routes:
    - services:
        - name: a-svc
          port: 80
  includes:
    - name: a
      conditions:
        - prefix: /again
---
kind: HTTPProxy
metadata:
  name: b
  namespace: default
spec:
  routes:
    - services:
        - name: b-svc
          port: 80
",
        );
        let (fragment, statuses) = process(&objects);
        assert_eq!(paths(&fragment, "ingress_http"), vec![PathMatch::segment("/a"), PathMatch::segment("/b")]);
        let a = &statuses[&key("a")].conditions;
        assert!(a.has_reason(reason::INCLUDE_CREATES_CYCLE));
        assert!(!a.is_rejected());
        assert!(statuses[&key("b")].conditions.is_clean());
    }

    #[test]
    fn cycle_outside_any_root_is_orphaned() {
        let objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: example.com
  includes:
    - name: a
      conditions:
        - prefix: /a
---
kind: HTTPProxy
metadata:
  name: a
  namespace: default
spec:
  includes:
    - name: b
      conditions:
        - prefix: /b
---
kind: HTTPProxy
metadata:
  name: b
  namespace: default
spec:
  routes:
    - services:
        - name: b-svc
          port: 80
  includes:
    - name: a
---
kind: HTTPProxy
metadata:
  name: c
  namespace: default
spec:
  routes:
    - services:
        - name: c-svc
          port: 80
  includes:
    - name: d
---
kind: HTTPProxy
metadata:
  name: d
  namespace: default
spec:
  includes:
    - name: c
",
        );
        let (fragment, statuses) = process(&objects);
        assert_eq!(paths(&fragment, "ingress_http"), vec![PathMatch::segment("/a/b")]);

        // The include closing the loop is reported on the proxy that writes it.
        assert!(statuses[&key("b")].conditions.has_reason(reason::INCLUDE_CREATES_CYCLE));
        assert!(!statuses[&key("a")].conditions.has_reason(reason::INCLUDE_CREATES_CYCLE));
        assert!(!statuses[&key("a")].conditions.has_reason(reason::ORPHANED));

        for name in ["c", "d"] {
            let conditions = &statuses[&key(name)].conditions;
            assert!(conditions.has_reason(reason::ORPHANED), "{name}");
            assert!(!conditions.has_reason(reason::INCLUDE_CREATES_CYCLE), "{name}");
        }
    }

    #[test]
    fn duplicate_fqdn_rejects_all_claimants() {
        let objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: first
  namespace: default
spec:
  virtualhost:
    fqdn: example.com
  routes:
    - services:
        - name: a-svc
          port: 80
---
kind: HTTPProxy
metadata:
  name: second
  namespace: default
spec:
  virtualhost:
    fqdn: Example.com
  routes:
    - services:
        - name: b-svc
          port: 80
",
        );
        let (fragment, statuses) = process(&objects);
        assert!(fragment.virtual_hosts.is_empty());
        for name in ["first", "second"] {
            let accepted = statuses[&key(name)].conditions.accepted(reason::VALID);
            assert!(!accepted.status);
            assert_eq!(accepted.reason, reason::DUPLICATE_VHOST);
        }
    }

    #[test]
    fn tls_virtual_host_with_insecure_redirect() {
        let mut objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: secure.example.com
    tls:
      secretName: cert
  routes:
    - conditions:
        - prefix: /app
      services:
        - name: a-svc
          port: 80
    - conditions:
        - prefix: /.well-known
      permitInsecure: true
      services:
        - name: b-svc
          port: 80
",
        );
        objects.insert(tls_secret("default", "cert"));
        objects.insert(invalid_tls_secret("default", "unused"));
        let (fragment, statuses) = process(&objects);

        let secure = fragment.virtual_hosts.iter().find(|vhost| vhost.listener == "ingress_https").unwrap();
        assert_eq!(secure.tls.as_ref().and_then(|tls| tls.secret.clone()), Some("default/cert".to_owned()));
        assert_eq!(fragment.secrets.keys().collect::<Vec<_>>(), vec!["default/cert"]);

        let insecure = fragment.virtual_hosts.iter().find(|vhost| vhost.listener == "ingress_http").unwrap();
        assert!(matches!(insecure.routes[0].action, RouteAction::Redirect(_)));
        assert!(matches!(insecure.routes[1].action, RouteAction::Forward(_)));
        assert!(statuses[&key("root")].conditions.is_clean());
    }

    #[test]
    fn invalid_secret_rejects_referencing_proxy() {
        let mut objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: secure.example.com
    tls:
      secretName: broken
  routes:
    - services:
        - name: a-svc
          port: 80
",
        );
        objects.insert(invalid_tls_secret("default", "broken"));
        let (fragment, statuses) = process(&objects);
        assert!(fragment.virtual_hosts.is_empty());
        let accepted = statuses[&key("root")].conditions.accepted(reason::VALID);
        assert!(!accepted.status);
        assert_eq!(accepted.reason, reason::SECRET_INVALID);
    }

    #[test]
    fn missing_service_drops_route_only() {
        let objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: example.com
  routes:
    - conditions:
        - prefix: /missing
      services:
        - name: nowhere
          port: 80
    - conditions:
        - prefix: /ok
      services:
        - name: root-svc
          port: 80
",
        );
        let (fragment, statuses) = process(&objects);
        assert_eq!(paths(&fragment, "ingress_http"), vec![PathMatch::segment("/ok")]);
        let conditions = &statuses[&key("root")].conditions;
        assert!(!conditions.is_rejected());
        let resolved = conditions.resolved_refs();
        assert!(!resolved.status);
        assert_eq!(resolved.reason, reason::SERVICE_NOT_FOUND);
    }

    #[test]
    fn tls_passthrough_tcp_proxy() {
        let objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: tcp.example.com
    tls:
      passthrough: true
  tcpproxy:
    include:
      name: backend
---
kind: HTTPProxy
metadata:
  name: backend
  namespace: default
spec:
  tcpproxy:
    services:
      - name: a-svc
        port: 80
",
        );
        let (fragment, statuses) = process(&objects);
        assert_eq!(fragment.virtual_hosts.len(), 1);
        let vhost = &fragment.virtual_hosts[0];
        assert_eq!(vhost.listener, "ingress_https");
        assert!(vhost.tls.as_ref().is_some_and(|tls| tls.passthrough));
        assert_eq!(vhost.tcp_proxy.as_ref().map(|proxy| proxy.clusters.len()), Some(1));
        assert!(statuses[&key("backend")].conditions.is_clean());
    }

    #[test]
    fn route_policies_applied() {
        let objects = with_services(
            r"
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: example.com
  routes:
    - enableWebsockets: true
      timeoutPolicy:
        response: 30s
      retryPolicy:
        count: 3
      requestHeadersPolicy:
        set:
          - name: Host
            value: internal.example.com
          - name: X-Team
            value: core
      services:
        - name: a-svc
          port: 80
          weight: 80
        - name: b-svc
          port: 80
          weight: 20
        - name: c-svc
          port: 80
          mirror: true
",
        );
        let (fragment, _) = process(&objects);
        let route = &fragment.virtual_hosts[0].routes[0];
        assert!(route.policies.websockets);
        assert_eq!(route.policies.retry.as_ref().map(|retry| retry.count), Some(3));
        assert_eq!(route.policies.rewrite.as_ref().and_then(|r| r.hostname.as_deref()), Some("internal.example.com"));
        assert_eq!(route.policies.request_headers.set.get("x-team").map(String::as_str), Some("core"));
        assert_eq!(route.policies.mirrors, vec!["default/c-svc/80".to_owned()]);
        let RouteAction::Forward(clusters) = &route.action else {
            panic!("expected a forward action");
        };
        assert_eq!(clusters.iter().map(|c| c.weight).collect::<Vec<_>>(), vec![80, 20]);
    }
}
