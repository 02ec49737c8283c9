use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::networking::v1::{Ingress, IngressBackend, IngressSpec, ServiceBackendPort};
use tracing::debug;

use super::{check_regexes, class_matches, resolve_backend, BackendError, BuildContext, Processor, Rejection};
use crate::{
    common::{creation_timestamp, reason, ErrorKind, NamespacedName, ResourceKey, Scope, DEFAULT_ROUTE_HOSTNAME},
    dag::{
        fragment::{Fragment, VirtualHostFragment},
        hostname,
        matching::{PathMatch, RouteMatch},
        policies, Origin, Redirect, RetryPolicy, Route, RouteAction, RoutePolicies, Schema, Timeout, TimeoutPolicy, VirtualHostTls,
        WeightedCluster,
    },
    state::Objects,
};

const RESPONSE_TIMEOUT_ANNOTATION: &str = "projectcontour.io/response-timeout";
const NUM_RETRIES_ANNOTATION: &str = "projectcontour.io/num-retries";
const PER_TRY_TIMEOUT_ANNOTATION: &str = "projectcontour.io/per-try-timeout";
const RETRY_ON_ANNOTATION: &str = "projectcontour.io/retry-on";
const WEBSOCKET_ROUTES_ANNOTATION: &str = "projectcontour.io/websocket-routes";
const FORCE_SSL_REDIRECT_ANNOTATION: &str = "ingress.kubernetes.io/force-ssl-redirect";
const ALLOW_HTTP_ANNOTATION: &str = "kubernetes.io/ingress.allow-http";
const TLS_MINIMUM_VERSION_ANNOTATION: &str = "projectcontour.io/tls-minimum-protocol-version";

const EXACT_PATH_TYPE: &str = "Exact";
const IMPLEMENTATION_SPECIFIC_PATH_TYPE: &str = "ImplementationSpecific";
/// Characters that turn an ImplementationSpecific path into a regex.
const REGEX_CHARACTERS: &[char] = &['^', '+', '*', '[', ']', '%'];

/// Translates Ingress rules into virtual hosts. Paths are raw string prefixes, and there is no
/// inclusion, so collisions between Ingresses are left to the assembler.
pub struct IngressProcessor;

impl Processor for IngressProcessor {
    fn name(&self) -> &'static str {
        "Ingress"
    }

    fn process(&self, ctx: &mut BuildContext<'_>) -> Fragment {
        let objects = ctx.objects;
        let configured_class = ctx.config.ingress_class_name.as_deref();
        let mut fragment = Fragment::default();
        for ingress in objects.ingresses.values() {
            let spec_class = ingress.spec.as_ref().and_then(|spec| spec.ingress_class_name.as_deref());
            if !class_matches(configured_class, ingress, spec_class) {
                continue;
            }
            ctx.status.touch(ingress);
            if let Some(spec) = &ingress.spec {
                debug!("Translating Ingress {}", NamespacedName::of(ingress));
                translate(ctx, ingress, spec, &mut fragment);
            }
        }
        fragment
    }
}

/// Route level behaviour configured through annotations.
#[derive(Debug, Default)]
struct Annotations {
    timeout: Option<TimeoutPolicy>,
    retry: Option<RetryPolicy>,
    websocket_paths: BTreeSet<String>,
    force_ssl_redirect: bool,
    allow_http: bool,
    minimum_protocol_version: Option<String>,
}

impl Annotations {
    fn parse(ingress: &Ingress) -> Result<Self, Rejection> {
        let empty = BTreeMap::new();
        let annotations = ingress.metadata.annotations.as_ref().unwrap_or(&empty);
        let get = |name: &str| annotations.get(name).map(|value| value.trim()).filter(|value| !value.is_empty());

        let timeout = get(RESPONSE_TIMEOUT_ANNOTATION)
            .map(policies::parse_timeout)
            .transpose()?
            .map(|response| TimeoutPolicy {
                response,
                idle: Timeout::Default,
            });

        let retry = match (get(NUM_RETRIES_ANNOTATION), get(RETRY_ON_ANNOTATION)) {
            (None, None) => None,
            (count, retry_on) => {
                let count = count
                    .map(str::parse::<u32>)
                    .transpose()
                    .map_err(|e| Rejection::new(ErrorKind::InvalidShape, reason::POLICY_NOT_VALID, format!("{NUM_RETRIES_ANNOTATION}: {e}")))?
                    .unwrap_or(1);
                Some(RetryPolicy {
                    count,
                    per_try_timeout: get(PER_TRY_TIMEOUT_ANNOTATION).map(policies::parse_timeout).transpose()?.unwrap_or_default(),
                    retry_on: retry_on
                        .map(|values| values.split(',').map(str::trim).filter(|v| !v.is_empty()).map(str::to_owned).collect())
                        .unwrap_or_default(),
                    retriable_status_codes: vec![],
                })
            },
        };

        let minimum_protocol_version = get(TLS_MINIMUM_VERSION_ANNOTATION).map(str::to_owned);
        if let Some(version) = &minimum_protocol_version {
            if version != "1.2" && version != "1.3" {
                return Err(Rejection::new(
                    ErrorKind::InvalidShape,
                    reason::TLS_CONFIG_NOT_VALID,
                    format!("minimum TLS version {version} is not supported"),
                ));
            }
        }

        Ok(Self {
            timeout,
            retry,
            websocket_paths: get(WEBSOCKET_ROUTES_ANNOTATION)
                .map(|paths| paths.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_owned).collect())
                .unwrap_or_default(),
            force_ssl_redirect: get(FORCE_SSL_REDIRECT_ANNOTATION) == Some("true"),
            allow_http: get(ALLOW_HTTP_ANNOTATION) != Some("false"),
            minimum_protocol_version,
        })
    }
}

fn translate(ctx: &mut BuildContext<'_>, ingress: &Ingress, spec: &IngressSpec, fragment: &mut Fragment) {
    let origin = Origin::new(ResourceKey::from_resource(ingress), Schema::Ingress, creation_timestamp(ingress));
    let namespace = ingress.metadata.namespace.clone().unwrap_or_default();
    let annotations = match Annotations::parse(ingress) {
        Ok(annotations) => annotations,
        Err(rejection) => {
            rejection.record(ctx, &origin, Scope::Object);
            return;
        },
    };
    let tls_hosts = tls_hosts(ctx, &namespace, &origin, spec, &annotations, fragment);

    let mut hosts: BTreeMap<String, Vec<Route>> = BTreeMap::new();
    let mut rule = 0;
    if let Some(backend) = &spec.default_backend {
        let route_origin = origin.with_rule(rule);
        rule += 1;
        match build_route(ctx, &namespace, &route_origin, &annotations, PathMatch::string_prefix("/"), backend, fragment) {
            Ok(route) => hosts.entry(DEFAULT_ROUTE_HOSTNAME.to_owned()).or_default().push(route),
            Err(rejection) => rejection.record(ctx, &origin, Scope::Fragment),
        }
    }

    for ingress_rule in spec.rules.iter().flatten() {
        let host = ingress_rule
            .host
            .as_deref()
            .filter(|host| !host.is_empty())
            .unwrap_or(DEFAULT_ROUTE_HOSTNAME)
            .to_ascii_lowercase();
        if !hostname::is_valid_hostname(&host) {
            Rejection::new(ErrorKind::InvalidShape, reason::FQDN_NOT_VALID, format!("rule host \"{host}\" is not a valid hostname")).record(
                ctx,
                &origin,
                Scope::Fragment,
            );
            continue;
        }
        for path in ingress_rule.http.iter().flat_map(|http| &http.paths) {
            let route_origin = origin.with_rule(rule);
            rule += 1;
            let built = path_match(path.path.as_deref(), &path.path_type)
                .and_then(|path_match| build_route(ctx, &namespace, &route_origin, &annotations, path_match, &path.backend, fragment));
            match built {
                Ok(route) => hosts.entry(host.clone()).or_default().push(route),
                Err(rejection) => rejection.record(ctx, &origin, Scope::Fragment),
            }
        }
    }

    let sort_routes = !ctx.config.disable_route_sorting;
    for (host, routes) in hosts {
        let tls = tls_hosts.get(&host).cloned();
        if annotations.allow_http {
            let http = ctx.http_listener();
            let mut insecure = VirtualHostFragment::new(&http.name, &host, origin.clone());
            insecure.sort_routes = sort_routes;
            insecure.routes = if tls.is_some() && annotations.force_ssl_redirect {
                routes
                    .iter()
                    .map(|route| Route {
                        action: RouteAction::Redirect(Redirect::to_https()),
                        policies: RoutePolicies::default(),
                        ..route.clone()
                    })
                    .collect()
            } else {
                routes.clone()
            };
            fragment.declare_listener(http);
            fragment.virtual_hosts.push(insecure);
        }
        if let Some(tls) = tls {
            let https = ctx.https_listener();
            let mut secure = VirtualHostFragment::new(&https.name, &host, origin.clone());
            secure.tls = Some(tls);
            secure.sort_routes = sort_routes;
            secure.routes = routes;
            fragment.declare_listener(https);
            fragment.virtual_hosts.push(secure);
        }
    }
}

/// TLS settings per host. Hosts whose secret does not validate are served without TLS and the
/// problem is recorded against the Ingress.
fn tls_hosts(
    ctx: &mut BuildContext<'_>,
    namespace: &str,
    origin: &Origin,
    spec: &IngressSpec,
    annotations: &Annotations,
    fragment: &mut Fragment,
) -> BTreeMap<String, VirtualHostTls> {
    let mut hosts = BTreeMap::new();
    for tls in spec.tls.iter().flatten() {
        let Some(secret_name) = tls.secret_name.as_deref().filter(|name| !name.is_empty()) else {
            continue;
        };
        let name = NamespacedName::parse(secret_name, namespace);
        let secret = match ctx.secrets.delegated_keypair(&name, namespace) {
            Ok(secret) => fragment.add_secret(secret),
            Err(e) => {
                Rejection::from(e).record(ctx, origin, Scope::Fragment);
                continue;
            },
        };
        for host in tls.hosts.iter().flatten() {
            hosts.insert(
                host.to_ascii_lowercase(),
                VirtualHostTls {
                    secret: Some(secret.clone()),
                    minimum_protocol_version: annotations.minimum_protocol_version.clone(),
                    ..Default::default()
                },
            );
        }
    }
    hosts
}

fn path_match(path: Option<&str>, path_type: &str) -> Result<PathMatch, Rejection> {
    let value = path.filter(|path| !path.is_empty()).unwrap_or("/");
    if !value.starts_with('/') {
        return Err(Rejection::new(
            ErrorKind::InvalidShape,
            reason::ROUTE_NOT_VALID,
            format!("path \"{value}\" must start with /"),
        ));
    }
    Ok(match path_type {
        EXACT_PATH_TYPE => PathMatch::Exact(value.to_owned()),
        IMPLEMENTATION_SPECIFIC_PATH_TYPE if value.contains(REGEX_CHARACTERS) => PathMatch::Regex(value.to_owned()),
        _ => PathMatch::string_prefix(value),
    })
}

fn build_route(
    ctx: &mut BuildContext<'_>,
    namespace: &str,
    origin: &Origin,
    annotations: &Annotations,
    path: PathMatch,
    backend: &IngressBackend,
    fragment: &mut Fragment,
) -> Result<Route, Rejection> {
    let route_match = RouteMatch::with_path(path);
    check_regexes(ctx, origin, &route_match)?;
    let cluster = backend_cluster(ctx.objects, namespace, backend)?;
    let websockets = annotations.websocket_paths.contains(route_match.path.value());
    Ok(Route {
        route_match,
        action: RouteAction::Forward(vec![WeightedCluster {
            cluster: fragment.add_cluster(cluster.named()),
            weight: 1,
        }]),
        policies: RoutePolicies {
            timeout: annotations.timeout.clone(),
            retry: annotations.retry.clone(),
            request_headers: policies::default_headers(&ctx.config.default_request_headers),
            response_headers: policies::default_headers(&ctx.config.default_response_headers),
            websockets,
            ..Default::default()
        },
        origin: origin.clone(),
    })
}

fn backend_cluster(objects: &Objects, namespace: &str, backend: &IngressBackend) -> Result<crate::dag::Cluster, Rejection> {
    let Some(service) = &backend.service else {
        return Err(Rejection::new(
            ErrorKind::MalformedReference,
            reason::SERVICE_NOT_FOUND,
            "only service backends are supported",
        ));
    };
    let name = NamespacedName::new(namespace, &service.name);
    let port = service_port(objects, &name, service.port.as_ref())?;
    Ok(resolve_backend(objects, &name, port)?)
}

fn service_port(objects: &Objects, name: &NamespacedName, port: Option<&ServiceBackendPort>) -> Result<i32, Rejection> {
    let missing_port = |port: &str| {
        Rejection::new(
            ErrorKind::MalformedReference,
            reason::SERVICE_NOT_FOUND,
            format!("service {name} has no port {port}"),
        )
    };
    let port = port.ok_or_else(|| missing_port("(unset)"))?;
    if let Some(number) = port.number {
        return Ok(number);
    }
    let port_name = port.name.as_deref().ok_or_else(|| missing_port("(unset)"))?;
    let service = objects.services.get(name).ok_or_else(|| BackendError::ServiceNotFound(name.clone()))?;
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.name.as_deref() == Some(port_name)))
        .map(|p| p.port)
        .ok_or_else(|| missing_port(port_name))
}
