use std::collections::BTreeMap;

use gateway_api::apis::{
    experimental::{
        tcproutes::{TCPRoute, TCPRouteRulesBackendRefs},
        tlsroutes::{TLSRoute, TLSRouteRulesBackendRefs},
    },
    standard::{
        grpcroutes::{
            GRPCRoute, GRPCRouteRules, GRPCRouteRulesBackendRefs, GRPCRouteRulesBackendRefsFilters, GRPCRouteRulesBackendRefsFiltersRequestHeaderModifier,
            GRPCRouteRulesBackendRefsFiltersResponseHeaderModifier, GRPCRouteRulesBackendRefsFiltersType, GRPCRouteRulesFilters,
            GRPCRouteRulesFiltersRequestHeaderModifier, GRPCRouteRulesFiltersRequestMirrorBackendRef, GRPCRouteRulesFiltersResponseHeaderModifier,
            GRPCRouteRulesFiltersType, GRPCRouteRulesMatches, GRPCRouteRulesMatchesHeadersType, GRPCRouteRulesMatchesMethodType,
        },
        httproutes::{
            HTTPRoute, HTTPRouteRules, HTTPRouteRulesBackendRefs, HTTPRouteRulesBackendRefsFilters, HTTPRouteRulesBackendRefsFiltersRequestHeaderModifier,
            HTTPRouteRulesBackendRefsFiltersResponseHeaderModifier, HTTPRouteRulesBackendRefsFiltersType, HTTPRouteRulesFilters,
            HTTPRouteRulesFiltersRequestHeaderModifier, HTTPRouteRulesFiltersRequestMirrorBackendRef, HTTPRouteRulesFiltersRequestRedirect,
            HTTPRouteRulesFiltersRequestRedirectPathType, HTTPRouteRulesFiltersResponseHeaderModifier, HTTPRouteRulesFiltersType,
            HTTPRouteRulesFiltersUrlRewrite, HTTPRouteRulesFiltersUrlRewritePathType, HTTPRouteRulesMatches, HTTPRouteRulesMatchesHeadersType,
            HTTPRouteRulesMatchesPathType, HTTPRouteRulesMatchesQueryParamsType,
        },
    },
};
use kube::Resource;
use tracing::debug;

use super::{
    attachment::{attach, is_managed, Attachment, RouteRef},
    listeners::{GRPC_ROUTE_KIND, HTTP_ROUTE_KIND, TCP_ROUTE_KIND, TLS_ROUTE_KIND},
    ResolvedGateway,
};
use crate::{
    common::{
        creation_timestamp, reason, wire_name, ErrorKind, Listed, NamespacedName, ParentReference, ResourceKey, Scope, CORE_GROUP_NAME,
        GATEWAY_GROUP_NAME, SERVICE_KIND,
    },
    dag::{
        fragment::{Fragment, TcpFragment, VirtualHostFragment},
        matching::{HeaderMatch, PathMatch, QueryMatch, RouteMatch, StringMatch},
        policies,
        processors::{check_regexes, resolve_backend, BuildContext, Rejection},
        references::{ReferenceFrom, ReferenceGrants, ReferenceTo},
        Cluster, DirectResponse, HeaderPolicy, Origin, PathRewrite, Redirect, Rewrite, Route, RouteAction, RoutePolicies, Schema, TcpProxy, TimeoutPolicy,
        WeightedCluster,
    },
};

const GRPC_UPSTREAM_PROTOCOL: &str = "h2c";

fn unsupported(message: impl Into<String>) -> Rejection {
    Rejection::new(ErrorKind::InvalidShape, reason::UNSUPPORTED_VALUE, message)
}

/// A Service reference as written in any route kind.
struct BackendTarget<'a> {
    group: Option<&'a str>,
    kind: Option<&'a str>,
    name: &'a str,
    namespace: Option<&'a str>,
    port: Option<i32>,
    weight: Option<i32>,
}

macro_rules! backend_target {
    ($reference:ty, |$backend:ident| $weight:expr) => {
        impl<'a> From<&'a $reference> for BackendTarget<'a> {
            fn from($backend: &'a $reference) -> Self {
                Self {
                    group: $backend.group.as_deref(),
                    kind: $backend.kind.as_deref(),
                    name: &$backend.name,
                    namespace: $backend.namespace.as_deref(),
                    port: $backend.port,
                    weight: $weight,
                }
            }
        }
    };
}

backend_target!(HTTPRouteRulesBackendRefs, |backend| backend.weight);
backend_target!(GRPCRouteRulesBackendRefs, |backend| backend.weight);
backend_target!(TLSRouteRulesBackendRefs, |backend| backend.weight);
backend_target!(TCPRouteRulesBackendRefs, |backend| backend.weight);
backend_target!(HTTPRouteRulesFiltersRequestMirrorBackendRef, |backend| None);
backend_target!(GRPCRouteRulesFiltersRequestMirrorBackendRef, |backend| None);

macro_rules! header_policy {
    ($($modifier:ty),*) => {
        $(
            impl From<&$modifier> for HeaderPolicy {
                fn from(modifier: &$modifier) -> Self {
                    HeaderPolicy {
                        set: modifier.set.listed().iter().map(|header| (header.name.to_lowercase(), header.value.clone())).collect(),
                        add: modifier.add.listed().iter().map(|header| (header.name.to_lowercase(), header.value.clone())).collect(),
                        remove: modifier.remove.listed().iter().map(|name| name.to_lowercase()).collect(),
                    }
                }
            }
        )*
    };
}

header_policy!(
    HTTPRouteRulesFiltersRequestHeaderModifier,
    HTTPRouteRulesFiltersResponseHeaderModifier,
    HTTPRouteRulesBackendRefsFiltersRequestHeaderModifier,
    HTTPRouteRulesBackendRefsFiltersResponseHeaderModifier,
    GRPCRouteRulesFiltersRequestHeaderModifier,
    GRPCRouteRulesFiltersResponseHeaderModifier,
    GRPCRouteRulesBackendRefsFiltersRequestHeaderModifier,
    GRPCRouteRulesBackendRefsFiltersResponseHeaderModifier
);

/// Header rewrites a backend reference applies on its own cluster.
#[derive(Default)]
struct BackendHeaders {
    request: Option<HeaderPolicy>,
    response: Option<HeaderPolicy>,
}

macro_rules! backend_headers {
    ($name:ident, $filter:ty, $filter_type:ident) => {
        fn $name(filters: &[$filter]) -> Result<BackendHeaders, Rejection> {
            let mut headers = BackendHeaders::default();
            for filter in filters {
                match filter.r#type {
                    $filter_type::RequestHeaderModifier => headers.request = filter.request_header_modifier.as_ref().map(HeaderPolicy::from),
                    $filter_type::ResponseHeaderModifier => headers.response = filter.response_header_modifier.as_ref().map(HeaderPolicy::from),
                    _ => {
                        let name = wire_name(&filter.r#type).unwrap_or_default();
                        return Err(unsupported(format!("backend filter {name} is not supported")));
                    },
                }
            }
            Ok(headers)
        }
    };
}

backend_headers!(http_backend_headers, HTTPRouteRulesBackendRefsFilters, HTTPRouteRulesBackendRefsFiltersType);
backend_headers!(grpc_backend_headers, GRPCRouteRulesBackendRefsFilters, GRPCRouteRulesBackendRefsFiltersType);

struct Backend<'a> {
    target: BackendTarget<'a>,
    headers: Result<BackendHeaders, Rejection>,
}

/// A rule filter, whichever route kind it came from. Redirects and rewrites only exist on
/// HTTPRoute rules.
enum Filter<'a> {
    RequestHeaders(HeaderPolicy),
    ResponseHeaders(HeaderPolicy),
    Redirect(&'a HTTPRouteRulesFiltersRequestRedirect),
    Rewrite(&'a HTTPRouteRulesFiltersUrlRewrite),
    Mirror(BackendTarget<'a>),
}

fn missing_configuration<T: serde::Serialize>(filter_type: &T) -> Rejection {
    unsupported(format!("{} filter has no configuration", wire_name(filter_type).unwrap_or_default()))
}

fn http_filter(filter: &HTTPRouteRulesFilters) -> Result<Filter<'_>, Rejection> {
    let missing = || missing_configuration(&filter.r#type);
    Ok(match filter.r#type {
        HTTPRouteRulesFiltersType::RequestHeaderModifier => Filter::RequestHeaders(filter.request_header_modifier.as_ref().ok_or_else(missing)?.into()),
        HTTPRouteRulesFiltersType::ResponseHeaderModifier => Filter::ResponseHeaders(filter.response_header_modifier.as_ref().ok_or_else(missing)?.into()),
        HTTPRouteRulesFiltersType::RequestRedirect => Filter::Redirect(filter.request_redirect.as_ref().ok_or_else(missing)?),
        HTTPRouteRulesFiltersType::UrlRewrite => Filter::Rewrite(filter.url_rewrite.as_ref().ok_or_else(missing)?),
        HTTPRouteRulesFiltersType::RequestMirror => Filter::Mirror((&filter.request_mirror.as_ref().ok_or_else(missing)?.backend_ref).into()),
        _ => {
            let name = wire_name(&filter.r#type).unwrap_or_default();
            return Err(unsupported(format!("filter {name} is not supported on {HTTP_ROUTE_KIND} rules")));
        },
    })
}

fn grpc_filter(filter: &GRPCRouteRulesFilters) -> Result<Filter<'_>, Rejection> {
    let missing = || missing_configuration(&filter.r#type);
    Ok(match filter.r#type {
        GRPCRouteRulesFiltersType::RequestHeaderModifier => Filter::RequestHeaders(filter.request_header_modifier.as_ref().ok_or_else(missing)?.into()),
        GRPCRouteRulesFiltersType::ResponseHeaderModifier => Filter::ResponseHeaders(filter.response_header_modifier.as_ref().ok_or_else(missing)?.into()),
        GRPCRouteRulesFiltersType::RequestMirror => Filter::Mirror((&filter.request_mirror.as_ref().ok_or_else(missing)?.backend_ref).into()),
        _ => {
            let name = wire_name(&filter.r#type).unwrap_or_default();
            return Err(unsupported(format!("filter {name} is not supported on {GRPC_ROUTE_KIND} rules")));
        },
    })
}

/// The parts shared by every route kind: identity, namespace and creation time.
struct RouteObject<'a> {
    key: ResourceKey,
    kind: &'static str,
    namespace: &'a str,
    origin: Origin,
}

impl<'a> RouteObject<'a> {
    fn new<R: Resource<DynamicType = ()>>(route: &'a R, kind: &'static str) -> Self {
        let key = ResourceKey::from_resource(route);
        Self {
            origin: Origin::new(key.clone(), Schema::GatewayApi, creation_timestamp(route)),
            key,
            kind,
            namespace: route.meta().namespace.as_deref().unwrap_or_default(),
        }
    }

    /// Attachments per parent reference this instance manages.
    fn attachments(
        &self,
        ctx: &mut BuildContext<'_>,
        gateways: &mut BTreeMap<NamespacedName, ResolvedGateway>,
        parents: &[ParentReference],
        hostnames: &[String],
    ) -> Vec<(Origin, Vec<Attachment>)> {
        let route = RouteRef {
            key: &self.key,
            kind: self.kind,
            namespace: self.namespace,
            hostnames,
        };
        parents
            .iter()
            .filter_map(|parent| {
                let origin = self.origin.with_parent(parent.clone());
                attach(ctx, gateways, &route, parent, &origin).map(|attachments| (origin, attachments))
            })
            .filter(|(_, attachments)| !attachments.is_empty())
            .collect()
    }
}

fn parents<P>(parent_refs: &[P]) -> Vec<ParentReference>
where
    for<'p> ParentReference: From<&'p P>,
{
    parent_refs.iter().map(ParentReference::from).collect()
}

fn emit(fragment: &mut Fragment, attachments: &[Attachment], origin: &Origin, routes: &[Route]) {
    for attachment in attachments {
        for hostname in &attachment.hostnames {
            let mut vhost = VirtualHostFragment::new(&attachment.decl.name, hostname, origin.clone());
            vhost.tls = attachment.tls.clone();
            vhost.routes = routes.to_vec();
            fragment.virtual_hosts.push(vhost);
        }
    }
}

pub fn http_route(ctx: &mut BuildContext<'_>, gateways: &mut BTreeMap<NamespacedName, ResolvedGateway>, route: &HTTPRoute, fragment: &mut Fragment) {
    let object = RouteObject::new(route, HTTP_ROUTE_KIND);
    let parents = parents(route.spec.parent_refs.listed());
    if !is_managed(gateways, object.namespace, &parents) {
        return;
    }
    ctx.status.touch(route);
    for (parent_origin, attachments) in object.attachments(ctx, gateways, &parents, route.spec.hostnames.listed()) {
        let mut routes = vec![];
        for (index, rule) in route.spec.rules.listed().iter().enumerate() {
            let origin = parent_origin.with_rule(index);
            match http_rule(ctx, &object, &origin, rule, fragment) {
                Ok(rule_routes) => routes.extend(rule_routes),
                Err(rejection) => rejection.record(ctx, &origin, Scope::Fragment),
            }
        }
        emit(fragment, &attachments, &parent_origin, &routes);
    }
}

pub fn grpc_route(ctx: &mut BuildContext<'_>, gateways: &mut BTreeMap<NamespacedName, ResolvedGateway>, route: &GRPCRoute, fragment: &mut Fragment) {
    let object = RouteObject::new(route, GRPC_ROUTE_KIND);
    let parents = parents(route.spec.parent_refs.listed());
    if !is_managed(gateways, object.namespace, &parents) {
        return;
    }
    ctx.status.touch(route);
    for (parent_origin, attachments) in object.attachments(ctx, gateways, &parents, route.spec.hostnames.listed()) {
        let mut routes = vec![];
        for (index, rule) in route.spec.rules.listed().iter().enumerate() {
            let origin = parent_origin.with_rule(index);
            match grpc_rule(ctx, &object, &origin, rule, fragment) {
                Ok(rule_routes) => routes.extend(rule_routes),
                Err(rejection) => rejection.record(ctx, &origin, Scope::Fragment),
            }
        }
        emit(fragment, &attachments, &parent_origin, &routes);
    }
}

pub fn tls_route(ctx: &mut BuildContext<'_>, gateways: &mut BTreeMap<NamespacedName, ResolvedGateway>, route: &TLSRoute, fragment: &mut Fragment) {
    let object = RouteObject::new(route, TLS_ROUTE_KIND);
    let parents = parents(route.spec.parent_refs.listed());
    if !is_managed(gateways, object.namespace, &parents) {
        return;
    }
    ctx.status.touch(route);
    let rules = route.spec.rules.listed();
    for (origin, attachments) in object.attachments(ctx, gateways, &parents, route.spec.hostnames.listed()) {
        let backends = rules.first().map(|rule| rule.backend_refs.listed().iter().map(BackendTarget::from).collect());
        let Some(proxy) = stream_proxy(ctx, &object, &origin, rules.len(), backends, fragment) else {
            continue;
        };
        for attachment in &attachments {
            for hostname in &attachment.hostnames {
                let mut vhost = VirtualHostFragment::new(&attachment.decl.name, hostname, origin.clone());
                vhost.tls = attachment.tls.clone();
                vhost.tcp_proxy = Some(proxy.clone());
                fragment.virtual_hosts.push(vhost);
            }
        }
    }
}

pub fn tcp_route(ctx: &mut BuildContext<'_>, gateways: &mut BTreeMap<NamespacedName, ResolvedGateway>, route: &TCPRoute, fragment: &mut Fragment) {
    let object = RouteObject::new(route, TCP_ROUTE_KIND);
    let parents = parents(route.spec.parent_refs.listed());
    if !is_managed(gateways, object.namespace, &parents) {
        return;
    }
    ctx.status.touch(route);
    let rules = route.spec.rules.listed();
    for (origin, attachments) in object.attachments(ctx, gateways, &parents, &[]) {
        let backends = rules.first().map(|rule| rule.backend_refs.listed().iter().map(BackendTarget::from).collect());
        let Some(proxy) = stream_proxy(ctx, &object, &origin, rules.len(), backends, fragment) else {
            continue;
        };
        for attachment in attachments {
            fragment.tcp.push(TcpFragment {
                listener: attachment.decl.name,
                origin: origin.clone(),
                proxy: proxy.clone(),
            });
        }
    }
}

fn http_rule(ctx: &mut BuildContext<'_>, object: &RouteObject<'_>, origin: &Origin, rule: &HTTPRouteRules, fragment: &mut Fragment) -> Result<Vec<Route>, Rejection> {
    let matches = if rule.matches.listed().is_empty() {
        vec![RouteMatch::default()]
    } else {
        rule.matches.listed().iter().map(http_match).collect::<Result<Vec<_>, _>>()?
    };
    for route_match in &matches {
        check_regexes(ctx, origin, route_match)?;
    }
    let filters = rule.filters.listed().iter().map(http_filter).collect::<Result<Vec<_>, _>>()?;
    let filters = RuleFilters::parse(ctx, object, filters, fragment)?;
    let timeout = rule
        .timeouts
        .as_ref()
        .and_then(|timeouts| timeouts.request.as_deref())
        .map(policies::parse_timeout)
        .transpose()?
        .map(|response| TimeoutPolicy {
            response,
            ..Default::default()
        });
    let action = match filters.redirect.clone() {
        Some(redirect) => RouteAction::Redirect(redirect),
        None => {
            let backends = rule
                .backend_refs
                .listed()
                .iter()
                .map(|backend| Backend {
                    target: backend.into(),
                    headers: http_backend_headers(backend.filters.listed()),
                })
                .collect();
            forward(ctx, object, origin, backends, None, fragment)
        },
    };
    let policies = filters.into_policies(ctx, timeout);
    Ok(matches
        .into_iter()
        .map(|route_match| Route {
            route_match,
            action: action.clone(),
            policies: policies.clone(),
            origin: origin.clone(),
        })
        .collect())
}

fn grpc_rule(ctx: &mut BuildContext<'_>, object: &RouteObject<'_>, origin: &Origin, rule: &GRPCRouteRules, fragment: &mut Fragment) -> Result<Vec<Route>, Rejection> {
    let matches = if rule.matches.listed().is_empty() {
        vec![RouteMatch::default()]
    } else {
        rule.matches.listed().iter().map(grpc_match).collect::<Result<Vec<_>, _>>()?
    };
    for route_match in &matches {
        check_regexes(ctx, origin, route_match)?;
    }
    let filters = rule.filters.listed().iter().map(grpc_filter).collect::<Result<Vec<_>, _>>()?;
    let filters = RuleFilters::parse(ctx, object, filters, fragment)?;
    let backends = rule
        .backend_refs
        .listed()
        .iter()
        .map(|backend| Backend {
            target: backend.into(),
            headers: grpc_backend_headers(backend.filters.listed()),
        })
        .collect();
    let action = forward(ctx, object, origin, backends, Some(GRPC_UPSTREAM_PROTOCOL), fragment);
    let policies = filters.into_policies(ctx, None);
    Ok(matches
        .into_iter()
        .map(|route_match| Route {
            route_match,
            action: action.clone(),
            policies: policies.clone(),
            origin: origin.clone(),
        })
        .collect())
}

fn http_match(route_match: &HTTPRouteRulesMatches) -> Result<RouteMatch, Rejection> {
    let path = match &route_match.path {
        None => PathMatch::root(),
        Some(path) => {
            let value = path.value.as_deref().unwrap_or("/");
            let regex = matches!(path.r#type, Some(HTTPRouteRulesMatchesPathType::RegularExpression));
            if !regex && !value.starts_with('/') {
                return Err(unsupported(format!("path {value} must start with /")));
            }
            match path.r#type {
                Some(HTTPRouteRulesMatchesPathType::Exact) => PathMatch::Exact(value.to_owned()),
                Some(HTTPRouteRulesMatchesPathType::RegularExpression) => PathMatch::Regex(value.to_owned()),
                Some(HTTPRouteRulesMatchesPathType::PathPrefix) | None => PathMatch::segment(value),
            }
        },
    };
    Ok(RouteMatch {
        path,
        headers: route_match
            .headers
            .listed()
            .iter()
            .map(|header| header_match(&header.name, &header.value, matches!(header.r#type, Some(HTTPRouteRulesMatchesHeadersType::RegularExpression))))
            .collect(),
        queries: route_match
            .query_params
            .listed()
            .iter()
            .map(|query| QueryMatch {
                name: query.name.clone(),
                matcher: string_match(&query.value, matches!(query.r#type, Some(HTTPRouteRulesMatchesQueryParamsType::RegularExpression))),
                ignore_case: false,
            })
            .collect(),
        method: route_match.method.as_ref().and_then(wire_name),
    })
}

/// gRPC methods are matched on the `/service/method` request path.
fn grpc_match(route_match: &GRPCRouteRulesMatches) -> Result<RouteMatch, Rejection> {
    let path = match &route_match.method {
        None => PathMatch::root(),
        Some(method) => {
            let service = method.service.as_deref().filter(|service| !service.is_empty());
            let name = method.method.as_deref().filter(|name| !name.is_empty());
            let regex = matches!(method.r#type, Some(GRPCRouteRulesMatchesMethodType::RegularExpression));
            match (regex, service, name) {
                (_, None, None) => return Err(unsupported("gRPC method match needs a service or a method")),
                (false, Some(service), Some(name)) => PathMatch::Exact(format!("/{service}/{name}")),
                (false, Some(service), None) => PathMatch::segment(&format!("/{service}/")),
                (false, None, Some(name)) => PathMatch::Regex(format!("/[^/]+/{}", regex::escape(name))),
                (true, service, name) => PathMatch::Regex(format!("/{}/{}", service.unwrap_or("[^/]+"), name.unwrap_or("[^/]+"))),
            }
        },
    };
    Ok(RouteMatch {
        path,
        headers: route_match
            .headers
            .listed()
            .iter()
            .map(|header| header_match(&header.name, &header.value, matches!(header.r#type, Some(GRPCRouteRulesMatchesHeadersType::RegularExpression))))
            .collect(),
        ..Default::default()
    })
}

fn string_match(value: &str, regex: bool) -> StringMatch {
    if regex {
        StringMatch::Regex(value.to_owned())
    } else {
        StringMatch::Exact(value.to_owned())
    }
}

fn header_match(name: &str, value: &str, regex: bool) -> HeaderMatch {
    HeaderMatch {
        name: name.to_lowercase(),
        matcher: string_match(value, regex),
        invert: false,
        ignore_case: false,
        treat_missing_as_empty: false,
    }
}

#[derive(Default)]
struct RuleFilters {
    request_headers: HeaderPolicy,
    response_headers: HeaderPolicy,
    redirect: Option<Redirect>,
    rewrite: Option<Rewrite>,
    mirrors: Vec<String>,
}

impl RuleFilters {
    fn parse(ctx: &mut BuildContext<'_>, object: &RouteObject<'_>, filters: Vec<Filter<'_>>, fragment: &mut Fragment) -> Result<Self, Rejection> {
        let mut parsed = Self::default();
        for filter in filters {
            match filter {
                Filter::RequestHeaders(policy) => parsed.request_headers = policy,
                Filter::ResponseHeaders(policy) => parsed.response_headers = policy,
                Filter::Redirect(redirect) => parsed.redirect = Some(redirect_action(redirect)?),
                Filter::Rewrite(rewrite) => {
                    parsed.rewrite = Some(Rewrite {
                        hostname: rewrite.hostname.clone(),
                        path: rewrite
                            .path
                            .as_ref()
                            .map(|path| {
                                let full_path = matches!(path.r#type, HTTPRouteRulesFiltersUrlRewritePathType::ReplaceFullPath);
                                path_rewrite(full_path, path.replace_full_path.as_ref(), path.replace_prefix_match.as_ref())
                            })
                            .transpose()?,
                    });
                },
                Filter::Mirror(target) => {
                    let cluster = backend_cluster(ctx, object, &target)?;
                    parsed.mirrors.push(fragment.add_cluster(cluster.named()));
                },
            }
        }
        if parsed.redirect.is_some() && parsed.rewrite.is_some() {
            return Err(unsupported("RequestRedirect and URLRewrite cannot be combined"));
        }
        Ok(parsed)
    }

    fn into_policies(self, ctx: &BuildContext<'_>, timeout: Option<TimeoutPolicy>) -> RoutePolicies {
        let default_request = policies::default_headers(&ctx.config.default_request_headers);
        let default_response = policies::default_headers(&ctx.config.default_response_headers);
        RoutePolicies {
            timeout,
            request_headers: policies::merge_headers(&[&self.request_headers, &default_request]),
            response_headers: policies::merge_headers(&[&self.response_headers, &default_response]),
            mirrors: self.mirrors,
            rewrite: self.rewrite,
            ..Default::default()
        }
    }
}

fn redirect_action(redirect: &HTTPRouteRulesFiltersRequestRedirect) -> Result<Redirect, Rejection> {
    let status_code = redirect
        .status_code
        .map(|code| u16::try_from(code).map_err(|_| unsupported(format!("redirect status code {code} is out of range"))))
        .transpose()?;
    Ok(Redirect {
        scheme: redirect.scheme.as_ref().and_then(wire_name),
        hostname: redirect.hostname.clone(),
        port: redirect
            .port
            .map(|port| u16::try_from(port).map_err(|_| unsupported(format!("redirect port {port} is out of range"))))
            .transpose()?,
        path: redirect
            .path
            .as_ref()
            .map(|path| {
                let full_path = matches!(path.r#type, HTTPRouteRulesFiltersRequestRedirectPathType::ReplaceFullPath);
                path_rewrite(full_path, path.replace_full_path.as_ref(), path.replace_prefix_match.as_ref())
            })
            .transpose()?,
        status_code: policies::redirect_status(status_code)?,
    })
}

fn path_rewrite(full_path: bool, replace_full_path: Option<&String>, replace_prefix_match: Option<&String>) -> Result<PathRewrite, Rejection> {
    match (full_path, replace_full_path, replace_prefix_match) {
        (true, Some(path), _) => Ok(PathRewrite::ReplaceFullPath(path.clone())),
        (false, _, Some(prefix)) => Ok(PathRewrite::ReplacePrefix(prefix.clone())),
        (true, None, _) => Err(unsupported("ReplaceFullPath modifier is missing its value")),
        (false, _, None) => Err(unsupported("ReplacePrefixMatch modifier is missing its value")),
    }
}

/// Resolves a Service backend, honouring ReferenceGrants for references into other
/// namespaces.
fn backend_cluster(ctx: &BuildContext<'_>, object: &RouteObject<'_>, backend: &BackendTarget<'_>) -> Result<Cluster, Rejection> {
    let group = backend.group.unwrap_or(CORE_GROUP_NAME);
    let kind = backend.kind.unwrap_or(SERVICE_KIND);
    if group != CORE_GROUP_NAME || kind != SERVICE_KIND {
        return Err(Rejection::new(
            ErrorKind::MalformedReference,
            reason::INVALID_KIND,
            format!("backend {} of kind {kind} is not a Service", backend.name),
        ));
    }
    let namespace = backend.namespace.unwrap_or(object.namespace);
    let permitted = ReferenceGrants::new(ctx.objects).allows(
        ReferenceFrom {
            group: GATEWAY_GROUP_NAME,
            kind: object.kind,
            namespace: object.namespace,
        },
        ReferenceTo {
            group: CORE_GROUP_NAME,
            kind: SERVICE_KIND,
            namespace,
            name: backend.name,
        },
    );
    let service = NamespacedName::new(namespace, backend.name);
    if !permitted {
        return Err(Rejection::new(
            ErrorKind::MalformedReference,
            reason::REF_NOT_PERMITTED,
            format!("reference to service {service} is not permitted by any ReferenceGrant"),
        ));
    }
    let port = backend
        .port
        .ok_or_else(|| Rejection::new(ErrorKind::MalformedReference, reason::BACKEND_NOT_FOUND, format!("backend {service} needs a port")))?;
    resolve_backend(ctx.objects, &service, port).map_err(|e| Rejection::new(ErrorKind::MalformedReference, reason::BACKEND_NOT_FOUND, e.to_string()))
}

fn weight(backend: &BackendTarget<'_>) -> u32 {
    backend.weight.map_or(1, |weight| u32::try_from(weight).unwrap_or_default())
}

/// Valid backends of a rule. Invalid ones are reported and dropped; a rule left without any
/// answers 500.
fn forward(
    ctx: &mut BuildContext<'_>,
    object: &RouteObject<'_>,
    origin: &Origin,
    backends: Vec<Backend<'_>>,
    default_protocol: Option<&str>,
    fragment: &mut Fragment,
) -> RouteAction {
    let mut clusters = vec![];
    for backend in backends {
        let resolved = backend_cluster(ctx, object, &backend.target).and_then(|mut cluster| {
            let headers = backend.headers?;
            if let Some(request) = headers.request {
                cluster.request_headers = request;
            }
            if let Some(response) = headers.response {
                cluster.response_headers = response;
            }
            if let Some(protocol) = default_protocol {
                cluster.protocol.get_or_insert_with(|| protocol.to_owned());
            }
            Ok(cluster)
        });
        match resolved {
            Ok(cluster) => clusters.push(WeightedCluster {
                cluster: fragment.add_cluster(cluster.named()),
                weight: weight(&backend.target),
            }),
            Err(rejection) => rejection.record(ctx, origin, Scope::Fragment),
        }
    }
    if clusters.iter().all(|cluster| cluster.weight == 0) {
        debug!("Rule {} of {} has no usable backend", origin.rule, origin.key);
        RouteAction::DirectResponse(DirectResponse { status_code: 500, body: None })
    } else {
        RouteAction::Forward(clusters)
    }
}

/// The TCP proxy of a TLSRoute or TCPRoute, built from the backends of its first rule.
fn stream_proxy(
    ctx: &mut BuildContext<'_>,
    object: &RouteObject<'_>,
    origin: &Origin,
    rule_count: usize,
    backends: Option<Vec<BackendTarget<'_>>>,
    fragment: &mut Fragment,
) -> Option<TcpProxy> {
    let Some(backends) = backends else {
        unsupported(format!("{} has no rules", object.kind)).record(ctx, origin, Scope::Object);
        return None;
    };
    if rule_count > 1 {
        unsupported(format!("{} supports a single rule, the others are ignored", object.kind)).record(ctx, origin, Scope::Fragment);
    }
    let mut clusters = vec![];
    for backend in &backends {
        match backend_cluster(ctx, object, backend) {
            Ok(cluster) => clusters.push(WeightedCluster {
                cluster: fragment.add_cluster(cluster.named()),
                weight: weight(backend),
            }),
            Err(rejection) => rejection.record(ctx, origin, Scope::Fragment),
        }
    }
    if clusters.is_empty() {
        Rejection::new(ErrorKind::MalformedReference, reason::BACKEND_NOT_FOUND, format!("{} has no valid backend", object.kind)).record(
            ctx,
            origin,
            Scope::Object,
        );
        return None;
    }
    Some(TcpProxy { clusters })
}
