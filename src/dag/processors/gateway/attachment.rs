use std::collections::{BTreeMap, BTreeSet};

use super::{listeners::ResolvedListener, ResolvedGateway};
use crate::{
    common::{reason, ErrorKind, NamespacedName, ParentReference, ResourceKey, Scope, DEFAULT_ROUTE_HOSTNAME, GATEWAY_GROUP_NAME, GATEWAY_KIND},
    dag::{
        fragment::ListenerDecl,
        hostname,
        processors::{BuildContext, Rejection},
        Origin, VirtualHostTls,
    },
};

/// Where one route lands on one listener.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub decl: ListenerDecl,
    pub tls: Option<VirtualHostTls>,
    pub hostnames: Vec<String>,
}

pub struct RouteRef<'a> {
    pub key: &'a ResourceKey,
    pub kind: &'a str,
    pub namespace: &'a str,
    pub hostnames: &'a [String],
}

/// The Gateway a parent reference points at, when it points at a Gateway at all.
pub fn parent_gateway(route_namespace: &str, parent: &ParentReference) -> Option<NamespacedName> {
    let group = parent.group.as_deref().unwrap_or(GATEWAY_GROUP_NAME);
    let kind = parent.kind.as_deref().unwrap_or(GATEWAY_KIND);
    (group == GATEWAY_GROUP_NAME && kind == GATEWAY_KIND).then(|| NamespacedName::new(parent.namespace.as_deref().unwrap_or(route_namespace), &parent.name))
}

/// Whether any parent of a route is a Gateway this instance manages.
pub fn is_managed(gateways: &BTreeMap<NamespacedName, ResolvedGateway>, route_namespace: &str, parents: &[ParentReference]) -> bool {
    parents
        .iter()
        .filter_map(|parent| parent_gateway(route_namespace, parent))
        .any(|gateway| gateways.contains_key(&gateway))
}

/// Attaches a route to the listeners selected by one parent reference. Returns `None` for
/// parents this instance does not manage, which get no status at all; otherwise every
/// reason for not attaching is recorded against the parent.
pub fn attach(
    ctx: &mut BuildContext<'_>,
    gateways: &mut BTreeMap<NamespacedName, ResolvedGateway>,
    route: &RouteRef<'_>,
    parent: &ParentReference,
    origin: &Origin,
) -> Option<Vec<Attachment>> {
    let gateway = gateways.get_mut(&parent_gateway(route.namespace, parent)?)?;
    ctx.status.entry(route.key).parents.entry(parent.clone()).or_default();

    if let Some(invalid) = route.hostnames.iter().find(|host| !hostname::is_valid_hostname(host)) {
        Rejection::new(ErrorKind::InvalidShape, reason::UNSUPPORTED_VALUE, format!("hostname {invalid} is not valid")).record(ctx, origin, Scope::Object);
        return Some(vec![]);
    }

    let selected: Vec<usize> = gateway
        .listeners
        .iter()
        .enumerate()
        .filter(|(_, listener)| {
            listener.is_ready()
                && parent.section_name.as_deref().is_none_or(|section| section == listener.name)
                && parent.port.is_none_or(|port| port == listener.port)
        })
        .map(|(index, _)| index)
        .collect();
    if selected.is_empty() {
        let message = format!("no ready listener of gateway {} matches the parent reference", gateway.name);
        Rejection::new(ErrorKind::Unreachable, reason::NO_MATCHING_PARENT, message).record(ctx, origin, Scope::Object);
        return Some(vec![]);
    }

    let allowed: Vec<usize> = selected
        .into_iter()
        .filter(|index| {
            let listener = &gateway.listeners[*index];
            listener.allows_kind(route.kind) && listener.allows_namespace(ctx.objects, &gateway.name.namespace, route.namespace)
        })
        .collect();
    if allowed.is_empty() {
        let message = format!("no listener of gateway {} allows {} routes from namespace {}", gateway.name, route.kind, route.namespace);
        Rejection::new(ErrorKind::Unreachable, reason::NOT_ALLOWED_BY_LISTENERS, message).record(ctx, origin, Scope::Object);
        return Some(vec![]);
    }

    let mut attachments = vec![];
    for index in allowed {
        let hostnames = effective_hostnames(&gateway.listeners, index, route.hostnames);
        if hostnames.is_empty() {
            continue;
        }
        let listener = &mut gateway.listeners[index];
        listener.attached_routes += 1;
        attachments.push(Attachment {
            decl: listener.decl.clone(),
            tls: listener.tls.clone(),
            hostnames,
        });
    }
    if attachments.is_empty() {
        let message = format!("no hostname of the route matches a listener of gateway {}", gateway.name);
        Rejection::new(ErrorKind::Unreachable, reason::NO_MATCHING_LISTENER_HOSTNAME, message).record(ctx, origin, Scope::Object);
    }
    Some(attachments)
}

/// Route hostnames intersected with the listener hostname, minus the ones a more specific
/// listener on the same port claims.
fn effective_hostnames(listeners: &[ResolvedListener], index: usize, route_hostnames: &[String]) -> Vec<String> {
    let listener = &listeners[index];
    let siblings: Vec<Option<&str>> = listeners
        .iter()
        .filter(|other| other.port == listener.port && other.is_ready())
        .map(|other| other.hostname.as_deref())
        .collect();
    let requested: Vec<String> = if route_hostnames.is_empty() {
        vec![DEFAULT_ROUTE_HOSTNAME.to_owned()]
    } else {
        route_hostnames.iter().map(|host| host.to_ascii_lowercase()).collect()
    };
    requested
        .iter()
        .filter_map(|host| hostname::intersect(listener.hostname.as_deref(), host))
        .filter(|host| hostname::owned_by_listener(listener.hostname.as_deref(), &siblings, host))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
