use std::collections::{btree_map::Entry, BTreeMap, BTreeSet};

use gateway_api::apis::standard::gateways::{
    GatewayListeners, GatewayListenersAllowedRoutes, GatewayListenersAllowedRoutesNamespacesFrom, GatewayListenersAllowedRoutesNamespacesSelector, GatewayListenersTls,
    GatewayListenersTlsMode, GatewayStatusListenersSupportedKinds,
};
use thiserror::Error;
use tracing::debug;

use super::super::BuildContext;
use crate::{
    common::{reason, ConditionSet, ErrorKind, Listed, NamespacedName, Scope, CORE_GROUP_NAME, GATEWAY_GROUP_NAME, GATEWAY_KIND, SECRET_KIND},
    configuration::DagConfiguration,
    dag::{
        fragment::{Fragment, ListenerDecl},
        hostname,
        references::{ReferenceFrom, ReferenceGrants, ReferenceTo},
        secrets::SecretError,
        ListenerProtocol, VirtualHostTls,
    },
    state::Objects,
};

pub const HTTP_ROUTE_KIND: &str = "HTTPRoute";
pub const GRPC_ROUTE_KIND: &str = "GRPCRoute";
pub const TLS_ROUTE_KIND: &str = "TLSRoute";
pub const TCP_ROUTE_KIND: &str = "TCPRoute";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolType {
    Http,
    Https,
    Tls,
    Tcp,
}

impl TryFrom<&str> for ProtocolType {
    type Error = ListenerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(match value.to_uppercase().as_str() {
            "HTTP" => Self::Http,
            "HTTPS" => Self::Https,
            "TLS" => Self::Tls,
            "TCP" => Self::Tcp,
            _ => return Err(ListenerError::UnsupportedProtocol(value.to_owned())),
        })
    }
}

impl ProtocolType {
    fn route_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Http | Self::Https => &[HTTP_ROUTE_KIND, GRPC_ROUTE_KIND],
            Self::Tls => &[TLS_ROUTE_KIND],
            Self::Tcp => &[TCP_ROUTE_KIND],
        }
    }

    fn listener_protocol(self) -> ListenerProtocol {
        match self {
            Self::Http => ListenerProtocol::Http,
            Self::Https | Self::Tls => ListenerProtocol::Https,
            Self::Tcp => ListenerProtocol::Tcp,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("protocol {0} is not supported")]
    UnsupportedProtocol(String),
    #[error("port {0} is not a valid port number")]
    InvalidPort(i32),
    #[error("hostname {0} is not valid")]
    InvalidHostname(String),
    #[error("{protocol} listeners require TLS mode {expected}")]
    UnsupportedTlsMode { protocol: &'static str, expected: &'static str },
    #[error("HTTPS listeners require a certificate reference")]
    MissingCertificate,
    #[error("certificate reference {0} must point to a core Secret")]
    CertificateKind(String),
    #[error("certificate reference to {0} is not permitted by any ReferenceGrant")]
    CertificateNotPermitted(NamespacedName),
    #[error(transparent)]
    InvalidCertificate(#[from] SecretError),
    #[error("route kind {0} is not supported by this listener")]
    InvalidRouteKind(String),
}

impl ListenerError {
    pub fn record(&self, conditions: &mut ConditionSet) {
        let (kind, scope, reason) = match self {
            Self::UnsupportedProtocol(_) => (ErrorKind::InvalidShape, Scope::Object, reason::UNSUPPORTED_PROTOCOL),
            Self::InvalidPort(_) | Self::InvalidHostname(_) => (ErrorKind::InvalidShape, Scope::Object, reason::UNSUPPORTED_VALUE),
            Self::UnsupportedTlsMode { .. } => (ErrorKind::InvalidShape, Scope::Object, reason::UNSUPPORTED_TLS_MODE),
            Self::MissingCertificate | Self::CertificateKind(_) | Self::InvalidCertificate(_) => {
                (ErrorKind::MalformedReference, Scope::Fragment, reason::INVALID_CERTIFICATE_REF)
            },
            Self::CertificateNotPermitted(_) => (ErrorKind::MalformedReference, Scope::Fragment, reason::REF_NOT_PERMITTED),
            Self::InvalidRouteKind(_) => (ErrorKind::MalformedReference, Scope::Fragment, reason::INVALID_ROUTE_KINDS),
        };
        conditions.record(kind, scope, reason, self.to_string());
    }
}

/// A Gateway listener that passed validation, together with everything routes need to
/// attach to it.
#[derive(Clone, Debug)]
pub struct ResolvedListener {
    pub name: String,
    pub port: i32,
    pub protocol: ProtocolType,
    pub hostname: Option<String>,
    pub decl: ListenerDecl,
    pub tls: Option<VirtualHostTls>,
    pub allowed_routes: GatewayListenersAllowedRoutes,
    pub supported_kinds: Vec<GatewayStatusListenersSupportedKinds>,
    pub conditions: ConditionSet,
    pub attached_routes: i32,
    usable: bool,
}

impl ResolvedListener {
    /// Whether routes may attach. Listeners with unresolved certificates or conflicts take no
    /// routes.
    pub fn is_ready(&self) -> bool {
        self.usable && !self.conditions.is_rejected() && !self.conditions.is_conflicted()
    }

    pub fn allows_kind(&self, kind: &str) -> bool {
        self.supported_kinds.iter().any(|supported| supported.kind == kind)
    }

    pub fn allows_namespace(&self, objects: &Objects, gateway_namespace: &str, route_namespace: &str) -> bool {
        let namespaces = self.allowed_routes.namespaces.as_ref();
        match namespaces.and_then(|namespaces| namespaces.from.as_ref()) {
            Some(GatewayListenersAllowedRoutesNamespacesFrom::All) => true,
            Some(GatewayListenersAllowedRoutesNamespacesFrom::Selector) => namespaces
                .and_then(|namespaces| namespaces.selector.as_ref())
                .is_some_and(|selector| selector_matches(selector, objects.namespace_labels(route_namespace))),
            Some(GatewayListenersAllowedRoutesNamespacesFrom::Same) | None => gateway_namespace == route_namespace,
        }
    }
}

fn selector_matches(selector: &GatewayListenersAllowedRoutesNamespacesSelector, labels: Option<&BTreeMap<String, String>>) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    let labels_match = selector.match_labels.iter().flatten().all(|(key, value)| labels.get(key) == Some(value));
    let expressions_match = selector.match_expressions.iter().flatten().all(|expression| {
        let values = expression.values.as_deref().unwrap_or_default();
        let label = labels.get(&expression.key);
        match expression.operator.as_str() {
            "In" => label.is_some_and(|label| values.contains(label)),
            "NotIn" => label.is_none_or(|label| !values.contains(label)),
            "Exists" => label.is_some(),
            "DoesNotExist" => label.is_none(),
            _ => false,
        }
    });
    labels_match && expressions_match
}

/// Gateway listeners on the configured HTTP or HTTPS port share the listener HTTPProxy and
/// Ingress use; any other port gets its own graph listener.
fn listener_decl(config: &DagConfiguration, protocol: ProtocolType, port: u16) -> ListenerDecl {
    let protocol = protocol.listener_protocol();
    let (configured, prefix) = match protocol {
        ListenerProtocol::Http => (&config.http_listener, "http"),
        ListenerProtocol::Https => (&config.https_listener, "https"),
        ListenerProtocol::Tcp => (&config.http_listener, "tcp"),
    };
    let name = if protocol != ListenerProtocol::Tcp && configured.port == port {
        configured.name.clone()
    } else {
        format!("{prefix}-{port}")
    };
    ListenerDecl {
        name,
        address: configured.address.clone(),
        port,
        protocol,
        sticky: true,
    }
}

pub fn resolve_listener(
    ctx: &mut BuildContext<'_>,
    gateway_namespace: &str,
    listener: &GatewayListeners,
    fragment: &mut Fragment,
) -> Result<ResolvedListener, ListenerError> {
    let protocol = ProtocolType::try_from(listener.protocol.as_str())?;
    let port = u16::try_from(listener.port)
        .ok()
        .filter(|port| *port != 0)
        .ok_or(ListenerError::InvalidPort(listener.port))?;
    let hostname = listener.hostname.as_deref().filter(|hostname| !hostname.is_empty()).map(str::to_ascii_lowercase);
    if let Some(hostname) = &hostname {
        if !hostname::is_valid_hostname(hostname) {
            return Err(ListenerError::InvalidHostname(hostname.clone()));
        }
    }

    let passthrough = matches!(listener.tls.as_ref().and_then(|tls| tls.mode.as_ref()), Some(GatewayListenersTlsMode::Passthrough));
    let mut conditions = ConditionSet::default();
    let mut usable = true;
    let tls = match protocol {
        ProtocolType::Https if passthrough => {
            return Err(ListenerError::UnsupportedTlsMode {
                protocol: "HTTPS",
                expected: "Terminate",
            });
        },
        ProtocolType::Https => match certificate(ctx, gateway_namespace, listener.tls.as_ref(), fragment) {
            Ok(secret) => Some(VirtualHostTls {
                secret: Some(secret),
                ..Default::default()
            }),
            Err(e) => {
                e.record(&mut conditions);
                usable = false;
                None
            },
        },
        ProtocolType::Tls if !passthrough => {
            return Err(ListenerError::UnsupportedTlsMode {
                protocol: "TLS",
                expected: "Passthrough",
            });
        },
        ProtocolType::Tls => Some(VirtualHostTls {
            passthrough: true,
            ..Default::default()
        }),
        ProtocolType::Http | ProtocolType::Tcp => None,
    };

    let allowed_routes = listener.allowed_routes.clone().unwrap_or_default();
    let supported_kinds = supported_kinds(protocol, &allowed_routes, &mut conditions);
    Ok(ResolvedListener {
        name: listener.name.clone(),
        port: listener.port,
        protocol,
        hostname,
        decl: listener_decl(ctx.config, protocol, port),
        tls,
        allowed_routes,
        supported_kinds,
        conditions,
        attached_routes: 0,
        usable,
    })
}

fn certificate(ctx: &mut BuildContext<'_>, gateway_namespace: &str, tls: Option<&GatewayListenersTls>, fragment: &mut Fragment) -> Result<String, ListenerError> {
    let reference = tls.and_then(|tls| tls.certificate_refs.listed().first()).ok_or(ListenerError::MissingCertificate)?;
    let group = reference.group.as_deref().unwrap_or(CORE_GROUP_NAME);
    let kind = reference.kind.as_deref().unwrap_or(SECRET_KIND);
    if group != CORE_GROUP_NAME || kind != SECRET_KIND {
        return Err(ListenerError::CertificateKind(reference.name.clone()));
    }
    let name = NamespacedName::new(reference.namespace.as_deref().unwrap_or(gateway_namespace), &reference.name);
    let permitted = ReferenceGrants::new(ctx.objects).allows(
        ReferenceFrom {
            group: GATEWAY_GROUP_NAME,
            kind: GATEWAY_KIND,
            namespace: gateway_namespace,
        },
        ReferenceTo {
            group: CORE_GROUP_NAME,
            kind: SECRET_KIND,
            namespace: &name.namespace,
            name: &name.name,
        },
    );
    if !permitted {
        return Err(ListenerError::CertificateNotPermitted(name));
    }
    Ok(fragment.add_secret(ctx.secrets.keypair(&name)?))
}

fn supported_kinds(protocol: ProtocolType, allowed_routes: &GatewayListenersAllowedRoutes, conditions: &mut ConditionSet) -> Vec<GatewayStatusListenersSupportedKinds> {
    let native = protocol.route_kinds();
    let kind = |kind: &str| GatewayStatusListenersSupportedKinds {
        group: Some(GATEWAY_GROUP_NAME.to_owned()),
        kind: kind.to_owned(),
    };
    let requested_kinds = allowed_routes.kinds.listed();
    if requested_kinds.is_empty() {
        return native.iter().map(|native| kind(native)).collect();
    }
    let mut kinds = vec![];
    for requested in requested_kinds {
        let group_matches = requested.group.as_deref().is_none_or(|group| group == GATEWAY_GROUP_NAME);
        if group_matches && native.contains(&requested.kind.as_str()) {
            kinds.push(kind(&requested.kind));
        } else {
            ListenerError::InvalidRouteKind(requested.kind.clone()).record(conditions);
        }
    }
    kinds
}

/// Port sharing rules: HTTPS and TLS listeners may share a port, anything else on a port must
/// use one protocol. Listeners sharing a port must use distinct hostnames.
pub fn detect_conflicts(listeners: &mut [ResolvedListener]) {
    let mut by_port: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (index, listener) in listeners.iter().enumerate() {
        by_port.entry(listener.port).or_default().push(index);
    }

    for (port, indices) in by_port {
        let protocols: BTreeSet<ListenerProtocol> = indices.iter().map(|index| listeners[*index].protocol.listener_protocol()).collect();
        if protocols.len() > 1 {
            for index in &indices {
                listeners[*index]
                    .conditions
                    .conflict(reason::PROTOCOL_CONFLICT, format!("port {port} is used by listeners with incompatible protocols"));
            }
            continue;
        }

        let mut by_hostname: BTreeMap<Option<String>, Vec<usize>> = BTreeMap::new();
        for index in indices {
            by_hostname.entry(listeners[index].hostname.clone()).or_default().push(index);
        }
        for (hostname, same) in by_hostname.into_iter().filter(|(_, same)| same.len() > 1) {
            let hostname = hostname.unwrap_or_else(|| "*".to_owned());
            for index in same {
                listeners[index]
                    .conditions
                    .conflict(reason::HOSTNAME_CONFLICT, format!("hostname {hostname} is used by more than one listener on port {port}"));
            }
        }
    }
}

/// The protocol each port is bound to, seeded with the configured listeners and extended by
/// every Gateway in claim order. A listener whose port is already bound to another protocol
/// loses; two listeners agreeing on the protocol share the port.
pub struct PortClaims {
    claims: BTreeMap<i32, (ListenerProtocol, String)>,
}

impl PortClaims {
    pub fn new(config: &DagConfiguration) -> Self {
        let claims = [(&config.http_listener, ListenerProtocol::Http), (&config.https_listener, ListenerProtocol::Https)]
            .into_iter()
            .map(|(listener, protocol)| (i32::from(listener.port), (protocol, format!("listener {}", listener.name))))
            .collect();
        Self { claims }
    }

    pub fn claim(&mut self, gateway: &NamespacedName, listeners: &mut [ResolvedListener]) {
        for listener in listeners.iter_mut().filter(|listener| listener.is_ready()) {
            let protocol = listener.protocol.listener_protocol();
            match self.claims.entry(listener.port) {
                Entry::Vacant(entry) => {
                    entry.insert((protocol, format!("gateway {gateway}")));
                },
                Entry::Occupied(entry) => {
                    let (claimed, owner) = entry.get();
                    if *claimed != protocol {
                        debug!("Listener {} of gateway {gateway} conflicts with {owner} on port {}", listener.name, listener.port);
                        listener.conditions.conflict(
                            reason::PROTOCOL_CONFLICT,
                            format!("port {} is already used by {owner} with an incompatible protocol", listener.port),
                        );
                    }
                },
            }
        }
    }
}
