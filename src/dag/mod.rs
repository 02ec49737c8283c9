//! The routing graph: listeners own virtual hosts, virtual hosts own ordered routes, routes
//! point at clusters, and TLS material is carried as validated secrets. A graph is built from
//! scratch on every rebuild and never mutated once frozen into a [`Snapshot`].

mod assembler;
mod builder;
pub mod conflict;
mod fragment;
pub mod hostname;
pub mod matching;
pub mod ordering;
pub mod policies;
pub mod processors;
pub mod references;
pub mod secrets;
pub mod status;
#[cfg(test)]
pub(crate) mod test_support;

use std::{
    collections::BTreeMap,
    hash::{DefaultHasher, Hash, Hasher},
    time::Duration,
};

pub use assembler::Assembler;
pub use builder::{BuildError, BuildOutput, DagBuilder};
pub use conflict::{CrossSchemaPolicy, Origin, Schema};
pub use fragment::{Fragment, ListenerDecl, TcpFragment, VirtualHostFragment};
use serde::Serialize;

use crate::{
    apis::httpproxy::{HTTPHealthCheckPolicy, RateLimitPolicy},
    common::NamespacedName,
};
use matching::RouteMatch;

/// One immutable build result. `version` increases with every successful build and is kept
/// out of the graph so that equal inputs produce equal graphs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub version: u64,
    pub dag: Dag,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Dag {
    pub listeners: BTreeMap<String, Listener>,
    pub clusters: BTreeMap<String, Cluster>,
    pub secrets: BTreeMap<String, Secret>,
}

impl Dag {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn virtual_host(&self, listener: &str, hostname: &str) -> Option<&VirtualHost> {
        self.listeners.get(listener).and_then(|listener| listener.virtual_hosts.get(hostname))
    }

    pub fn route_count(&self) -> usize {
        self.listeners
            .values()
            .flat_map(|listener| listener.virtual_hosts.values())
            .map(|vhost| vhost.routes.len())
            .sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ListenerProtocol {
    Http,
    Https,
    Tcp,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub virtual_hosts: BTreeMap<String, VirtualHost>,
    pub tcp_proxy: Option<TcpProxy>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VirtualHost {
    pub hostname: String,
    pub routes: Vec<Route>,
    pub tls: Option<VirtualHostTls>,
    /// Set for TLS passthrough or TLS terminated TCP proxying.
    pub tcp_proxy: Option<TcpProxy>,
    pub rate_limit: Option<RateLimitPolicy>,
    pub authorization: Option<ExternalAuthorization>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct VirtualHostTls {
    /// Key of the serving keypair in [`Dag::secrets`]; absent for passthrough.
    pub secret: Option<String>,
    pub passthrough: bool,
    pub minimum_protocol_version: Option<String>,
    pub client_validation: Option<String>,
    pub fallback_certificate: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum FilterOrder {
    #[default]
    RateLimitThenAuthorization,
    AuthorizationThenRateLimit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExternalAuthorization {
    pub cluster: String,
    pub fail_open: bool,
    pub response_timeout: Option<Timeout>,
    pub context: BTreeMap<String, String>,
    pub order: FilterOrder,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Route {
    pub route_match: RouteMatch,
    pub action: RouteAction,
    pub policies: RoutePolicies,
    pub origin: Origin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum RouteAction {
    Forward(Vec<WeightedCluster>),
    Redirect(Redirect),
    DirectResponse(DirectResponse),
}

impl RouteAction {
    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        let clusters = match self {
            Self::Forward(clusters) => clusters.as_slice(),
            Self::Redirect(_) | Self::DirectResponse(_) => &[],
        };
        clusters.iter().map(|c| c.cluster.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WeightedCluster {
    pub cluster: String,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PathRewrite {
    ReplaceFullPath(String),
    ReplacePrefix(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Redirect {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub path: Option<PathRewrite>,
    pub status_code: u16,
}

impl Redirect {
    pub fn to_https() -> Self {
        Self {
            scheme: Some("https".to_owned()),
            status_code: 301,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DirectResponse {
    pub status_code: u16,
    pub body: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Rewrite {
    pub hostname: Option<String>,
    pub path: Option<PathRewrite>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Timeout {
    #[default]
    Default,
    Infinite,
    Duration(Duration),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutPolicy {
    pub response: Timeout,
    pub idle: Timeout,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub count: u32,
    pub per_try_timeout: Timeout,
    pub retry_on: Vec<String>,
    pub retriable_status_codes: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HeaderPolicy {
    pub set: BTreeMap<String, String>,
    pub add: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

impl HeaderPolicy {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.add.is_empty() && self.remove.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuthorizationContext {
    pub disabled: bool,
    pub context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RoutePolicies {
    pub timeout: Option<TimeoutPolicy>,
    pub retry: Option<RetryPolicy>,
    pub request_headers: HeaderPolicy,
    pub response_headers: HeaderPolicy,
    pub rate_limit: Option<RateLimitPolicy>,
    pub authorization: Option<AuthorizationContext>,
    pub mirrors: Vec<String>,
    pub websockets: bool,
    pub rewrite: Option<Rewrite>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct UpstreamValidation {
    pub ca_secret: String,
    pub subject_name: String,
}

/// A backend service reference. Endpoints are resolved by the consumer of the graph.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Cluster {
    pub name: String,
    pub service: NamespacedName,
    pub port: i32,
    pub protocol: Option<String>,
    pub external_name: Option<String>,
    pub load_balancer_strategy: Option<String>,
    pub upstream_validation: Option<UpstreamValidation>,
    pub health_check: Option<HTTPHealthCheckPolicy>,
    pub request_headers: HeaderPolicy,
    pub response_headers: HeaderPolicy,
}

impl Cluster {
    pub fn new(service: NamespacedName, port: i32) -> Self {
        Self {
            name: String::new(),
            service,
            port,
            protocol: None,
            external_name: None,
            load_balancer_strategy: None,
            upstream_validation: None,
            health_check: None,
            request_headers: HeaderPolicy::default(),
            response_headers: HeaderPolicy::default(),
        }
    }

    /// Names the cluster after its service and port, adding a digest of the remaining settings
    /// when any are set so that differently configured uses of one service stay apart.
    #[must_use]
    pub fn named(mut self) -> Self {
        let base = format!("{}/{}/{}", self.service.namespace, self.service.name, self.port);
        let plain = Cluster::new(self.service.clone(), self.port);
        let settings = (
            &self.protocol,
            &self.external_name,
            &self.load_balancer_strategy,
            &self.upstream_validation,
            self.health_check.as_ref().map(|h| serde_json::to_string(h).unwrap_or_default()),
            serde_json::to_string(&self.request_headers).unwrap_or_default(),
            serde_json::to_string(&self.response_headers).unwrap_or_default(),
        );
        let plain_settings = (
            &plain.protocol,
            &plain.external_name,
            &plain.load_balancer_strategy,
            &plain.upstream_validation,
            None::<String>,
            serde_json::to_string(&plain.request_headers).unwrap_or_default(),
            serde_json::to_string(&plain.response_headers).unwrap_or_default(),
        );
        self.name = if settings == plain_settings {
            base
        } else {
            let mut hasher = DefaultHasher::new();
            settings.hash(&mut hasher);
            format!("{base}/{:08x}", hasher.finish() & 0xffff_ffff)
        };
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TcpProxy {
    pub clusters: Vec<WeightedCluster>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SecretKind {
    TlsKeyPair,
    CaBundle,
}

/// Validated TLS material, keyed in the graph by `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Secret {
    pub name: NamespacedName,
    pub kind: SecretKind,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    pub fn key(&self) -> String {
        self.name.to_string()
    }
}
