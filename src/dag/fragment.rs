use std::collections::BTreeMap;

use super::{Cluster, ExternalAuthorization, ListenerProtocol, Origin, Route, Secret, TcpProxy, VirtualHostTls};
use crate::apis::httpproxy::RateLimitPolicy;

/// A listener a processor needs. `sticky` listeners stay in the graph even without any
/// virtual host, which is how Gateway listeners behave.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerDecl {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub sticky: bool,
}

/// Virtual host settings and routes contributed by one origin.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualHostFragment {
    pub listener: String,
    pub hostname: String,
    pub origin: Origin,
    pub tls: Option<VirtualHostTls>,
    pub tcp_proxy: Option<TcpProxy>,
    pub rate_limit: Option<RateLimitPolicy>,
    pub authorization: Option<ExternalAuthorization>,
    /// Routes keep declaration order when false.
    pub sort_routes: bool,
    pub routes: Vec<Route>,
}

impl VirtualHostFragment {
    pub fn new(listener: &str, hostname: &str, origin: Origin) -> Self {
        Self {
            listener: listener.to_owned(),
            hostname: hostname.to_owned(),
            origin,
            tls: None,
            tcp_proxy: None,
            rate_limit: None,
            authorization: None,
            sort_routes: true,
            routes: vec![],
        }
    }

    /// Whether this fragment wants to shape the virtual host itself rather than only add
    /// routes to it.
    pub fn has_settings(&self) -> bool {
        self.tls.is_some() || self.tcp_proxy.is_some() || self.rate_limit.is_some() || self.authorization.is_some()
    }
}

/// A raw TCP proxy bound to a whole listener.
#[derive(Clone, Debug, PartialEq)]
pub struct TcpFragment {
    pub listener: String,
    pub origin: Origin,
    pub proxy: TcpProxy,
}

/// Everything one processor produced during a build.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fragment {
    pub listeners: Vec<ListenerDecl>,
    pub virtual_hosts: Vec<VirtualHostFragment>,
    pub tcp: Vec<TcpFragment>,
    pub clusters: BTreeMap<String, Cluster>,
    pub secrets: BTreeMap<String, Secret>,
}

impl Fragment {
    pub fn add_cluster(&mut self, cluster: Cluster) -> String {
        let name = cluster.name.clone();
        self.clusters.entry(name.clone()).or_insert(cluster);
        name
    }

    pub fn add_secret(&mut self, secret: Secret) -> String {
        let key = secret.key();
        self.secrets.entry(key.clone()).or_insert(secret);
        key
    }

    pub fn declare_listener(&mut self, listener: ListenerDecl) {
        if !self.listeners.contains(&listener) {
            self.listeners.push(listener);
        }
    }

    pub fn merge(&mut self, other: Fragment) {
        for listener in other.listeners {
            self.declare_listener(listener);
        }
        self.virtual_hosts.extend(other.virtual_hosts);
        self.tcp.extend(other.tcp);
        for (name, cluster) in other.clusters {
            self.clusters.entry(name).or_insert(cluster);
        }
        for (key, secret) in other.secrets {
            self.secrets.entry(key).or_insert(secret);
        }
    }
}
