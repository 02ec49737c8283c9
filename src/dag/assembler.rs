use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{
    builder::BuildError,
    conflict::precedence,
    fragment::{Fragment, ListenerDecl, TcpFragment, VirtualHostFragment},
    matching::RouteMatch,
    ordering::sort_routes,
    status::StatusAccumulator,
    CrossSchemaPolicy, Dag, Listener, Origin, Schema, VirtualHost,
};
use crate::common::{reason, ErrorKind, ParentReference, ResourceKey, Scope};

/// An object, or for Gateway API routes one parent of it.
type AttachmentKey = (ResourceKey, Option<ParentReference>);

fn attachment_key(origin: &Origin) -> AttachmentKey {
    (origin.key.clone(), origin.parent.clone())
}

struct Loss {
    origin: Origin,
    reason: &'static str,
    message: String,
    whole_object: bool,
}

/// Tracks which rules survived assembly so that a loser is rejected only when nothing of it
/// made it into the graph.
#[derive(Default)]
struct Losses {
    kept: BTreeMap<AttachmentKey, BTreeSet<usize>>,
    lost: Vec<Loss>,
}

impl Losses {
    fn keep(&mut self, origin: &Origin) {
        self.kept.entry(attachment_key(origin)).or_default().insert(origin.rule);
    }

    fn lose(&mut self, origin: Origin, reason: &'static str, message: String) {
        self.lost.push(Loss {
            origin,
            reason,
            message,
            whole_object: false,
        });
    }

    fn evict(&mut self, origin: Origin, reason: &'static str, message: String) {
        self.lost.push(Loss {
            origin,
            reason,
            message,
            whole_object: true,
        });
    }

    fn record(self, status: &mut StatusAccumulator) {
        for loss in self.lost {
            let survived = self.kept.get(&attachment_key(&loss.origin)).is_some_and(|rules| !rules.is_empty());
            let scope = if loss.whole_object || !survived { Scope::Object } else { Scope::Fragment };
            status.record(&loss.origin, ErrorKind::Conflict, scope, loss.reason, loss.message);
        }
    }
}

fn vhost_conflict_reason(schema: Schema) -> &'static str {
    match schema {
        Schema::GatewayApi => reason::ROUTE_CONFLICT,
        Schema::HttpProxy | Schema::Ingress => reason::DUPLICATE_VHOST,
    }
}

fn same_settings(a: &VirtualHostFragment, b: &VirtualHostFragment) -> bool {
    a.tls == b.tls && a.tcp_proxy == b.tcp_proxy && a.rate_limit == b.rate_limit && a.authorization == b.authorization
}

/// Merges the fragments of every processor into one graph. Collisions between fragments
/// are settled by [`precedence`]; losers are reported against their origin and left out.
pub struct Assembler {
    policy: CrossSchemaPolicy,
}

impl Assembler {
    pub fn new(policy: CrossSchemaPolicy) -> Self {
        Self { policy }
    }

    pub fn assemble(&self, fragment: Fragment, status: &mut StatusAccumulator) -> Result<Dag, BuildError> {
        let Fragment {
            listeners: decls,
            virtual_hosts,
            tcp,
            clusters,
            secrets,
        } = fragment;
        let mut listeners = declare(decls)?;
        let mut losses = Losses::default();

        let mut groups: BTreeMap<(String, String), Vec<VirtualHostFragment>> = BTreeMap::new();
        for vhost in virtual_hosts {
            if !listeners.contains_key(&vhost.listener) {
                return Err(BuildError::UndeclaredListener {
                    listener: vhost.listener,
                    hostname: vhost.hostname,
                });
            }
            groups.entry((vhost.listener.clone(), vhost.hostname.clone())).or_default().push(vhost);
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| precedence(&a.origin, &b.origin, self.policy));
        }

        let evicted = self.settle_settings(&groups, &mut losses);
        for ((listener, hostname), group) in groups {
            let group: Vec<_> = group.into_iter().filter(|vhost| !evicted.contains(&attachment_key(&vhost.origin))).collect();
            if let Some(vhost) = merge_virtual_host(&listener, &hostname, group, &mut losses) {
                if let Some((_, target)) = listeners.get_mut(&listener) {
                    target.virtual_hosts.insert(hostname, vhost);
                }
            }
        }

        let mut proxies: BTreeMap<String, Vec<TcpFragment>> = BTreeMap::new();
        for proxy in tcp.into_iter().filter(|proxy| !evicted.contains(&attachment_key(&proxy.origin))) {
            if !listeners.contains_key(&proxy.listener) {
                return Err(BuildError::UndeclaredListener {
                    listener: proxy.listener,
                    hostname: String::new(),
                });
            }
            proxies.entry(proxy.listener.clone()).or_default().push(proxy);
        }
        for (name, mut group) in proxies {
            group.sort_by(|a, b| precedence(&a.origin, &b.origin, self.policy));
            let mut group = group.into_iter();
            let Some(winner) = group.next() else {
                continue;
            };
            for loser in group {
                let message = format!("listener {name} already proxies TCP for {}", winner.origin.key);
                losses.lose(loser.origin, reason::ROUTE_CONFLICT, message);
            }
            losses.keep(&winner.origin);
            if let Some((_, listener)) = listeners.get_mut(&name) {
                listener.tcp_proxy = Some(winner.proxy);
            }
        }
        losses.record(status);

        let listeners: BTreeMap<String, Listener> = listeners
            .into_iter()
            .filter(|(_, (decl, listener))| decl.sticky || !listener.virtual_hosts.is_empty() || listener.tcp_proxy.is_some())
            .map(|(name, (_, listener))| (name, listener))
            .collect();
        prune(listeners, clusters, secrets)
    }

    /// Virtual host settings are not mergeable: the first fragment in precedence order that
    /// sets any wins and every fragment with different settings loses the whole attachment.
    fn settle_settings(&self, groups: &BTreeMap<(String, String), Vec<VirtualHostFragment>>, losses: &mut Losses) -> BTreeSet<AttachmentKey> {
        let mut evicted = BTreeSet::new();
        for ((listener, hostname), group) in groups {
            let Some(winner) = group.iter().find(|vhost| vhost.has_settings()) else {
                continue;
            };
            for loser in group.iter().filter(|vhost| vhost.has_settings() && !same_settings(vhost, winner)) {
                if loser.origin.same_attachment(&winner.origin) || !evicted.insert(attachment_key(&loser.origin)) {
                    continue;
                }
                let message = format!("virtual host {hostname} on listener {listener} is already configured by {}", winner.origin.key);
                debug!("{} loses: {message}", loser.origin.key);
                losses.evict(loser.origin.clone(), vhost_conflict_reason(loser.origin.schema), message);
            }
        }
        evicted
    }
}

/// One listener per name and one name per port. Processors settle port conflicts before
/// declaring, so a collision here is a defect.
fn declare(decls: Vec<ListenerDecl>) -> Result<BTreeMap<String, (ListenerDecl, Listener)>, BuildError> {
    let mut listeners: BTreeMap<String, (ListenerDecl, Listener)> = BTreeMap::new();
    for decl in decls {
        if let Some((other, _)) = listeners.values().find(|(other, _)| other.port == decl.port && other.name != decl.name) {
            return Err(BuildError::PortConflict {
                port: decl.port,
                first: other.name.clone(),
                second: decl.name,
            });
        }
        match listeners.get_mut(&decl.name) {
            Some((existing, _)) => {
                if existing.address != decl.address || existing.port != decl.port || existing.protocol != decl.protocol {
                    return Err(BuildError::ListenerMismatch(decl.name));
                }
                existing.sticky |= decl.sticky;
            },
            None => {
                let listener = Listener {
                    name: decl.name.clone(),
                    address: decl.address.clone(),
                    port: decl.port,
                    protocol: decl.protocol,
                    virtual_hosts: BTreeMap::new(),
                    tcp_proxy: None,
                };
                listeners.insert(decl.name.clone(), (decl, listener));
            },
        }
    }
    Ok(listeners)
}

/// Routes of one virtual host in fragment precedence order. The first route with a given
/// match wins; later ones are duplicates of their own object or conflicts with another.
fn merge_virtual_host(listener: &str, hostname: &str, group: Vec<VirtualHostFragment>, losses: &mut Losses) -> Option<VirtualHost> {
    let settings = group.iter().find(|vhost| vhost.has_settings()).or(group.first())?;
    let mut vhost = VirtualHost {
        hostname: hostname.to_owned(),
        routes: vec![],
        tls: settings.tls.clone(),
        tcp_proxy: settings.tcp_proxy.clone(),
        rate_limit: settings.rate_limit.clone(),
        authorization: settings.authorization.clone(),
    };
    let sort = settings.sort_routes;
    if vhost.tcp_proxy.is_some() {
        losses.keep(&settings.origin);
    }

    let mut seen: BTreeMap<RouteMatch, Origin> = BTreeMap::new();
    for fragment in group {
        for route in fragment.routes {
            let identity = route.route_match.identity();
            match seen.get(&identity) {
                Some(winner) if winner.same_attachment(&route.origin) => {
                    let message = format!("{} declares match {} more than once", route.origin.key, route.route_match.path.value());
                    losses.lose(route.origin, reason::DUPLICATE_MATCH_CONDITIONS, message);
                },
                Some(winner) => {
                    let message = format!(
                        "match {} on {hostname} ({listener}) is already routed by {}",
                        route.route_match.path.value(),
                        winner.key
                    );
                    losses.lose(route.origin, reason::ROUTE_CONFLICT, message);
                },
                None => {
                    losses.keep(&route.origin);
                    seen.insert(identity, route.origin.clone());
                    vhost.routes.push(route);
                },
            }
        }
    }
    if sort {
        sort_routes(&mut vhost.routes);
    }
    if vhost.routes.is_empty() && vhost.tcp_proxy.is_none() {
        debug!("Dropping virtual host {hostname} on {listener} without routes");
        return None;
    }
    Some(vhost)
}

/// Keeps only the clusters and secrets the graph references and checks that every
/// reference resolves.
fn prune(
    listeners: BTreeMap<String, Listener>,
    mut clusters: BTreeMap<String, super::Cluster>,
    mut secrets: BTreeMap<String, super::Secret>,
) -> Result<Dag, BuildError> {
    let mut cluster_names = BTreeSet::new();
    let mut secret_names = BTreeSet::new();
    for listener in listeners.values() {
        let proxies = listener
            .tcp_proxy
            .iter()
            .chain(listener.virtual_hosts.values().filter_map(|vhost| vhost.tcp_proxy.as_ref()));
        cluster_names.extend(proxies.flat_map(|proxy| proxy.clusters.iter().map(|c| c.cluster.clone())));
        for vhost in listener.virtual_hosts.values() {
            if let Some(tls) = &vhost.tls {
                secret_names.extend(tls.secret.iter().chain(&tls.client_validation).chain(&tls.fallback_certificate).cloned());
            }
            cluster_names.extend(vhost.authorization.iter().map(|authorization| authorization.cluster.clone()));
            for route in &vhost.routes {
                cluster_names.extend(route.action.clusters().map(str::to_owned));
                cluster_names.extend(route.policies.mirrors.iter().cloned());
            }
        }
    }

    let mut referenced_clusters = BTreeMap::new();
    for name in cluster_names {
        let cluster = clusters.remove(&name).ok_or_else(|| BuildError::MissingCluster(name.clone()))?;
        if let Some(validation) = &cluster.upstream_validation {
            secret_names.insert(validation.ca_secret.clone());
        }
        referenced_clusters.insert(name, cluster);
    }
    let mut referenced_secrets = BTreeMap::new();
    for name in secret_names {
        let secret = secrets.remove(&name).ok_or_else(|| BuildError::MissingSecret(name.clone()))?;
        referenced_secrets.insert(name, secret);
    }
    Ok(Dag {
        listeners,
        clusters: referenced_clusters,
        secrets: referenced_secrets,
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        common::NamespacedName,
        dag::{
            matching::PathMatch, status::ObjectStatus, test_support::route_with, Cluster, ListenerProtocol, RouteAction, TcpProxy, VirtualHostTls,
            WeightedCluster,
        },
    };

    fn origin(kind: &str, name: &str, schema: Schema, created: i64) -> Origin {
        Origin::new(ResourceKey::new("", kind, "default", name), schema, Utc.timestamp_opt(created, 0).single())
    }

    fn decl(name: &str, port: u16, sticky: bool) -> ListenerDecl {
        ListenerDecl {
            name: name.to_owned(),
            address: "0.0.0.0".to_owned(),
            port,
            protocol: ListenerProtocol::Http,
            sticky,
        }
    }

    fn vhost(origin: &Origin, paths: &[&str]) -> VirtualHostFragment {
        let mut vhost = VirtualHostFragment::new("http", "example.com", origin.clone());
        vhost.routes = paths
            .iter()
            .enumerate()
            .map(|(rule, path)| {
                let mut route = route_with(crate::dag::matching::RouteMatch::with_path(PathMatch::segment(path)));
                route.origin = origin.with_rule(rule);
                route
            })
            .collect();
        vhost
    }

    fn assemble(policy: CrossSchemaPolicy, fragment: Fragment) -> (Dag, BTreeMap<ResourceKey, ObjectStatus>) {
        let mut status = StatusAccumulator::default();
        let dag = Assembler::new(policy).assemble(fragment, &mut status).unwrap();
        (dag, status.into_statuses())
    }

    #[test]
    fn mismatched_listener_is_a_defect() {
        let fragment = Fragment {
            listeners: vec![decl("http", 8080, false), decl("http", 9090, true)],
            ..Default::default()
        };
        let result = Assembler::new(CrossSchemaPolicy::OldestWins).assemble(fragment, &mut StatusAccumulator::default());
        assert_eq!(result, Err(BuildError::ListenerMismatch("http".to_owned())));
    }

    #[test]
    fn shared_port_is_a_defect() {
        let fragment = Fragment {
            listeners: vec![
                decl("ingress_https", 8443, true),
                ListenerDecl {
                    protocol: ListenerProtocol::Tcp,
                    ..decl("tcp-8443", 8443, true)
                },
            ],
            ..Default::default()
        };
        let result = Assembler::new(CrossSchemaPolicy::OldestWins).assemble(fragment, &mut StatusAccumulator::default());
        assert_eq!(
            result,
            Err(BuildError::PortConflict {
                port: 8443,
                first: "ingress_https".to_owned(),
                second: "tcp-8443".to_owned(),
            })
        );
    }

    #[test]
    fn sticky_listeners_survive_empty() {
        let fragment = Fragment {
            listeners: vec![decl("http", 8080, false), decl("gateway", 80, true)],
            ..Default::default()
        };
        let (dag, _) = assemble(CrossSchemaPolicy::OldestWins, fragment);
        assert_eq!(dag.listeners.keys().collect::<Vec<_>>(), vec!["gateway"]);
    }

    #[test]
    fn cross_schema_conflict_follows_policy() {
        let ingress = origin("Ingress", "old", Schema::Ingress, 100);
        let route = origin("HTTPRoute", "new", Schema::GatewayApi, 200);
        let fragment = || Fragment {
            listeners: vec![decl("http", 8080, false)],
            virtual_hosts: vec![vhost(&route, &["/"]), vhost(&ingress, &["/"])],
            ..Default::default()
        };

        let (dag, statuses) = assemble(CrossSchemaPolicy::OldestWins, fragment());
        let routes = &dag.virtual_host("http", "example.com").unwrap().routes;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].origin.key, ingress.key);
        let loser = &statuses[&route.key];
        assert!(loser.conditions.has_reason(reason::ROUTE_CONFLICT));
        assert!(loser.conditions.is_rejected());

        let (dag, statuses) = assemble(CrossSchemaPolicy::SchemaPriority, fragment());
        assert_eq!(dag.virtual_host("http", "example.com").unwrap().routes[0].origin.key, route.key);
        assert!(statuses[&ingress.key].conditions.is_rejected());
    }

    #[test]
    fn partial_loss_is_not_rejection() {
        let older = origin("HTTPProxy", "a", Schema::HttpProxy, 100);
        let newer = origin("HTTPProxy", "b", Schema::HttpProxy, 200);
        let fragment = Fragment {
            listeners: vec![decl("http", 8080, false)],
            virtual_hosts: vec![vhost(&newer, &["/shared", "/only-b"]), vhost(&older, &["/shared", "/shared"])],
            ..Default::default()
        };
        let (dag, statuses) = assemble(CrossSchemaPolicy::OldestWins, fragment);
        assert_eq!(dag.route_count(), 2);

        let newer_status = &statuses[&newer.key];
        assert!(!newer_status.conditions.is_rejected());
        assert!(newer_status.conditions.is_partial());
        assert!(newer_status.conditions.has_reason(reason::ROUTE_CONFLICT));
        let older_status = &statuses[&older.key];
        assert!(older_status.conditions.has_reason(reason::DUPLICATE_MATCH_CONDITIONS));
        assert!(!older_status.conditions.is_rejected());
    }

    #[test]
    fn settings_conflict_evicts_loser() {
        let older = origin("Ingress", "a", Schema::Ingress, 100);
        let newer = origin("HTTPProxy", "b", Schema::HttpProxy, 200);
        let mut first = vhost(&older, &["/"]);
        first.tls = Some(VirtualHostTls {
            secret: Some("default/a".to_owned()),
            ..Default::default()
        });
        let mut second = vhost(&newer, &["/other"]);
        second.tls = Some(VirtualHostTls {
            secret: Some("default/b".to_owned()),
            ..Default::default()
        });
        let mut insecure = vhost(&newer, &["/other"]);
        insecure.hostname = "plain.example.com".to_owned();
        let mut secrets = BTreeMap::new();
        for name in ["a", "b"] {
            secrets.insert(
                format!("default/{name}"),
                crate::dag::Secret {
                    name: NamespacedName::new("default", name),
                    kind: crate::dag::SecretKind::TlsKeyPair,
                    data: BTreeMap::new(),
                },
            );
        }
        let fragment = Fragment {
            listeners: vec![decl("http", 8080, false)],
            virtual_hosts: vec![second, first, insecure],
            secrets,
            ..Default::default()
        };
        let (dag, statuses) = assemble(CrossSchemaPolicy::OldestWins, fragment);
        let vhost = dag.virtual_host("http", "example.com").unwrap();
        assert_eq!(vhost.routes.len(), 1);
        assert!(dag.virtual_host("http", "plain.example.com").is_none());
        assert_eq!(dag.secrets.keys().collect::<Vec<_>>(), vec!["default/a"]);
        let loser = &statuses[&newer.key];
        assert!(loser.conditions.has_reason(reason::DUPLICATE_VHOST));
        assert!(loser.conditions.is_rejected());
    }

    #[test]
    fn unreferenced_clusters_are_dropped() {
        let proxy = origin("HTTPProxy", "a", Schema::HttpProxy, 100);
        let mut fragment_vhost = vhost(&proxy, &["/"]);
        fragment_vhost.routes[0].action = RouteAction::Forward(vec![WeightedCluster {
            cluster: "default/web/80".to_owned(),
            weight: 1,
        }]);
        let mut clusters = BTreeMap::new();
        for name in ["web", "unused"] {
            let cluster = Cluster::new(NamespacedName::new("default", name), 80).named();
            clusters.insert(cluster.name.clone(), cluster);
        }
        let fragment = Fragment {
            listeners: vec![decl("http", 8080, false)],
            virtual_hosts: vec![fragment_vhost],
            clusters,
            ..Default::default()
        };
        let (dag, _) = assemble(CrossSchemaPolicy::OldestWins, fragment);
        assert_eq!(dag.clusters.keys().collect::<Vec<_>>(), vec!["default/web/80"]);
    }

    #[test]
    fn missing_cluster_is_a_defect() {
        let proxy = origin("HTTPProxy", "a", Schema::HttpProxy, 100);
        let mut fragment_vhost = vhost(&proxy, &["/"]);
        fragment_vhost.routes[0].action = RouteAction::Forward(vec![WeightedCluster {
            cluster: "default/ghost/80".to_owned(),
            weight: 1,
        }]);
        let fragment = Fragment {
            listeners: vec![decl("http", 8080, false)],
            virtual_hosts: vec![fragment_vhost],
            ..Default::default()
        };
        let result = Assembler::new(CrossSchemaPolicy::OldestWins).assemble(fragment, &mut StatusAccumulator::default());
        assert_eq!(result, Err(BuildError::MissingCluster("default/ghost/80".to_owned())));
    }

    #[test]
    fn tcp_listener_conflict() {
        let older = origin("TCPRoute", "a", Schema::GatewayApi, 100);
        let newer = origin("TCPRoute", "b", Schema::GatewayApi, 200);
        let proxy = |name: &str| TcpProxy {
            clusters: vec![WeightedCluster {
                cluster: format!("default/{name}/5432"),
                weight: 1,
            }],
        };
        let mut clusters = BTreeMap::new();
        for name in ["a", "b"] {
            let cluster = Cluster::new(NamespacedName::new("default", name), 5432).named();
            clusters.insert(cluster.name.clone(), cluster);
        }
        let fragment = Fragment {
            listeners: vec![ListenerDecl {
                protocol: ListenerProtocol::Tcp,
                ..decl("tcp-5432", 5432, true)
            }],
            tcp: vec![
                TcpFragment {
                    listener: "tcp-5432".to_owned(),
                    origin: newer.clone(),
                    proxy: proxy("b"),
                },
                TcpFragment {
                    listener: "tcp-5432".to_owned(),
                    origin: older.clone(),
                    proxy: proxy("a"),
                },
            ],
            clusters,
            ..Default::default()
        };
        let (dag, statuses) = assemble(CrossSchemaPolicy::OldestWins, fragment);
        assert_eq!(dag.listeners["tcp-5432"].tcp_proxy, Some(proxy("a")));
        assert_eq!(dag.clusters.len(), 1);
        assert!(statuses[&newer.key].conditions.is_rejected());
        assert!(!statuses.contains_key(&older.key));
    }
}
