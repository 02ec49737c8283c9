use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use gateway_api::apis::{
    experimental::{tcproutes::TCPRoute, tlsroutes::TLSRoute},
    standard::{gatewayclasses::GatewayClass, gateways::Gateway, grpcroutes::GRPCRoute, httproutes::HTTPRoute, referencegrants::ReferenceGrant},
};
use k8s_openapi::api::{
    core::v1::{Namespace, Secret, Service},
    networking::v1::Ingress,
};
use kube::Resource;

use crate::{
    apis::{delegation::TLSCertificateDelegation, httpproxy::HTTPProxy},
    common::NamespacedName,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("object store lock poisoned")]
    LockingError,
}

/// A point-in-time copy of every object the builder reads. Maps are ordered so that two
/// views holding the same objects iterate identically, whatever order the objects arrived in.
#[derive(Clone, Debug, Default)]
pub struct Objects {
    pub ingresses: BTreeMap<NamespacedName, Ingress>,
    pub proxies: BTreeMap<NamespacedName, HTTPProxy>,
    pub delegations: BTreeMap<NamespacedName, TLSCertificateDelegation>,
    pub gateway_classes: BTreeMap<NamespacedName, GatewayClass>,
    pub gateways: BTreeMap<NamespacedName, Gateway>,
    pub http_routes: BTreeMap<NamespacedName, HTTPRoute>,
    pub grpc_routes: BTreeMap<NamespacedName, GRPCRoute>,
    pub tls_routes: BTreeMap<NamespacedName, TLSRoute>,
    pub tcp_routes: BTreeMap<NamespacedName, TCPRoute>,
    pub reference_grants: BTreeMap<NamespacedName, ReferenceGrant>,
    pub secrets: BTreeMap<NamespacedName, Secret>,
    pub services: BTreeMap<NamespacedName, Service>,
    pub namespaces: BTreeMap<NamespacedName, Namespace>,
}

impl Objects {
    pub fn insert<K: Stored>(&mut self, object: K) {
        K::store(self).insert(NamespacedName::of(&object), object);
    }

    pub fn namespace_labels(&self, namespace: &str) -> Option<&BTreeMap<String, String>> {
        self.namespaces
            .get(&NamespacedName::new("", namespace))
            .and_then(|namespace| namespace.metadata.labels.as_ref())
    }
}

/// Selects the map of [`Objects`] that holds a kind.
pub trait Stored: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    fn store(objects: &mut Objects) -> &mut BTreeMap<NamespacedName, Self>;
}

macro_rules! stored {
    ($kind:ty, $field:ident) => {
        impl Stored for $kind {
            fn store(objects: &mut Objects) -> &mut BTreeMap<NamespacedName, Self> {
                &mut objects.$field
            }
        }
    };
}

stored!(Ingress, ingresses);
stored!(HTTPProxy, proxies);
stored!(TLSCertificateDelegation, delegations);
stored!(GatewayClass, gateway_classes);
stored!(Gateway, gateways);
stored!(HTTPRoute, http_routes);
stored!(GRPCRoute, grpc_routes);
stored!(TLSRoute, tls_routes);
stored!(TCPRoute, tcp_routes);
stored!(ReferenceGrant, reference_grants);
stored!(Secret, secrets);
stored!(Service, services);
stored!(Namespace, namespaces);

/// Shared object store filled by the watchers and read by the rebuild loop.
#[derive(Clone, Default)]
pub struct State {
    objects: Arc<Mutex<Objects>>,
    synced: Arc<Mutex<BTreeSet<String>>>,
    watch_namespaces: Arc<BTreeSet<String>>,
}

impl State {
    pub fn new(watch_namespaces: impl IntoIterator<Item = String>) -> Self {
        Self {
            objects: Arc::new(Mutex::new(Objects::default())),
            synced: Arc::new(Mutex::new(BTreeSet::new())),
            watch_namespaces: Arc::new(watch_namespaces.into_iter().collect()),
        }
    }

    /// Cluster scoped objects are always watched; namespaced ones only inside the configured
    /// namespaces, when any are configured.
    pub fn is_watched<K: Resource>(&self, object: &K) -> bool {
        match object.meta().namespace.as_deref() {
            None | Some("") => true,
            Some(namespace) => self.watch_namespaces.is_empty() || self.watch_namespaces.contains(namespace),
        }
    }

    pub fn apply<K: Stored>(&self, mut object: K) -> Result<bool, StorageError> {
        if !self.is_watched(&object) {
            return Ok(false);
        }
        object.meta_mut().managed_fields = None;
        let mut objects = self.objects.lock().map_err(|_| StorageError::LockingError)?;
        objects.insert(object);
        Ok(true)
    }

    pub fn delete<K: Stored>(&self, object: &K) -> Result<bool, StorageError> {
        let mut objects = self.objects.lock().map_err(|_| StorageError::LockingError)?;
        Ok(K::store(&mut objects).remove(&NamespacedName::of(object)).is_some())
    }

    /// Replaces every stored object of one kind, used when a watcher finishes a (re)list.
    pub fn replace_all<K: Stored>(&self, listed: Vec<K>) -> Result<(), StorageError> {
        let listed: BTreeMap<NamespacedName, K> = listed
            .into_iter()
            .filter(|object| self.is_watched(object))
            .map(|mut object| {
                object.meta_mut().managed_fields = None;
                (NamespacedName::of(&object), object)
            })
            .collect();
        let mut objects = self.objects.lock().map_err(|_| StorageError::LockingError)?;
        *K::store(&mut objects) = listed;
        Ok(())
    }

    pub fn mark_synced(&self, kind: &str) -> Result<(), StorageError> {
        let mut synced = self.synced.lock().map_err(|_| StorageError::LockingError)?;
        synced.insert(kind.to_owned());
        Ok(())
    }

    pub fn is_synced(&self, kinds: &[&str]) -> Result<bool, StorageError> {
        let synced = self.synced.lock().map_err(|_| StorageError::LockingError)?;
        Ok(kinds.iter().all(|kind| synced.contains(*kind)))
    }

    pub fn snapshot(&self) -> Result<Objects, StorageError> {
        let objects = self.objects.lock().map_err(|_| StorageError::LockingError)?;
        Ok(objects.clone())
    }
}
