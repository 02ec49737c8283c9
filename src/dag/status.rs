use std::collections::BTreeMap;

use gateway_api::apis::standard::{
    gatewayclasses::GatewayClassStatus,
    gateways::{GatewayStatus, GatewayStatusListeners, GatewayStatusListenersSupportedKinds},
    httproutes::{HTTPRouteStatus, HTTPRouteStatusParents},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::Resource;
use serde::Serialize;

use super::Origin;
use crate::{
    apis::httpproxy::HTTPProxyStatus,
    common::{reason, ConditionEntry, ConditionSet, ErrorKind, ParentReference, ResourceKey, Scope},
};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ListenerState {
    pub attached_routes: i32,
    pub supported_kinds: Vec<GatewayStatusListenersSupportedKinds>,
    pub conditions: ConditionSet,
}

/// Everything a build learned about one source object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectStatus {
    pub key: ResourceKey,
    pub generation: Option<i64>,
    pub conditions: ConditionSet,
    /// Per parent reference, for Gateway API routes.
    pub parents: BTreeMap<ParentReference, ConditionSet>,
    /// Per listener name, for Gateways.
    pub listeners: BTreeMap<String, ListenerState>,
}

fn render(entries: Vec<ConditionEntry>, generation: Option<i64>) -> Vec<Condition> {
    entries.iter().map(|entry| entry.to_condition(generation)).collect()
}

impl ObjectStatus {
    pub fn new(key: ResourceKey, generation: Option<i64>) -> Self {
        Self {
            key,
            generation,
            conditions: ConditionSet::default(),
            parents: BTreeMap::new(),
            listeners: BTreeMap::new(),
        }
    }

    /// Whether every parent (or the object itself, for objects without parents) was accepted.
    pub fn is_accepted(&self) -> bool {
        !self.conditions.is_rejected() && self.parents.values().all(|parent| !parent.is_rejected())
    }

    /// Conditions of objects that are neither Gateway API routes nor Gateways.
    pub fn entries(&self) -> Vec<ConditionEntry> {
        self.conditions.standard(reason::VALID)
    }

    pub fn proxy_status(&self) -> HTTPProxyStatus {
        let current_status = if self.conditions.has_reason(reason::ORPHANED) {
            "orphaned"
        } else if self.conditions.is_rejected() {
            "invalid"
        } else {
            "valid"
        };
        let description = match self.conditions.description() {
            description if description.is_empty() => "Valid HTTPProxy".to_owned(),
            description => description,
        };
        HTTPProxyStatus {
            current_status: Some(current_status.to_owned()),
            description: Some(description),
            conditions: render(self.entries(), self.generation),
        }
    }

    pub fn gateway_class_status(&self) -> GatewayClassStatus {
        GatewayClassStatus {
            conditions: Some(render(vec![self.conditions.accepted(reason::ACCEPTED)], self.generation)),
            ..Default::default()
        }
    }

    pub fn gateway_status(&self) -> GatewayStatus {
        let listeners = self
            .listeners
            .iter()
            .map(|(name, listener)| GatewayStatusListeners {
                name: name.clone(),
                attached_routes: listener.attached_routes,
                supported_kinds: listener.supported_kinds.clone(),
                conditions: render(
                    vec![
                        listener.conditions.accepted(reason::ACCEPTED),
                        listener.conditions.resolved_refs(),
                        listener.conditions.programmed(),
                        listener.conditions.conflicted(),
                    ],
                    self.generation,
                ),
            })
            .collect();
        GatewayStatus {
            conditions: Some(render(vec![self.conditions.accepted(reason::ACCEPTED), self.conditions.programmed()], self.generation)),
            listeners: Some(listeners),
            ..Default::default()
        }
    }

    /// Every route kind shares the HTTPRoute status layout.
    pub fn route_status(&self, controller_name: &str) -> HTTPRouteStatus {
        HTTPRouteStatus {
            parents: self
                .parents
                .iter()
                .map(|(parent_ref, conditions)| HTTPRouteStatusParents {
                    parent_ref: parent_ref.into(),
                    controller_name: controller_name.to_owned(),
                    conditions: Some(render(conditions.standard(reason::ACCEPTED), self.generation)),
                })
                .collect(),
        }
    }
}

/// Collects problems for every object touched by a build.
#[derive(Debug, Default)]
pub struct StatusAccumulator {
    statuses: BTreeMap<ResourceKey, ObjectStatus>,
}

impl StatusAccumulator {
    /// Marks an object as processed so it receives a full condition set even when clean.
    pub fn touch<R: Resource<DynamicType = ()>>(&mut self, resource: &R) -> &mut ObjectStatus {
        let key = ResourceKey::from_resource(resource);
        let generation = resource.meta().generation;
        self.statuses.entry(key.clone()).or_insert_with(|| ObjectStatus::new(key, generation))
    }

    pub fn entry(&mut self, key: &ResourceKey) -> &mut ObjectStatus {
        self.statuses.entry(key.clone()).or_insert_with(|| ObjectStatus::new(key.clone(), None))
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ObjectStatus> {
        self.statuses.get(key)
    }

    /// Records a problem against the origin, routed to its parent entry when it has one.
    pub fn record(&mut self, origin: &Origin, kind: ErrorKind, scope: Scope, reason: &str, message: impl Into<String>) {
        let status = self.entry(&origin.key);
        match &origin.parent {
            Some(parent) => status.parents.entry(parent.clone()).or_default().record(kind, scope, reason, message),
            None => status.conditions.record(kind, scope, reason, message),
        }
    }

    pub fn into_statuses(self) -> BTreeMap<ResourceKey, ObjectStatus> {
        self.statuses
    }
}
