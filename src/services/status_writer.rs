use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use gateway_api::apis::{
    experimental::{tcproutes::TCPRoute, tlsroutes::TLSRoute},
    standard::{gatewayclasses::GatewayClass, gateways::Gateway, grpcroutes::GRPCRoute, httproutes::HTTPRoute},
};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, Resource,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, info, span, warn, Instrument, Level};
use typed_builder::TypedBuilder;

use crate::{
    apis::httpproxy::HTTPProxy,
    common::ResourceKey,
    dag::status::ObjectStatus,
};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

pub type StatusBatch = BTreeMap<ResourceKey, ObjectStatus>;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("kubernetes api error {0}")]
    Kube(#[from] kube::Error),
    #[error("status of kind {0} is not written")]
    UnsupportedKind(String),
}

/// Writes one status document onto one object.
#[async_trait]
pub trait StatusPatcher: Send + Sync {
    async fn patch(&self, key: &ResourceKey, status: &Value) -> Result<(), PatchError>;
}

pub struct KubeStatusPatcher {
    client: Client,
}

impl KubeStatusPatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn merge_status<K>(api: Api<K>, name: &str, status: &Value) -> Result<(), PatchError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(status)).await?;
    Ok(())
}

#[async_trait]
impl StatusPatcher for KubeStatusPatcher {
    async fn patch(&self, key: &ResourceKey, status: &Value) -> Result<(), PatchError> {
        let namespace = key.namespace.as_str();
        match key.kind.as_str() {
            "HTTPProxy" => merge_status(self.namespaced::<HTTPProxy>(namespace), &key.name, status).await,
            "GatewayClass" => merge_status(Api::<GatewayClass>::all(self.client.clone()), &key.name, status).await,
            "Gateway" => merge_status(self.namespaced::<Gateway>(namespace), &key.name, status).await,
            "HTTPRoute" => merge_status(self.namespaced::<HTTPRoute>(namespace), &key.name, status).await,
            "GRPCRoute" => merge_status(self.namespaced::<GRPCRoute>(namespace), &key.name, status).await,
            "TLSRoute" => merge_status(self.namespaced::<TLSRoute>(namespace), &key.name, status).await,
            "TCPRoute" => merge_status(self.namespaced::<TCPRoute>(namespace), &key.name, status).await,
            kind => Err(PatchError::UnsupportedKind(kind.to_owned())),
        }
    }
}

/// The merge patch carrying the computed status, or `None` for kinds whose status is only logged.
pub fn status_patch(status: &ObjectStatus, controller_name: &str) -> Option<Value> {
    let rendered = match status.key.kind.as_str() {
        "HTTPProxy" => serde_json::to_value(status.proxy_status()),
        "GatewayClass" => serde_json::to_value(status.gateway_class_status()),
        "Gateway" => serde_json::to_value(status.gateway_status()),
        "HTTPRoute" | "GRPCRoute" | "TLSRoute" | "TCPRoute" => serde_json::to_value(status.route_status(controller_name)),
        _ => return None,
    };
    match rendered {
        Ok(rendered) => Some(json!({ "status": rendered })),
        Err(e) => {
            warn!("Unable to render status of {} {e}", status.key);
            None
        },
    }
}

/// Upserts build statuses in the background. A newer build replaces whatever is still pending
/// for the same object, and statuses equal to the last one written are skipped.
#[derive(TypedBuilder)]
pub struct StatusWriterService<P: StatusPatcher> {
    patcher: P,
    receiver: mpsc::Receiver<StatusBatch>,
    #[builder(setter(into))]
    controller_name: String,
    #[builder(default = INITIAL_BACKOFF)]
    backoff: Duration,
    #[builder(default)]
    written: StatusBatch,
}

impl<P: StatusPatcher> StatusWriterService<P> {
    pub async fn start(mut self) -> crate::Result<()> {
        info!("Status writer...started");
        let mut pending = StatusBatch::new();
        while let Some(batch) = self.receiver.recv().await {
            self.queue(&mut pending, batch);
            let mut attempt = 0;
            while !pending.is_empty() && attempt < MAX_ATTEMPTS {
                if attempt > 0 {
                    sleep(self.backoff * 2_u32.pow(attempt - 1)).await;
                }
                // Anything queued meanwhile supersedes what failed.
                while let Ok(batch) = self.receiver.try_recv() {
                    self.queue(&mut pending, batch);
                }
                pending = self.write(pending).await;
                attempt += 1;
            }
            if !pending.is_empty() {
                warn!("Giving up on {} status updates until the next build", pending.len());
                pending.clear();
            }
        }
        info!("Status writer...stopped");
        Ok(())
    }

    fn queue(&self, pending: &mut StatusBatch, batch: StatusBatch) {
        for (key, status) in batch {
            if key.kind == "Ingress" {
                let accepted = if status.is_accepted() { "valid" } else { "invalid" };
                debug!("Ingress {key} is {accepted} {}", status.conditions.description());
            } else if self.written.get(&key) == Some(&status) {
                pending.remove(&key);
            } else {
                pending.insert(key, status);
            }
        }
    }

    /// Returns what still has to be written.
    async fn write(&mut self, pending: StatusBatch) -> StatusBatch {
        let mut failed = StatusBatch::new();
        for (key, status) in pending {
            let Some(patch) = status_patch(&status, &self.controller_name) else {
                debug!("No status written for {key}");
                continue;
            };
            let span = span!(Level::INFO, "StatusWriterService", id = %key);
            match self.patcher.patch(&key, &patch).instrument(span.clone()).await {
                Ok(()) => {
                    span.in_scope(|| debug!("patch status result ok"));
                    self.written.insert(key, status);
                },
                Err(PatchError::Kube(kube::Error::Api(response))) if response.code == 404 => {
                    span.in_scope(|| debug!("object is gone {}", response.message));
                    self.written.remove(&key);
                },
                Err(e) => {
                    span.in_scope(|| warn!("patch status failed {e}"));
                    failed.insert(key, status);
                },
            }
        }
        failed
    }
}

#[async_trait]
impl<P: StatusPatcher> StatusPatcher for Arc<P> {
    async fn patch(&self, key: &ResourceKey, status: &Value) -> Result<(), PatchError> {
        self.as_ref().patch(key, status).await
    }
}
