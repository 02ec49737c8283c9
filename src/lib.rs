use std::{fmt::Debug, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use gateway_api::apis::{
    experimental::{tcproutes::TCPRoute, tlsroutes::TLSRoute},
    standard::{gatewayclasses::GatewayClass, gateways::Gateway, grpcroutes::GRPCRoute, httproutes::HTTPRoute, referencegrants::ReferenceGrant},
};
use k8s_openapi::api::{
    core::v1::{Namespace, Secret, Service},
    networking::v1::Ingress,
};
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub mod apis;
pub mod common;
pub mod configuration;
pub mod dag;
pub mod services;
pub mod state;

use apis::{delegation::TLSCertificateDelegation, httpproxy::HTTPProxy};
use configuration::Configuration;
use dag::DagBuilder;
use services::{kind_name, KubeStatusPatcher, ObjectWatcher, RebuildService, SnapshotPublisher, StatusWriterService};
use state::{State, Stored};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

struct Watchers {
    client: Client,
    state: State,
    trigger: mpsc::Sender<()>,
    kinds: Vec<String>,
    tasks: Vec<BoxFuture<'static, Result<()>>>,
}

impl Watchers {
    fn watch<K>(&mut self)
    where
        K: Stored + DeserializeOwned + Debug,
    {
        self.kinds.push(kind_name::<K>());
        let watcher = ObjectWatcher::<K>::new(self.state.clone(), self.trigger.clone());
        self.tasks.push(watcher.start(Api::all(self.client.clone())).boxed());
    }
}

async fn log_snapshots(publisher: SnapshotPublisher) -> Result<()> {
    let mut snapshots = publisher.subscribe();
    while snapshots.changed().await.is_ok() {
        let current = snapshots.borrow_and_update().clone();
        if let Some(snapshot) = current {
            debug!("Snapshot {} in service {}", snapshot.version, snapshot.dag.to_json()?);
        }
    }
    Ok(())
}

pub async fn start(configuration: Configuration) -> Result<()> {
    info!("Kubroute started");
    let client = Client::try_default().await?;
    let state = State::new(configuration.watch_namespaces.clone());
    let (trigger_sender, trigger_receiver) = mpsc::channel(1);
    let (status_sender, status_receiver) = mpsc::channel(1024);
    let publisher = SnapshotPublisher::new();

    let mut watchers = Watchers {
        client: client.clone(),
        state: state.clone(),
        trigger: trigger_sender,
        kinds: Vec::new(),
        tasks: Vec::new(),
    };
    watchers.watch::<HTTPProxy>();
    watchers.watch::<TLSCertificateDelegation>();
    watchers.watch::<Ingress>();
    watchers.watch::<GatewayClass>();
    watchers.watch::<Gateway>();
    watchers.watch::<HTTPRoute>();
    watchers.watch::<GRPCRoute>();
    watchers.watch::<TLSRoute>();
    watchers.watch::<TCPRoute>();
    watchers.watch::<ReferenceGrant>();
    watchers.watch::<Secret>();
    watchers.watch::<Service>();
    watchers.watch::<Namespace>();
    let Watchers { kinds, tasks, .. } = watchers;

    let rebuild_service = RebuildService::builder()
        .state(state)
        .builder(DagBuilder::new(configuration.dag_configuration()))
        .kinds(kinds)
        .debounce(Duration::from_millis(configuration.debounce_millis))
        .trigger(trigger_receiver)
        .publisher(publisher.clone())
        .status_sender(status_sender)
        .build();

    let status_writer_service = StatusWriterService::builder()
        .patcher(KubeStatusPatcher::new(client))
        .receiver(status_receiver)
        .controller_name(configuration.controller_name.clone())
        .build();

    let mut services = tasks;
    services.push(rebuild_service.start().boxed());
    services.push(status_writer_service.start().boxed());
    services.push(log_snapshots(publisher).boxed());

    // The first service to fail stops the others.
    let (result, _, _) = futures::future::select_all(services).await;
    info!("Kubroute stopped");
    result
}
