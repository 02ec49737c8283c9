use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, span, Level};

use super::{
    assembler::Assembler,
    fragment::Fragment,
    processors::{BuildContext, GatewayProcessor, HttpProxyProcessor, IngressProcessor, Processor},
    status::ObjectStatus,
    Snapshot,
};
use crate::{common::ResourceKey, configuration::DagConfiguration, state::Objects};

/// Defects of the builder itself. Problems with input objects never surface here; they end
/// up as conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("listener {0} is declared with conflicting addresses, ports or protocols")]
    ListenerMismatch(String),
    #[error("port {port} is declared by listeners {first} and {second}")]
    PortConflict { port: u16, first: String, second: String },
    #[error("virtual host {hostname} refers to undeclared listener {listener}")]
    UndeclaredListener { listener: String, hostname: String },
    #[error("cluster {0} is referenced but was never resolved")]
    MissingCluster(String),
    #[error("secret {0} is referenced but was never validated")]
    MissingSecret(String),
}

pub struct BuildOutput {
    pub snapshot: Snapshot,
    pub statuses: BTreeMap<ResourceKey, ObjectStatus>,
}

/// Runs every processor against one object view and assembles the result. Holds no state
/// between builds.
pub struct DagBuilder {
    config: DagConfiguration,
    processors: Vec<Box<dyn Processor>>,
}

impl DagBuilder {
    pub fn new(config: DagConfiguration) -> Self {
        Self {
            config,
            processors: vec![Box::new(GatewayProcessor), Box::new(HttpProxyProcessor), Box::new(IngressProcessor)],
        }
    }

    pub fn build(&self, objects: &Objects, version: u64) -> Result<BuildOutput, BuildError> {
        let span = span!(Level::INFO, "DagBuilder", version);
        let _entered = span.enter();

        let mut ctx = BuildContext::new(objects, &self.config);
        let mut fragment = Fragment::default();
        for processor in &self.processors {
            let produced = processor.process(&mut ctx);
            debug!(
                "{} produced {} virtual hosts, {} tcp proxies and {} clusters",
                processor.name(),
                produced.virtual_hosts.len(),
                produced.tcp.len(),
                produced.clusters.len()
            );
            fragment.merge(produced);
        }
        let validated_secrets = ctx.secrets.validated();
        let mut status = ctx.status;
        let dag = Assembler::new(self.config.cross_schema_conflict_policy).assemble(fragment, &mut status)?;
        let statuses = status.into_statuses();
        info!(
            "Built graph with {} listeners, {} routes, {} clusters and {} secrets ({validated_secrets} validated), {} objects with status",
            dag.listeners.len(),
            dag.route_count(),
            dag.clusters.len(),
            dag.secrets.len(),
            statuses.len()
        );
        Ok(BuildOutput {
            snapshot: Snapshot { version, dag },
            statuses,
        })
    }
}
