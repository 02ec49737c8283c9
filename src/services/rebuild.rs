use std::time::Duration;

use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use super::{publisher::SnapshotPublisher, status_writer::StatusBatch};
use crate::{dag::DagBuilder, state::State};

/// Turns change signals into builds. Signals that arrive while waiting out the debounce or
/// while a build runs collapse into a single follow-up build.
#[derive(TypedBuilder)]
pub struct RebuildService {
    state: State,
    builder: DagBuilder,
    /// Kinds whose initial listing must be complete before anything is built.
    kinds: Vec<String>,
    debounce: Duration,
    trigger: mpsc::Receiver<()>,
    publisher: SnapshotPublisher,
    status_sender: mpsc::Sender<StatusBatch>,
}

impl RebuildService {
    pub async fn start(mut self) -> crate::Result<()> {
        info!("Rebuild service...started");
        let mut version = 0;
        while self.trigger.recv().await.is_some() {
            sleep(self.debounce).await;
            while self.trigger.try_recv().is_ok() {}

            let kinds: Vec<&str> = self.kinds.iter().map(String::as_str).collect();
            if !self.state.is_synced(&kinds)? {
                debug!("Waiting for the initial sync of {kinds:?}");
                continue;
            }

            let objects = self.state.snapshot()?;
            let output = self.builder.build(&objects, version + 1)?;
            version += 1;
            self.publisher.publish(output.snapshot);
            if self.status_sender.send(output.statuses).await.is_err() {
                warn!("Status writer is gone, statuses of version {version} are dropped");
            }
        }
        info!("Rebuild service...stopped");
        Ok(())
    }
}
