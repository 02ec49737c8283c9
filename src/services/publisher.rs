use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::dag::Snapshot;

/// Holds the snapshot in service. Readers see nothing until the first build after the initial
/// sync and always get a whole snapshot, never a graph that is still being assembled.
#[derive(Clone)]
pub struct SnapshotPublisher {
    sender: Arc<watch::Sender<Option<Arc<Snapshot>>>>,
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender: Arc::new(sender) }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        let version = snapshot.version;
        let snapshot = Arc::new(snapshot);
        // Skip the notification when the graph did not change.
        let changed = self.sender.send_if_modified(|current| {
            if current.as_ref().is_some_and(|published| published.dag == snapshot.dag) {
                return false;
            }
            *current = Some(Arc::clone(&snapshot));
            true
        });
        if changed {
            info!("Published snapshot version {version}");
        }
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Dag, Listener, ListenerProtocol};

    fn snapshot(version: u64, port: u16) -> Snapshot {
        let mut dag = Dag::default();
        dag.listeners.insert(
            "ingress_http".to_owned(),
            Listener {
                name: "ingress_http".to_owned(),
                address: "0.0.0.0".to_owned(),
                port,
                protocol: ListenerProtocol::Http,
                virtual_hosts: Default::default(),
                tcp_proxy: None,
            },
        );
        Snapshot { version, dag }
    }

    #[tokio::test]
    async fn empty_until_first_publish() {
        let publisher = SnapshotPublisher::new();
        let mut receiver = publisher.subscribe();
        assert!(publisher.current().is_none());

        publisher.publish(snapshot(1, 8080));
        receiver.changed().await.unwrap();
        assert_eq!(receiver.borrow_and_update().as_ref().map(|s| s.version), Some(1));
    }

    #[tokio::test]
    async fn unchanged_graph_is_not_republished() {
        let publisher = SnapshotPublisher::new();
        let mut receiver = publisher.subscribe();
        publisher.publish(snapshot(1, 8080));
        receiver.borrow_and_update();

        publisher.publish(snapshot(2, 8080));
        assert!(!receiver.has_changed().unwrap());
        assert_eq!(publisher.current().map(|s| s.version), Some(1));

        publisher.publish(snapshot(3, 9090));
        assert!(receiver.has_changed().unwrap());
        assert_eq!(publisher.current().map(|s| s.version), Some(3));
    }
}
