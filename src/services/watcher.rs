use std::fmt::Debug;

use futures::StreamExt;
use kube::{
    runtime::watcher::{self, Event},
    Api, Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{State, StorageError, Stored};

/// Name under which a kind reports its initial sync.
pub fn kind_name<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).into_owned()
}

/// Feeds one kind into the shared [`State`]. Objects delivered during a (re)list are held back
/// until the list completes and then replace everything stored for the kind, so deletions that
/// happened while disconnected are not missed.
pub struct ObjectWatcher<K: Stored> {
    state: State,
    trigger: mpsc::Sender<()>,
    listing: Option<Vec<K>>,
    kind: String,
}

impl<K> ObjectWatcher<K>
where
    K: Stored + DeserializeOwned + Debug,
{
    pub fn new(state: State, trigger: mpsc::Sender<()>) -> Self {
        Self {
            state,
            trigger,
            listing: None,
            kind: kind_name::<K>(),
        }
    }

    pub async fn start(mut self, api: Api<K>) -> crate::Result<()> {
        info!("{} watcher...started", self.kind);
        let mut events = std::pin::pin!(watcher::watcher(api, watcher::Config::default()));
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.handle(event)?,
                Err(e) => warn!("{} watcher error, the stream will retry {e}", self.kind),
            }
        }
        info!("{} watcher...stopped", self.kind);
        Ok(())
    }

    pub fn handle(&mut self, event: Event<K>) -> Result<(), StorageError> {
        let changed = match event {
            Event::Init => {
                debug!("{} listing started", self.kind);
                self.listing = Some(Vec::new());
                false
            },
            Event::InitApply(object) => {
                match self.listing.as_mut() {
                    Some(listing) => listing.push(object),
                    None => {
                        self.state.apply(object)?;
                    },
                }
                false
            },
            Event::InitDone => {
                let listed = self.listing.take().unwrap_or_default();
                debug!("{} listing done with {} objects", self.kind, listed.len());
                self.state.replace_all(listed)?;
                self.state.mark_synced(&self.kind)?;
                true
            },
            Event::Apply(object) => self.state.apply(object)?,
            Event::Delete(object) => self.state.delete(&object)?,
        };
        if changed {
            self.notify();
        }
        Ok(())
    }

    fn notify(&self) {
        // A full channel already holds a pending rebuild request.
        if let Err(mpsc::error::TrySendError::Closed(())) = self.trigger.try_send(()) {
            warn!("{} watcher has no rebuild loop to notify", self.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Service;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::common::NamespacedName;

    fn service(namespace: &str, name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn listing_is_applied_on_completion() {
        let state = State::default();
        let (sender, mut receiver) = mpsc::channel(1);
        let mut watcher = ObjectWatcher::<Service>::new(state.clone(), sender);
        state.apply(service("a", "stale")).unwrap();

        watcher.handle(Event::Init).unwrap();
        watcher.handle(Event::InitApply(service("a", "web"))).unwrap();
        assert!(receiver.try_recv().is_err());
        assert_eq!(state.is_synced(&["Service"]), Ok(false));
        assert!(state.snapshot().unwrap().services.contains_key(&NamespacedName::new("a", "stale")));

        watcher.handle(Event::InitDone).unwrap();
        assert!(receiver.try_recv().is_ok());
        assert_eq!(state.is_synced(&["Service"]), Ok(true));
        let services = state.snapshot().unwrap().services;
        assert_eq!(services.keys().cloned().collect::<Vec<_>>(), vec![NamespacedName::new("a", "web")]);
    }

    #[test]
    fn changes_coalesce_into_one_trigger() {
        let state = State::default();
        let (sender, mut receiver) = mpsc::channel(1);
        let mut watcher = ObjectWatcher::<Service>::new(state.clone(), sender);

        watcher.handle(Event::Apply(service("a", "one"))).unwrap();
        watcher.handle(Event::Apply(service("a", "two"))).unwrap();
        watcher.handle(Event::Delete(service("a", "one"))).unwrap();
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());
        assert_eq!(state.snapshot().unwrap().services.len(), 1);
    }

    #[test]
    fn filtered_objects_do_not_trigger() {
        let state = State::new(vec!["team-a".to_owned()]);
        let (sender, mut receiver) = mpsc::channel(1);
        let mut watcher = ObjectWatcher::<Service>::new(state, sender);

        watcher.handle(Event::Apply(service("team-b", "web"))).unwrap();
        assert!(receiver.try_recv().is_err());
    }
}
