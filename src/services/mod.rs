mod publisher;
mod rebuild;
mod status_writer;
mod watcher;

pub use publisher::SnapshotPublisher;
pub use rebuild::RebuildService;
pub use status_writer::{KubeStatusPatcher, PatchError, StatusBatch, StatusPatcher, StatusWriterService};
pub use watcher::{kind_name, ObjectWatcher};
