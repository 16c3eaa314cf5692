//! Output delivery abstraction.

use crate::EnvError;

/// Destination for engine output.
///
/// Implementations decide how published items reach consumers. The `key`
/// identifies the entity an item belongs to so that sinks can coalesce
/// per-entity updates.
pub trait SnapshotSink<T>: Send + Sync {
    /// Publishes an item for the given key.
    fn publish(&self, key: &str, item: T) -> Result<(), EnvError>;

    /// Signals that no more items will be published.
    fn close(&self) {}
}
