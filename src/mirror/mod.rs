pub mod cache;
pub mod registry;
pub mod remote;
pub mod watcher;

pub use cache::{CacheBuilder, CacheError, CacheStats, IndexedCache, KeyCreator, PRIMARY_INDEX};
pub use registry::WatcherRegistry;
pub use remote::{EventStream, RemoteClient, RemoteEvent, ResourceList};
pub use watcher::{
    DiffSummary, ResourceWatcher, WatcherBuilder, WatcherHandle, WatcherState,
};
