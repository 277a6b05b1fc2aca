//! The remote side of the mirror: a versioned collection that can be listed
//! in full and then watched incrementally from a resume token.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// One incremental change from the remote collection
#[derive(Debug, Clone)]
pub enum RemoteEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// In-band error event; always fatal for the current watch cycle
    Error(String),
}

impl<K> RemoteEvent<K> {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "ADDED",
            Self::Modified(_) => "MODIFIED",
            Self::Deleted(_) => "DELETED",
            Self::Error(_) => "ERROR",
        }
    }
}

/// A full snapshot plus the token to resume watching from
#[derive(Debug, Clone)]
pub struct ResourceList<K> {
    pub items: Vec<K>,
    /// Opaque, monotonically-advancing version of the collection
    pub resource_version: String,
}

pub type EventStream<K> = BoxStream<'static, Result<RemoteEvent<K>>>;

/// Transport boundary for one remote resource collection
///
/// Implementations own authentication and serialization; the watcher only
/// sees items, resume tokens, and event streams.
#[async_trait]
pub trait RemoteClient<K>: Send + Sync {
    /// Full snapshot of the collection
    async fn list(&self) -> Result<ResourceList<K>>;

    /// Incremental events since `resource_version`
    ///
    /// `timeout_seconds` is a server-side hint; the stream ends (without
    /// error) when it elapses, which the watcher treats as a resync cue.
    async fn watch(
        &self,
        resource_version: &str,
        timeout_seconds: Option<u32>,
    ) -> Result<EventStream<K>>;
}
