//! Explicit registry of running watchers, one per resource kind. Passed by
//! reference to whoever needs lifecycle access; there is no ambient global.

use crate::error::Result;
use crate::mirror::watcher::WatcherHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct WatcherRegistry {
    watchers: RwLock<HashMap<String, Arc<WatcherHandle>>>,
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
        }
    }

    /// Return the watcher registered under `kind`, starting it via `start`
    /// on first use. Creation is serialized under the registry lock, so
    /// `start` runs at most once per kind.
    ///
    /// # Errors
    ///
    /// Propagates the error when `start` fails; nothing is registered
    pub async fn get_or_start<F>(&self, kind: &str, start: F) -> Result<Arc<WatcherHandle>>
    where
        F: FnOnce() -> Result<WatcherHandle>,
    {
        if let Some(handle) = self.watchers.read().await.get(kind) {
            return Ok(handle.clone());
        }

        let mut watchers = self.watchers.write().await;
        // A racing caller may have registered while we waited for the lock
        if let Some(handle) = watchers.get(kind) {
            return Ok(handle.clone());
        }

        let handle = Arc::new(start()?);
        watchers.insert(kind.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, kind: &str) -> Option<Arc<WatcherHandle>> {
        self.watchers.read().await.get(kind).cloned()
    }

    pub async fn kinds(&self) -> Vec<String> {
        self.watchers.read().await.keys().cloned().collect()
    }

    /// Block until every registered watcher has established its first watch
    pub async fn await_ready(&self) {
        let handles: Vec<_> = self.watchers.read().await.values().cloned().collect();
        for handle in handles {
            handle.await_ready().await;
        }
    }

    /// Restart counts per kind, for health endpoints and operator logs
    pub async fn restart_counts(&self) -> HashMap<String, u32> {
        let watchers = self.watchers.read().await;
        watchers
            .iter()
            .map(|(kind, handle)| (kind.clone(), handle.restart_count()))
            .collect()
    }

    /// Stop every watcher and wait for each task to exit; drains the registry
    pub async fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut watchers = self.watchers.write().await;
            watchers.drain().collect()
        };
        for (kind, handle) in drained {
            handle.shutdown().await;
            info!("{kind} - watcher shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mirror::cache::{IndexedCache, PRIMARY_INDEX};
    use crate::mirror::remote::{EventStream, RemoteClient, ResourceList};
    use crate::mirror::watcher::ResourceWatcher;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Remote that never answers; registry tests only exercise lifecycle
    struct StalledRemote;

    #[async_trait]
    impl RemoteClient<String> for StalledRemote {
        async fn list(&self) -> crate::error::Result<ResourceList<String>> {
            futures::future::pending().await
        }

        async fn watch(
            &self,
            _: &str,
            _: Option<u32>,
        ) -> crate::error::Result<EventStream<String>> {
            futures::future::pending().await
        }
    }

    fn stalled_watcher(kind: &str) -> crate::error::Result<ResourceWatcher<String, String>> {
        let cache = Arc::new(
            IndexedCache::builder()
                .index(PRIMARY_INDEX, |s: &String| Some(s.clone()))
                .build()?,
        );
        ResourceWatcher::<String, String>::builder(kind, cache)
            .client(Arc::new(StalledRemote))
            .mirror_identity()
            .build()
    }

    #[tokio::test]
    async fn test_get_or_start_creates_once() {
        let registry = WatcherRegistry::new();
        let mut creations = 0;

        for _ in 0..3 {
            registry
                .get_or_start("Doc", || {
                    creations += 1;
                    Ok(stalled_watcher("Doc")?.start())
                })
                .await
                .unwrap();
        }

        assert_eq!(creations, 1);
        assert_eq!(registry.kinds().await, vec!["Doc".to_string()]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_registers_nothing() {
        let registry = WatcherRegistry::new();
        let failed = registry
            .get_or_start("Doc", || Err(Error::custom("boom")))
            .await;
        assert!(failed.is_err());
        assert!(registry.get("Doc").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_is_bounded() {
        let registry = WatcherRegistry::new();
        for kind in ["A", "B"] {
            registry
                .get_or_start(kind, || Ok(stalled_watcher(kind)?.start()))
                .await
                .unwrap();
        }
        assert_eq!(registry.restart_counts().await.len(), 2);

        tokio::time::timeout(Duration::from_secs(5), registry.shutdown())
            .await
            .expect("shutdown should not hang");
        assert!(registry.kinds().await.is_empty());
    }
}
