/**
 * Resource watcher
 *
 * Keeps one kind's slice of the indexed cache convergent with the remote
 * collection: list, diff against the cached prefix, then apply watch events
 * until the stream fails, restarting the whole cycle on any failure. One
 * long-lived tokio task per watcher.
 */
use crate::error::{Error, Result};
use crate::mirror::cache::{CacheError, IndexedCache, PRIMARY_INDEX};
use crate::mirror::remote::{EventStream, RemoteClient, RemoteEvent};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds the cache-facing representation of a raw remote object
pub type CreateFn<K, V> = Arc<dyn Fn(&K) -> V + Send + Sync>;

/// Decides whether an incoming object changes the cached entry and applies
/// the change in place; returns `true` iff it mutated the entry
pub type UpdateFn<K, V> = Arc<dyn Fn(&K, &mut V) -> bool + Send + Sync>;

/// Fills in identity metadata the remote may omit on some code paths; runs on
/// every object before it is keyed, at both list and watch entry points
pub type NormalizeFn<K> = Arc<dyn Fn(&mut K) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Created,
    Listing,
    Watching,
    Restarting,
    ShuttingDown,
    Stopped,
}

/// Outcome counts of one list-and-diff pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub stale: usize,
}

pub struct WatcherBuilder<K, V> {
    kind: String,
    cache: Arc<IndexedCache<V>>,
    client: Option<Arc<dyn RemoteClient<K>>>,
    resync_interval: Option<Duration>,
    create: Option<CreateFn<K, V>>,
    update: Option<UpdateFn<K, V>>,
    normalize: NormalizeFn<K>,
}

impl<K, V> WatcherBuilder<K, V>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(kind: &str, cache: Arc<IndexedCache<V>>) -> Self {
        Self {
            kind: kind.to_string(),
            cache,
            client: None,
            resync_interval: None,
            create: None,
            update: None,
            normalize: Arc::new(|_| {}),
        }
    }

    #[must_use]
    pub fn client(mut self, client: Arc<dyn RemoteClient<K>>) -> Self {
        self.client = Some(client);
        self
    }

    /// Watch timeout hint base; jittered per cycle to avoid synchronized
    /// resyncs across watchers sharing one interval
    #[must_use]
    pub const fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn create_fn(mut self, create: impl Fn(&K) -> V + Send + Sync + 'static) -> Self {
        self.create = Some(Arc::new(create));
        self
    }

    #[must_use]
    pub fn update_fn(mut self, update: impl Fn(&K, &mut V) -> bool + Send + Sync + 'static) -> Self {
        self.update = Some(Arc::new(update));
        self
    }

    #[must_use]
    pub fn normalize_fn(mut self, normalize: impl Fn(&mut K) + Send + Sync + 'static) -> Self {
        self.normalize = Arc::new(normalize);
        self
    }

    /// Finalize the watcher, failing fast on missing mandatory fields
    ///
    /// # Errors
    ///
    /// Returns an error if the remote client or the create/update pair was
    /// never configured
    pub fn build(self) -> Result<ResourceWatcher<K, V>> {
        let client = self.client.ok_or_else(|| {
            Error::custom(format!(
                "{} watcher: a remote client must be configured",
                self.kind
            ))
        })?;
        let create = self.create.ok_or_else(|| {
            Error::custom(format!(
                "{} watcher: a create function must be configured",
                self.kind
            ))
        })?;
        let update = self.update.ok_or_else(|| {
            Error::custom(format!(
                "{} watcher: an update function must be configured",
                self.kind
            ))
        })?;

        Ok(ResourceWatcher {
            inner: Arc::new(WatcherInner {
                key_prefix: format!("{}/", self.kind),
                kind: self.kind,
                cache: self.cache,
                client,
                resync_interval: self.resync_interval,
                create,
                update,
                normalize: self.normalize,
            }),
        })
    }
}

impl<K> WatcherBuilder<K, K>
where
    K: Clone + PartialEq + Send + Sync + 'static,
{
    /// Install the default construction/update pair: cache the remote object
    /// as-is and replace it on structural inequality
    #[must_use]
    pub fn mirror_identity(mut self) -> Self {
        self.create = Some(Arc::new(K::clone));
        self.update = Some(Arc::new(|incoming: &K, current: &mut K| {
            if current == incoming {
                false
            } else {
                *current = incoming.clone();
                true
            }
        }));
        self
    }
}

struct WatcherInner<K, V> {
    kind: String,
    key_prefix: String,
    cache: Arc<IndexedCache<V>>,
    client: Arc<dyn RemoteClient<K>>,
    resync_interval: Option<Duration>,
    create: CreateFn<K, V>,
    update: UpdateFn<K, V>,
    normalize: NormalizeFn<K>,
}

/// A configured, not-yet-running watcher; consume with [`Self::start`]
pub struct ResourceWatcher<K, V> {
    inner: Arc<WatcherInner<K, V>>,
}

impl<K, V> ResourceWatcher<K, V>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn builder(kind: &str, cache: Arc<IndexedCache<V>>) -> WatcherBuilder<K, V> {
        WatcherBuilder::new(kind, cache)
    }

    /// Spawn the watch task and return its lifecycle handle
    #[must_use]
    pub fn start(self) -> WatcherHandle {
        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(WatcherState::Created);
        let restarts = Arc::new(AtomicU32::new(0));

        let inner = self.inner;
        let kind = inner.kind.clone();
        info!("🔍 {kind} - watching");

        let task = tokio::spawn(run(inner, stop.clone(), ready_tx, state_tx, restarts.clone()));

        WatcherHandle {
            kind,
            stop,
            ready: ready_rx,
            state: state_rx,
            restarts,
            task: Mutex::new(Some(task)),
        }
    }
}

async fn run<K, V>(
    inner: Arc<WatcherInner<K, V>>,
    stop: CancellationToken,
    ready_tx: watch::Sender<bool>,
    state_tx: watch::Sender<WatcherState>,
    restarts: Arc<AtomicU32>,
) where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        state_tx.send_replace(WatcherState::Listing);
        match inner.sync_cycle(&stop, &ready_tx, &state_tx).await {
            Ok(()) => break,
            Err(e) => {
                restarts.fetch_add(1, Ordering::SeqCst);
                warn!("{} - restarting watch - {e}", inner.kind);
                state_tx.send_replace(WatcherState::Restarting);
            }
        }
    }

    // Waiters blocked on readiness must not hang once the task is gone
    ready_tx.send_replace(true);
    state_tx.send_replace(WatcherState::Stopped);
    info!("🛑 {} - watching stopped", inner.kind);
}

impl<K, V> WatcherInner<K, V>
where
    K: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// One full cycle: list, diff, watch, apply events. `Ok` means a
    /// deliberate stop; any `Err` sends the caller back to a fresh list.
    async fn sync_cycle(
        &self,
        stop: &CancellationToken,
        ready_tx: &watch::Sender<bool>,
        state_tx: &watch::Sender<WatcherState>,
    ) -> Result<()> {
        let list = tokio::select! {
            biased;
            () = stop.cancelled() => {
                state_tx.send_replace(WatcherState::ShuttingDown);
                return Ok(());
            }
            list = self.client.list() => list?,
        };

        let resource_version = list.resource_version.clone();
        let summary = self.reconcile(list.items).await?;
        info!(
            "{} - cache synchronized: added {}, updated {}, unchanged {}, stale {}",
            self.kind, summary.added, summary.updated, summary.unchanged, summary.stale
        );

        let timeout = self.resync_interval.map(jittered_timeout);
        let stream = tokio::select! {
            biased;
            () = stop.cancelled() => {
                state_tx.send_replace(WatcherState::ShuttingDown);
                return Ok(());
            }
            stream = self.client.watch(&resource_version, timeout) => stream?,
        };

        state_tx.send_replace(WatcherState::Watching);
        ready_tx.send_replace(true);

        self.event_loop(stream, stop, state_tx).await
    }

    async fn event_loop(
        &self,
        mut stream: EventStream<K>,
        stop: &CancellationToken,
        state_tx: &watch::Sender<WatcherState>,
    ) -> Result<()> {
        let opened = Instant::now();
        let mut events: u64 = 0;

        loop {
            // Biased so a stop signal always wins over a ready event;
            // shutdown stays bounded even when the stream never idles
            tokio::select! {
                biased;
                () = stop.cancelled() => {
                    info!("{} - shutdown received", self.kind);
                    state_tx.send_replace(WatcherState::ShuttingDown);
                    return Ok(());
                }
                event = stream.next() => {
                    let Some(event) = event else {
                        if events == 0 && opened.elapsed() < Duration::from_secs(1) {
                            warn!(
                                "{} - very short watch: stream closed in under a second with no events",
                                self.kind
                            );
                        }
                        return Err(Error::custom("watch stream closed"));
                    };
                    events += 1;
                    self.apply_event(event?).await?;
                }
            }
        }
    }

    async fn apply_event(&self, event: RemoteEvent<K>) -> Result<()> {
        debug!("{} - received event {}", self.kind, event.kind());
        match event {
            RemoteEvent::Added(mut object) => {
                (self.normalize)(&mut object);
                self.cache.add((self.create)(&object)).await?;
            }
            RemoteEvent::Modified(mut object) => {
                (self.normalize)(&mut object);
                let candidate = (self.create)(&object);
                self.cache
                    .update(|current| (self.update)(&object, current), &candidate)
                    .await?;
            }
            RemoteEvent::Deleted(mut object) => {
                (self.normalize)(&mut object);
                self.cache.delete(&(self.create)(&object)).await?;
            }
            RemoteEvent::Error(message) => {
                return Err(Error::custom(format!("watch error event: {message}")));
            }
        }
        Ok(())
    }

    /// Diff a full remote snapshot against the cached prefix: reconcile every
    /// remote item, then drop whatever the snapshot no longer contains
    async fn reconcile(&self, items: Vec<K>) -> Result<DiffSummary> {
        let key_creator = self.cache.key_creator(PRIMARY_INDEX)?;

        let mut current: HashMap<String, V> = HashMap::new();
        self.cache
            .get(PRIMARY_INDEX, &self.key_prefix, |object| {
                let key = key_creator(object)
                    .ok_or_else(|| CacheError::KeyDerivation(PRIMARY_INDEX.to_string()))?;
                current.insert(key, object.clone());
                Ok((false, false))
            })
            .await?;

        let mut summary = DiffSummary::default();
        for mut item in items {
            (self.normalize)(&mut item);
            let candidate = (self.create)(&item);
            let key = key_creator(&candidate)
                .ok_or_else(|| CacheError::KeyDerivation(PRIMARY_INDEX.to_string()))?;

            if current.remove(&key).is_some() {
                let changed = self
                    .cache
                    .update(|cur| (self.update)(&item, cur), &candidate)
                    .await?;
                if changed {
                    summary.updated += 1;
                } else {
                    summary.unchanged += 1;
                }
            } else {
                self.cache.add(candidate).await?;
                summary.added += 1;
            }
        }

        // Everything still in the working set no longer exists remotely
        summary.stale = current.len();
        for stale in current.into_values() {
            self.cache.delete(&stale).await?;
        }

        Ok(summary)
    }
}

/// Timeout hint scaled by a random factor in `[1.0, 2.0)`
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn jittered_timeout(interval: Duration) -> u32 {
    (interval.as_secs_f64() * (1.0 + rand::random::<f64>())) as u32
}

/// Lifecycle handle for a running watcher; type-erased so heterogeneous
/// watchers can live in one registry
pub struct WatcherHandle {
    kind: String,
    stop: CancellationToken,
    ready: watch::Receiver<bool>,
    state: watch::Receiver<WatcherState>,
    restarts: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherHandle {
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Watch-cycle failures so far; health checks read this concurrently
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Block until the first watch stream has been established
    ///
    /// Satisfied permanently after the first success, including across later
    /// restarts, and released on shutdown so callers never hang.
    pub async fn await_ready(&self) {
        let mut ready = self.ready.clone();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Signal the task to stop and block until it has fully exited
    ///
    /// Idempotent; concurrent and repeated calls are no-ops after the first.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{} - watch task join failed: {e}", self.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::remote::ResourceList;
    use async_trait::async_trait;

    #[derive(Debug, Clone, PartialEq)]
    struct Doc {
        name: String,
        revision: u64,
    }

    fn doc(name: &str, revision: u64) -> Doc {
        Doc {
            name: name.to_string(),
            revision,
        }
    }

    /// Remote that is never reached; reconcile tests drive the diff directly
    struct UnreachableRemote;

    #[async_trait]
    impl RemoteClient<Doc> for UnreachableRemote {
        async fn list(&self) -> Result<ResourceList<Doc>> {
            Err(Error::custom("unreachable"))
        }

        async fn watch(&self, _: &str, _: Option<u32>) -> Result<EventStream<Doc>> {
            Err(Error::custom("unreachable"))
        }
    }

    fn doc_cache() -> Arc<IndexedCache<Doc>> {
        Arc::new(
            IndexedCache::builder()
                .index(PRIMARY_INDEX, |d: &Doc| Some(format!("Doc/{}", d.name)))
                .build()
                .unwrap(),
        )
    }

    fn doc_watcher(cache: Arc<IndexedCache<Doc>>) -> ResourceWatcher<Doc, Doc> {
        ResourceWatcher::<Doc, Doc>::builder("Doc", cache)
            .client(Arc::new(UnreachableRemote))
            .mirror_identity()
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_client() {
        let built = ResourceWatcher::<Doc, Doc>::builder("Doc", doc_cache())
            .mirror_identity()
            .build();
        assert!(built.is_err());
    }

    #[test]
    fn test_builder_requires_create_and_update() {
        let built = ResourceWatcher::<Doc, Doc>::builder("Doc", doc_cache())
            .client(Arc::new(UnreachableRemote))
            .build();
        assert!(built.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_counts_and_final_state() {
        let cache = doc_cache();
        for (name, rev) in [("a", 1), ("b", 1), ("c", 1)] {
            cache.add(doc(name, rev)).await.unwrap();
        }

        let watcher = doc_watcher(cache.clone());
        let summary = watcher
            .inner
            .reconcile(vec![doc("a", 2), doc("b", 1), doc("d", 1)])
            .await
            .unwrap();

        assert_eq!(
            summary,
            DiffSummary {
                added: 1,
                updated: 1,
                unchanged: 1,
                stale: 1
            }
        );

        let remaining = cache
            .get(PRIMARY_INDEX, "Doc/", |_| Ok((false, true)))
            .await
            .unwrap();
        let mut names: Vec<(&str, u64)> = remaining
            .iter()
            .map(|d| (d.name.as_str(), d.revision))
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec![("a", 2), ("b", 1), ("d", 1)]);
    }

    #[tokio::test]
    async fn test_reconcile_empty_snapshot_drops_everything() {
        let cache = doc_cache();
        cache.add(doc("a", 1)).await.unwrap();

        let watcher = doc_watcher(cache.clone());
        let summary = watcher.inner.reconcile(vec![]).await.unwrap();

        assert_eq!(summary.stale, 1);
        assert_eq!(cache.stats().await.total_objects, 0);
    }

    #[tokio::test]
    async fn test_reconcile_ignores_other_prefixes() {
        let cache = Arc::new(
            IndexedCache::builder()
                .index(PRIMARY_INDEX, |d: &Doc| Some(d.name.clone()))
                .build()
                .unwrap(),
        );
        // Lives outside the watcher's "Doc/" prefix
        cache.add(doc("Other/x", 1)).await.unwrap();

        let watcher = ResourceWatcher::<Doc, Doc>::builder("Doc", cache.clone())
            .client(Arc::new(UnreachableRemote))
            .mirror_identity()
            .build()
            .unwrap();

        let summary = watcher.inner.reconcile(vec![]).await.unwrap();
        assert_eq!(summary.stale, 0);
        assert_eq!(cache.stats().await.total_objects, 1);
    }

    #[test]
    fn test_jittered_timeout_stays_in_range() {
        for _ in 0..100 {
            let hint = jittered_timeout(Duration::from_secs(60));
            assert!((60..120).contains(&hint));
        }
    }
}
