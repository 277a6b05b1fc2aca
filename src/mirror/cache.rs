/**
 * Indexed object cache
 *
 * A concurrent store of mirrored objects organized under one or more named
 * indexes. Each index derives its own string key from an object; the primary
 * index defines object identity. Watchers own a disjoint key prefix under the
 * primary index, readers scan by prefix.
 */
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::RwLock;
use tracing::debug;

/// Name of the index that defines object identity
pub const PRIMARY_INDEX: &str = "primary";

/// Derives the index key for an object, or `None` when the object does not
/// belong in this index. Keys must come from immutable identity fields so
/// that in-place mutation never moves an entry.
pub type KeyCreator<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

/// Cache-level failures, matchable by callers
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("duplicate key '{0}' in primary index")]
    DuplicateKey(String),

    #[error("unknown index '{0}'")]
    UnknownIndex(String),

    #[error("cannot derive a key for object in index '{0}'")]
    KeyDerivation(String),

    /// Indicates a prior panic while an entry lock was held
    #[error("entry lock poisoned for key '{0}'")]
    LockPoisoned(String),
}

type Shared<T> = Arc<StdRwLock<T>>;

struct IndexState<T> {
    key_creator: KeyCreator<T>,
    entries: RwLock<BTreeMap<String, Shared<T>>>,
}

pub struct IndexedCache<T> {
    indexes: HashMap<String, IndexState<T>>,
}

/// Builds an [`IndexedCache`] with a fixed set of named indexes
pub struct CacheBuilder<T> {
    indexes: Vec<(String, KeyCreator<T>)>,
}

impl<T> Default for CacheBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheBuilder<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            indexes: Vec::new(),
        }
    }

    #[must_use]
    pub fn index(
        mut self,
        name: &str,
        key_creator: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.indexes.push((name.to_string(), Arc::new(key_creator)));
        self
    }

    /// Finalize the cache
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndex` if no [`PRIMARY_INDEX`] was configured
    pub fn build(self) -> Result<IndexedCache<T>, CacheError> {
        if !self.indexes.iter().any(|(name, _)| name == PRIMARY_INDEX) {
            return Err(CacheError::UnknownIndex(PRIMARY_INDEX.to_string()));
        }
        let indexes = self
            .indexes
            .into_iter()
            .map(|(name, key_creator)| {
                (
                    name,
                    IndexState {
                        key_creator,
                        entries: RwLock::new(BTreeMap::new()),
                    },
                )
            })
            .collect();
        Ok(IndexedCache { indexes })
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Entry count per index name
    pub indexes: HashMap<String, usize>,
    /// Entry count under the primary index
    pub total_objects: usize,
}

impl<T> IndexedCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn builder() -> CacheBuilder<T> {
        CacheBuilder::new()
    }

    fn index(&self, name: &str) -> Result<&IndexState<T>, CacheError> {
        self.indexes
            .get(name)
            .ok_or_else(|| CacheError::UnknownIndex(name.to_string()))
    }

    /// The key-derivation function bound to `index`
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndex` if no such index was configured
    pub fn key_creator(&self, index: &str) -> Result<KeyCreator<T>, CacheError> {
        Ok(self.index(index)?.key_creator.clone())
    }

    /// Insert a new object into every index whose key creator accepts it
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if the primary key already exists and
    /// `KeyDerivation` if the primary index cannot key the object
    pub async fn add(&self, object: T) -> Result<(), CacheError> {
        let primary = self.index(PRIMARY_INDEX)?;
        let primary_key = (primary.key_creator)(&object)
            .ok_or_else(|| CacheError::KeyDerivation(PRIMARY_INDEX.to_string()))?;

        // Secondary indexes share the entry so in-place updates are visible
        // everywhere. An index that declines the object is skipped.
        let secondary: Vec<(&IndexState<T>, String)> = self
            .indexes
            .iter()
            .filter(|(name, _)| name.as_str() != PRIMARY_INDEX)
            .filter_map(|(_, state)| (state.key_creator)(&object).map(|key| (state, key)))
            .collect();

        let shared: Shared<T> = Arc::new(StdRwLock::new(object));

        {
            let mut entries = primary.entries.write().await;
            if entries.contains_key(&primary_key) {
                return Err(CacheError::DuplicateKey(primary_key));
            }
            entries.insert(primary_key.clone(), shared.clone());
        }

        for (state, key) in secondary {
            state.entries.write().await.insert(key, shared.clone());
        }

        debug!("cache add: {}", primary_key);
        Ok(())
    }

    /// Mutate the entry identified by `reference` in place
    ///
    /// `mutate` receives the current value and reports whether it changed
    /// anything; a `false` return suppresses any observable mutation. A
    /// missing entry is upserted from `reference` (a late watch event can
    /// race a re-list) and reported as changed.
    ///
    /// # Errors
    ///
    /// Returns `KeyDerivation` if the primary index cannot key `reference`
    pub async fn update<F>(&self, mutate: F, reference: &T) -> Result<bool, CacheError>
    where
        F: FnOnce(&mut T) -> bool,
    {
        let primary = self.index(PRIMARY_INDEX)?;
        let key = (primary.key_creator)(reference)
            .ok_or_else(|| CacheError::KeyDerivation(PRIMARY_INDEX.to_string()))?;

        let existing = primary.entries.read().await.get(&key).cloned();
        match existing {
            Some(shared) => {
                let mut guard = shared
                    .write()
                    .map_err(|_| CacheError::LockPoisoned(key.clone()))?;
                let changed = mutate(&mut guard);
                drop(guard);
                if changed {
                    debug!("cache update: {}", key);
                }
                Ok(changed)
            }
            None => {
                self.add(reference.clone()).await?;
                Ok(true)
            }
        }
    }

    /// Remove the entry identified by `reference` from every index
    ///
    /// Deleting an absent entry is a no-op; deletions must be idempotent.
    pub async fn delete(&self, reference: &T) -> Result<(), CacheError> {
        for state in self.indexes.values() {
            if let Some(key) = (state.key_creator)(reference) {
                state.entries.write().await.remove(&key);
            }
        }
        Ok(())
    }

    /// Scan `index` for entries whose key starts with `key_prefix`
    ///
    /// The visitor runs once per entry in key order and returns
    /// `(stop, keep)`: `stop` ends the scan early, `keep` adds a clone of the
    /// entry to the returned set. Entries are visited under their lock, so
    /// visitors must be brief and must not re-enter the cache.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIndex` for an unconfigured index; visitor errors
    /// propagate and abort the scan
    pub async fn get<V>(
        &self,
        index: &str,
        key_prefix: &str,
        mut visitor: V,
    ) -> Result<Vec<T>, CacheError>
    where
        V: FnMut(&T) -> Result<(bool, bool), CacheError>,
    {
        let state = self.index(index)?;
        let entries = state.entries.read().await;

        let mut kept = Vec::new();
        for (key, shared) in entries.range(key_prefix.to_string()..) {
            if !key.starts_with(key_prefix) {
                break;
            }
            let guard = shared
                .read()
                .map_err(|_| CacheError::LockPoisoned(key.clone()))?;
            let (stop, keep) = visitor(&guard)?;
            if keep {
                kept.push(guard.clone());
            }
            if stop {
                break;
            }
        }
        Ok(kept)
    }

    /// Entry counts per index, for operator logs and health endpoints
    pub async fn stats(&self) -> CacheStats {
        let mut per_index = HashMap::new();
        for (name, state) in &self.indexes {
            per_index.insert(name.clone(), state.entries.read().await.len());
        }
        let total_objects = per_index.get(PRIMARY_INDEX).copied().unwrap_or(0);
        CacheStats {
            indexes: per_index,
            total_objects,
        }
    }
}
