//! Named cache stores holding request → response entries in insertion order.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::policy::entries_to_evict;
use super::{CacheError, StoredResponse};

/// A set of named stores, each an insertion-ordered map of request key to
/// response.
///
/// Callers may overlap freely. Writes to the same key are last-writer-wins;
/// re-inserting a key moves it to the newest position.
pub trait CacheStorage: Send + Sync {
    /// Names of all existing stores, in creation order.
    fn store_names(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>>;

    /// Delete a whole store. Returns `false` if it did not exist.
    fn delete_store<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<bool, CacheError>>;

    fn get<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredResponse>, CacheError>>;

    /// Insert entries, creating the store if needed. The batch is applied
    /// completely or not at all.
    fn put_all<'a>(
        &'a self,
        store: &'a str,
        entries: Vec<(String, StoredResponse)>,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Keys of a store, oldest insertion first. Empty if the store is missing.
    fn keys<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<Vec<String>, CacheError>>;

    /// Remove the given keys, returning how many existed.
    fn remove<'a>(
        &'a self,
        store: &'a str,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<usize, CacheError>>;

    /// Evict the oldest entries until at most `max` remain, returning how many
    /// were removed. Runs as one step against concurrent writers.
    fn trim<'a>(&'a self, store: &'a str, max: usize) -> BoxFuture<'a, Result<usize, CacheError>>;
}

/// Stores must be usable as file names.
pub(crate) fn check_store_name(store: &str) -> Result<(), CacheError> {
    crate::session::validate_session_name(store).map_err(|_| CacheError::InvalidStoreName(store.to_string()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Store {
    name: String,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    key: String,
    response: StoredResponse,
}

impl Store {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    fn get(&self, key: &str) -> Option<&StoredResponse> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.response)
    }

    fn insert(&mut self, key: String, response: StoredResponse) {
        self.entries.retain(|e| e.key != key);
        self.entries.push(Entry { key, response });
    }

    fn remove(&mut self, keys: &[String]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !keys.contains(&e.key));
        before - self.entries.len()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    fn trim(&mut self, max: usize) -> usize {
        let evict = entries_to_evict(&self.keys(), max);
        self.remove(&evict)
    }
}

/// In-memory storage. Contents live as long as the value.
#[derive(Default)]
pub struct MemoryCacheStorage {
    stores: RwLock<Vec<Store>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn store_names(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
        let names = self.stores.read().iter().map(|s| s.name.clone()).collect();
        Box::pin(async move { Ok(names) })
    }

    fn delete_store<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        let mut stores = self.stores.write();
        let before = stores.len();
        stores.retain(|s| s.name != store);
        let existed = stores.len() != before;
        Box::pin(async move { Ok(existed) })
    }

    fn get<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredResponse>, CacheError>> {
        let found = self
            .stores
            .read()
            .iter()
            .find(|s| s.name == store)
            .and_then(|s| s.get(key).cloned());
        Box::pin(async move { Ok(found) })
    }

    fn put_all<'a>(
        &'a self,
        store: &'a str,
        entries: Vec<(String, StoredResponse)>,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            check_store_name(store)?;
            let mut stores = self.stores.write();
            let index = match stores.iter().position(|s| s.name == store) {
                Some(index) => index,
                None => {
                    stores.push(Store::new(store));
                    stores.len() - 1
                }
            };
            for (key, response) in entries {
                stores[index].insert(key, response);
            }
            Ok(())
        })
    }

    fn keys<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
        let keys = self
            .stores
            .read()
            .iter()
            .find(|s| s.name == store)
            .map(Store::keys)
            .unwrap_or_default();
        Box::pin(async move { Ok(keys) })
    }

    fn remove<'a>(
        &'a self,
        store: &'a str,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<usize, CacheError>> {
        let removed = self
            .stores
            .write()
            .iter_mut()
            .find(|s| s.name == store)
            .map(|s| s.remove(keys))
            .unwrap_or(0);
        Box::pin(async move { Ok(removed) })
    }

    fn trim<'a>(&'a self, store: &'a str, max: usize) -> BoxFuture<'a, Result<usize, CacheError>> {
        let removed = self
            .stores
            .write()
            .iter_mut()
            .find(|s| s.name == store)
            .map(|s| s.trim(max))
            .unwrap_or(0);
        Box::pin(async move { Ok(removed) })
    }
}

/// Storage persisted as one JSON file per store under a directory.
///
/// Files are replaced atomically (write to a temporary file, then rename), and
/// read-modify-write cycles are serialized so concurrent callers never
/// interleave partial updates.
pub struct FsCacheStorage {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FsCacheStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn store_path(&self, store: &str) -> PathBuf {
        self.dir.join(format!("{store}.json"))
    }

    async fn read_store(&self, store: &str) -> Result<Option<Store>, CacheError> {
        check_store_name(store)?;
        let path = self.store_path(store);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| CacheError::Corrupt { path, source })
    }

    async fn write_store(&self, store: &Store) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CacheError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let path = self.store_path(&store.name);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", store.name, uuid::Uuid::new_v4()));
        let contents = serde_json::to_vec(store).map_err(|source| CacheError::Corrupt {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|source| CacheError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| CacheError::Io { path, source })
    }

    async fn names(&self) -> Result<Vec<String>, CacheError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut found = Vec::new();
        loop {
            let entry = dir.next_entry().await.map_err(|source| CacheError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if check_store_name(name).is_err() {
                continue;
            }
            let created = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.created().or_else(|_| m.modified()).ok());
            found.push((created, name.to_string()));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, name)| name).collect())
    }

    async fn delete(&self, store: &str) -> Result<bool, CacheError> {
        check_store_name(store)?;
        let _lock = self.write_lock.lock().await;
        let path = self.store_path(store);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    async fn insert(&self, store: &str, entries: Vec<(String, StoredResponse)>) -> Result<(), CacheError> {
        let _lock = self.write_lock.lock().await;
        let mut current = self.read_store(store).await?.unwrap_or_else(|| Store::new(store));
        for (key, response) in entries {
            current.insert(key, response);
        }
        self.write_store(&current).await
    }

    async fn remove_keys(&self, store: &str, keys: &[String]) -> Result<usize, CacheError> {
        let _lock = self.write_lock.lock().await;
        let Some(mut current) = self.read_store(store).await? else {
            return Ok(0);
        };
        let removed = current.remove(keys);
        if removed > 0 {
            self.write_store(&current).await?;
        }
        Ok(removed)
    }

    async fn trim_store(&self, store: &str, max: usize) -> Result<usize, CacheError> {
        let _lock = self.write_lock.lock().await;
        let Some(mut current) = self.read_store(store).await? else {
            return Ok(0);
        };
        let removed = current.trim(max);
        if removed > 0 {
            self.write_store(&current).await?;
        }
        Ok(removed)
    }
}

impl CacheStorage for FsCacheStorage {
    fn store_names(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
        Box::pin(self.names())
    }

    fn delete_store<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(self.delete(store))
    }

    fn get<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredResponse>, CacheError>> {
        Box::pin(async move {
            Ok(self
                .read_store(store)
                .await?
                .and_then(|s| s.get(key).cloned()))
        })
    }

    fn put_all<'a>(
        &'a self,
        store: &'a str,
        entries: Vec<(String, StoredResponse)>,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(self.insert(store, entries))
    }

    fn keys<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
        Box::pin(async move {
            Ok(self
                .read_store(store)
                .await?
                .map(|s| s.keys())
                .unwrap_or_default())
        })
    }

    fn remove<'a>(
        &'a self,
        store: &'a str,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<usize, CacheError>> {
        Box::pin(self.remove_keys(store, keys))
    }

    fn trim<'a>(&'a self, store: &'a str, max: usize) -> BoxFuture<'a, Result<usize, CacheError>> {
        Box::pin(self.trim_store(store, max))
    }
}
