//! Offline response cache for the dashboard's background worker.
//!
//! Two independent caches are kept:
//!
//! - the **static cache**, named with a version tag, holding the application
//!   shell. It is filled all-or-nothing at install time and only ever
//!   replaced wholesale when the version changes;
//! - the **API cache**, holding responses of allow-listed API reads, bounded
//!   to `max_api_entries` with FIFO eviction.
//!
//! [`CacheManager`] walks through [`Phase`]s: `install()` then `activate()`,
//! after which `handle_fetch()` serves intercepted requests.

mod network;
mod policy;
mod storage;

pub use network::{HttpNetwork, Network, NetworkError};
pub use policy::{classify, entries_to_evict, request_path, RequestClass};
pub use storage::{CacheStorage, FsCacheStorage, MemoryCacheStorage};
pub(crate) use storage::check_store_name;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bound on the API cache.
pub const DEFAULT_MAX_API_ENTRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Versioned name of the static cache. Bump it on every deployment.
    pub static_cache_name: String,
    /// Name of the API cache.
    pub api_cache_name: String,
    pub max_api_entries: usize,
    /// Application shell fetched at install time.
    pub shell_assets: Vec<String>,
    /// Path prefixes of API reads worth keeping for offline use.
    pub api_prefixes: Vec<String>,
    /// Document served for navigations while offline. Must be a shell asset.
    pub offline_document: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            static_cache_name: "agentdash-static-v1".into(),
            api_cache_name: "agentdash-api-v1".into(),
            max_api_entries: DEFAULT_MAX_API_ENTRIES,
            shell_assets: ["/", "/offline.html", "/static/app.css", "/static/app.js", "/manifest.json"]
                .map(String::from)
                .to_vec(),
            api_prefixes: ["/api/status", "/api/agents", "/api/health", "/api/timeline", "/api/runs"]
                .map(String::from)
                .to_vec(),
            offline_document: "/offline.html".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    #[default]
    Other,
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRequest {
    pub method: String,
    /// Absolute or origin-relative URL. Also the cache key.
    pub url: String,
    #[serde(default)]
    pub mode: RequestMode,
}

impl CacheRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            mode: RequestMode::Other,
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn key(&self) -> &str {
        &self.url
    }
}

/// A response as kept in a cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache store {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid cache store name: {0}")]
    InvalidStoreName(String),

    #[error("failed to fetch shell asset {asset}: {reason}")]
    AssetFetch { asset: String, reason: String },

    #[error("{operation} is not allowed in phase {phase:?}")]
    WrongPhase {
        operation: &'static str,
        phase: Phase,
    },
}

/// Lifecycle of the cache manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for (or running) `install()`.
    Installing,
    /// Shell cached; waiting for `activate()`.
    Installed,
    /// Purging stale stores.
    Activating,
    /// Intercepting requests.
    Active,
    /// Install failed. A fresh manager must be created.
    Redundant,
}

/// Where a response handed back by [`CacheManager::handle_fetch`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOrigin {
    Network,
    ApiCache,
    StaticCache,
    OfflineDocument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub response: StoredResponse,
    pub origin: ResponseOrigin,
}

impl FetchOutcome {
    fn network(response: StoredResponse) -> Self {
        Self {
            response,
            origin: ResponseOrigin::Network,
        }
    }
}

pub struct CacheManager {
    config: CacheConfig,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    phase: RwLock<Phase>,
}

impl CacheManager {
    pub fn new(config: CacheConfig, storage: Arc<dyn CacheStorage>, network: Arc<dyn Network>) -> Self {
        Self {
            config,
            storage,
            network,
            phase: RwLock::new(Phase::Installing),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn expect_phase(&self, operation: &'static str, expected: Phase) -> Result<(), CacheError> {
        let phase = self.phase();
        if phase != expected {
            return Err(CacheError::WrongPhase { operation, phase });
        }
        Ok(())
    }

    /// Fetch the whole application shell into the static cache.
    ///
    /// All-or-nothing: if any asset fails to fetch (or returns a non-2xx
    /// status) nothing is written and the manager becomes [`Phase::Redundant`].
    pub async fn install(&self) -> Result<(), CacheError> {
        self.expect_phase("install", Phase::Installing)?;

        let mut entries = Vec::with_capacity(self.config.shell_assets.len());
        for asset in &self.config.shell_assets {
            let fetched = self.network.fetch(&CacheRequest::get(asset.as_str())).await;
            let reason = match fetched {
                Ok(response) if response.is_success() => {
                    entries.push((asset.clone(), response));
                    continue;
                }
                Ok(response) => format!("status {}", response.status),
                Err(e) => e.to_string(),
            };
            tracing::error!(%asset, %reason, "install failed");
            *self.phase.write() = Phase::Redundant;
            return Err(CacheError::AssetFetch {
                asset: asset.clone(),
                reason,
            });
        }

        if let Err(e) = self
            .storage
            .put_all(&self.config.static_cache_name, entries)
            .await
        {
            tracing::error!(error = %e, "failed to store application shell");
            *self.phase.write() = Phase::Redundant;
            return Err(e);
        }

        tracing::info!(
            cache = %self.config.static_cache_name,
            assets = self.config.shell_assets.len(),
            "application shell cached"
        );
        *self.phase.write() = Phase::Installed;
        Ok(())
    }

    /// Delete every store that is neither the current static cache nor the
    /// API cache. Returns the names of the deleted stores.
    ///
    /// Storage failures are logged and do not prevent activation.
    pub async fn activate(&self) -> Result<Vec<String>, CacheError> {
        self.expect_phase("activate", Phase::Installed)?;
        *self.phase.write() = Phase::Activating;

        let keep = [
            self.config.static_cache_name.as_str(),
            self.config.api_cache_name.as_str(),
        ];
        let mut deleted = Vec::new();
        match self.storage.store_names().await {
            Ok(names) => {
                for name in names.into_iter().filter(|n| !keep.contains(&n.as_str())) {
                    match self.storage.delete_store(&name).await {
                        Ok(_) => {
                            tracing::info!(cache = %name, "deleted stale cache");
                            deleted.push(name);
                        }
                        Err(e) => tracing::warn!(cache = %name, error = %e, "failed to delete stale cache"),
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to list caches during activation"),
        }

        *self.phase.write() = Phase::Active;
        Ok(deleted)
    }

    /// Serve an intercepted request.
    ///
    /// Before activation every request goes straight to the network.
    pub async fn handle_fetch(&self, request: &CacheRequest) -> Result<FetchOutcome, NetworkError> {
        if self.phase() != Phase::Active {
            return self.network.fetch(request).await.map(FetchOutcome::network);
        }

        match classify(&self.config, request) {
            RequestClass::Navigation => self.fetch_navigation(request).await,
            RequestClass::CacheableApi => self.fetch_api(request).await,
            RequestClass::Passthrough => self.network.fetch(request).await.map(FetchOutcome::network),
        }
    }

    async fn fetch_navigation(&self, request: &CacheRequest) -> Result<FetchOutcome, NetworkError> {
        let err = match self.network.fetch(request).await {
            Ok(response) => return Ok(FetchOutcome::network(response)),
            Err(err) => err,
        };
        tracing::debug!(url = %request.url, error = %err, "navigation failed, serving from cache");

        let statics = &self.config.static_cache_name;
        let path = request_path(&request.url);
        if let Some(response) = self.cached(statics, &path).await {
            return Ok(FetchOutcome {
                response,
                origin: ResponseOrigin::StaticCache,
            });
        }
        match self.cached(statics, &self.config.offline_document).await {
            Some(response) => Ok(FetchOutcome {
                response,
                origin: ResponseOrigin::OfflineDocument,
            }),
            None => Err(err),
        }
    }

    async fn fetch_api(&self, request: &CacheRequest) -> Result<FetchOutcome, NetworkError> {
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.remember(request, &response).await;
                }
                Ok(FetchOutcome::network(response))
            }
            Err(err) => match self.cached(&self.config.api_cache_name, request.key()).await {
                Some(response) => {
                    tracing::debug!(url = %request.url, "network failed, serving cached api response");
                    Ok(FetchOutcome {
                        response,
                        origin: ResponseOrigin::ApiCache,
                    })
                }
                None => Err(err),
            },
        }
    }

    /// Store an API response and trim. Failures only cost the cache entry.
    async fn remember(&self, request: &CacheRequest, response: &StoredResponse) {
        let stored = self
            .storage
            .put_all(
                &self.config.api_cache_name,
                vec![(request.key().to_string(), response.clone())],
            )
            .await;
        if let Err(e) = stored {
            tracing::warn!(url = %request.url, error = %e, "failed to cache api response");
            return;
        }
        if let Err(e) = self.trim_api_cache().await {
            tracing::warn!(error = %e, "failed to trim api cache");
        }
    }

    async fn cached(&self, store: &str, key: &str) -> Option<StoredResponse> {
        match self.storage.get(store, key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(cache = %store, %key, error = %e, "cache lookup failed");
                None
            }
        }
    }

    /// Evict the oldest API entries until at most `max_api_entries` remain.
    /// Returns how many entries were evicted.
    pub async fn trim_api_cache(&self) -> Result<usize, CacheError> {
        let store = &self.config.api_cache_name;
        let removed = self.storage.trim(store, self.config.max_api_entries).await?;
        if removed > 0 {
            tracing::debug!(cache = %store, removed, "trimmed api cache");
        }
        Ok(removed)
    }
}
