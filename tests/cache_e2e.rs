//! Offline cache manager over the file-backed store and a real HTTP origin.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use agentdash::cache::{
    CacheConfig, CacheManager, CacheRequest, CacheStorage, FsCacheStorage, HttpNetwork, Network,
    NetworkError, Phase, ResponseOrigin, StoredResponse,
};
use axum::routing::get;
use common::start_server;
use futures::future::BoxFuture;

/// Real HTTP network that can be switched off.
struct Switchable {
    inner: HttpNetwork,
    online: AtomicBool,
}

impl Network for Switchable {
    fn fetch<'a>(
        &'a self,
        request: &'a CacheRequest,
    ) -> BoxFuture<'a, Result<StoredResponse, NetworkError>> {
        if self.online.load(Ordering::SeqCst) {
            self.inner.fetch(request)
        } else {
            Box::pin(async { Err(NetworkError::Unreachable("offline".into())) })
        }
    }
}

async fn origin(runs_hits: Arc<AtomicUsize>) -> String {
    let app = axum::Router::new()
        .route("/", get(|| async { "<html>shell</html>" }))
        .route("/offline.html", get(|| async { "<html>offline</html>" }))
        .route("/api/status", get(|| async { r#"{"ok":true}"# }))
        .route(
            "/api/runs/{id}",
            get(move |axum::extract::Path(id): axum::extract::Path<String>| {
                runs_hits.fetch_add(1, Ordering::SeqCst);
                async move { format!("run {id}") }
            }),
        );
    format!("http://{}/", start_server(app).await)
}

fn config() -> CacheConfig {
    CacheConfig {
        static_cache_name: "agentdash-static-v4".into(),
        api_cache_name: "agentdash-api-v1".into(),
        max_api_entries: 2,
        shell_assets: vec!["/".into(), "/offline.html".into()],
        api_prefixes: vec!["/api/status".into(), "/api/runs".into()],
        offline_document: "/offline.html".into(),
    }
}

#[tokio::test]
async fn test_full_lifecycle_against_http_origin() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsCacheStorage::new(dir.path()));
    storage
        .put_all(
            "agentdash-static-v3",
            vec![("/".into(), StoredResponse::new(200, "old shell"))],
        )
        .await
        .unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let network = Arc::new(Switchable {
        inner: HttpNetwork::new(&origin(hits.clone()).await).unwrap(),
        online: AtomicBool::new(true),
    });
    let manager = CacheManager::new(config(), storage.clone(), network.clone());

    manager.install().await.unwrap();
    assert_eq!(manager.activate().await.unwrap(), vec!["agentdash-static-v3"]);
    assert_eq!(manager.phase(), Phase::Active);

    for url in ["/api/runs/1", "/api/runs/2", "/api/runs/3", "/api/status"] {
        let outcome = manager.handle_fetch(&CacheRequest::get(url)).await.unwrap();
        assert_eq!(outcome.origin, ResponseOrigin::Network);
        assert_eq!(outcome.response.status, 200);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(
        storage.keys("agentdash-api-v1").await.unwrap(),
        vec!["/api/runs/3", "/api/status"]
    );

    network.online.store(false, Ordering::SeqCst);

    let cached = manager
        .handle_fetch(&CacheRequest::get("/api/runs/3"))
        .await
        .unwrap();
    assert_eq!(cached.origin, ResponseOrigin::ApiCache);
    assert_eq!(cached.response.body, b"run 3".to_vec());

    let evicted = manager.handle_fetch(&CacheRequest::get("/api/runs/1")).await;
    assert!(matches!(evicted, Err(NetworkError::Unreachable(_))));

    let page = manager
        .handle_fetch(&CacheRequest::navigate("/agents/build"))
        .await
        .unwrap();
    assert_eq!(page.origin, ResponseOrigin::OfflineDocument);
    assert_eq!(page.response.body, b"<html>offline</html>".to_vec());
}

#[tokio::test]
async fn test_cache_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let base = origin(hits).await;

    {
        let storage = Arc::new(FsCacheStorage::new(dir.path()));
        let network = Arc::new(HttpNetwork::new(&base).unwrap());
        let manager = CacheManager::new(config(), storage, network);
        manager.install().await.unwrap();
        manager.activate().await.unwrap();
        manager
            .handle_fetch(&CacheRequest::get("/api/status"))
            .await
            .unwrap();
    }

    let storage = Arc::new(FsCacheStorage::new(dir.path()));
    let offline = Arc::new(Switchable {
        inner: HttpNetwork::new(&base).unwrap(),
        online: AtomicBool::new(true),
    });
    let manager = CacheManager::new(config(), storage, offline.clone());
    manager.install().await.unwrap();
    assert!(manager.activate().await.unwrap().is_empty());

    offline.online.store(false, Ordering::SeqCst);
    let outcome = manager
        .handle_fetch(&CacheRequest::get("/api/status"))
        .await
        .unwrap();
    assert_eq!(outcome.origin, ResponseOrigin::ApiCache);
    assert_eq!(outcome.response.body, br#"{"ok":true}"#.to_vec());
}

#[tokio::test]
async fn test_install_fails_when_an_asset_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsCacheStorage::new(dir.path()));
    let hits = Arc::new(AtomicUsize::new(0));
    let network = Arc::new(HttpNetwork::new(&origin(hits).await).unwrap());

    let mut config = config();
    config.shell_assets.push("/static/missing.js".into());
    let manager = CacheManager::new(config, storage.clone(), network);

    assert!(manager.install().await.is_err());
    assert_eq!(manager.phase(), Phase::Redundant);
    assert!(storage.store_names().await.unwrap().is_empty());
}
