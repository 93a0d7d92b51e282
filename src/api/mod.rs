pub mod error;
mod handlers;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::stream::StreamManager;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub streams: StreamManager,
}

/// Configuration for the HTTP router.
///
/// Use `RouterConfig::default()` in tests for a minimal setup.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Origins allowed to open streams from another host (e.g. a dashboard
    /// served by a separate dev server). Empty disables CORS.
    pub cors_origins: Vec<String>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/agents", get(agent_list))
        .route("/agents/{name}/stream", get(agent_stream))
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http());

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::CACHE_CONTROL]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{AgentSession, Capture, Cursor, OutputSource, SourceError};
    use crate::session::SessionName;
    use crate::stream::StreamConfig;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt; // for oneshot()

    /// Source that counts calls and always reports the session as gone.
    #[derive(Default)]
    struct CountingSource {
        reads: AtomicUsize,
    }

    impl OutputSource for CountingSource {
        fn read_since<'a>(
            &'a self,
            session: &'a SessionName,
            _cursor: &'a Cursor,
        ) -> BoxFuture<'a, Result<Option<Capture>, SourceError>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Err(SourceError::SessionGone(session.to_string())) })
        }

        fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<AgentSession>, SourceError>> {
            Box::pin(async {
                Ok(vec![AgentSession {
                    name: "build".into(),
                    windows: 1,
                    attached: false,
                    created: 0,
                }])
            })
        }
    }

    fn create_test_app() -> (Router, Arc<CountingSource>) {
        let source = Arc::new(CountingSource::default());
        let streams = StreamManager::new(source.clone(), StreamConfig::default());
        (router(AppState { streams }, RouterConfig::default()), source)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = create_test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["x-content-type-options"],
            "nosniff"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["streams"], 0);
    }

    #[tokio::test]
    async fn agents_lists_source_sessions() {
        let (app, _) = create_test_app();
        let response = app
            .oneshot(Request::builder().uri("/agents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["agents"][0]["name"], "build");
    }

    #[tokio::test]
    async fn invalid_name_is_rejected_before_the_source() {
        let (app, source) = create_test_app();
        for uri in [
            "/agents/a;b/stream",
            "/agents/..%2Fetc/stream",
            "/agents/%60id%60/stream",
            "/agents/a$b/stream",
        ] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_ne!(
                response.headers()[header::CONTENT_TYPE],
                "text/event-stream"
            );
        }
        assert_eq!(source.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_name_opens_event_stream() {
        let (app, _) = create_test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/agents/build/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

        // The source reports the session gone, so the body is one error frame.
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.starts_with("event: agent_error\n"), "{text}");
        assert!(text.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn cors_layer_applies_when_configured() {
        let source = Arc::new(CountingSource::default());
        let streams = StreamManager::new(source, StreamConfig::default());
        let app = router(
            AppState { streams },
            RouterConfig {
                cors_origins: vec!["http://dash.local".into()],
            },
        );
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://dash.local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://dash.local"
        );
    }
}
