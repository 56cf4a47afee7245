//! Application state and HTTP server wiring.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, GatewaySettings};
use crate::credentials::CredentialPool;
use crate::images::ImageHost;
use crate::storage::{self, Namespace, Storage};
use crate::upstream::UpstreamClient;

use super::openai;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    /// Pool over the primary credential table.
    pub pool: Arc<CredentialPool>,
    /// Pool over the antigravity credential table.
    pub antigravity_pool: Arc<CredentialPool>,
    pub upstream: Arc<UpstreamClient>,
    pub images: Arc<ImageHost>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        // One client for everything: connection pooling across the backend
        // and the image host.
        let http_client = reqwest::Client::new();
        let pool = Arc::new(CredentialPool::new(storage.clone(), Namespace::Standard));
        let antigravity_pool =
            Arc::new(CredentialPool::new(storage.clone(), Namespace::Antigravity));
        let upstream = Arc::new(UpstreamClient::new(
            http_client.clone(),
            config.code_assist_endpoint.clone(),
        ));
        let images = Arc::new(ImageHost::new(http_client, config.picgo.clone()));
        Self {
            config,
            storage,
            pool,
            antigravity_pool,
            upstream,
            images,
        }
    }

    /// Dynamic settings view over the storage config cache.
    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings::new(self.storage.clone(), self.config.api_password.clone())
    }

    pub fn pool(&self, ns: Namespace) -> Arc<CredentialPool> {
        match ns {
            Namespace::Standard => self.pool.clone(),
            Namespace::Antigravity => self.antigravity_pool.clone(),
        }
    }
}

/// Build the application router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/models", get(openai::list_models_v1))
        .route("/v1/chat/completions", post(openai::chat_completions_v1))
        .route(
            "/antigravity/v1/models",
            get(openai::list_models_antigravity),
        )
        .route(
            "/antigravity/v1/chat/completions",
            post(openai::chat_completions_antigravity),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let storage = storage::init_storage(&config).await?;
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config, storage));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn test_router(dir: &std::path::Path) -> Router {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            postgres_dsn: None,
            valkey_url: None,
            credentials_dir: dir.to_path_buf(),
            api_password: Some("pwd".to_string()),
            code_assist_endpoint: "http://127.0.0.1:9".to_string(),
            picgo: Default::default(),
        };
        let storage = storage::init_storage(&config).await.unwrap();
        router(Arc::new(AppState::new(config, storage)))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn models_require_auth_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let response = app.oneshot(get("/v1/models", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn models_openai_shape_with_bearer() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let response = app.oneshot(get("/v1/models", Some("pwd"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "list");
        assert!(body["data"].is_array());
        assert!(body.get("models").is_none());
    }

    #[tokio::test]
    async fn models_gemini_shape_with_key_param() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let response = app.oneshot(get("/v1/models?key=pwd", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["models"].is_array());
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn models_wrong_key_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let response = app.oneshot(get("/v1/models?key=nope", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn models_wrong_bearer_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let response = app.oneshot(get("/v1/models", Some("nope"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn antigravity_models_open_without_auth() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let response = app
            .oneshot(get("/antigravity/v1/models", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "list");

        let dir2 = tempfile::tempdir().unwrap();
        let app = test_router(dir2.path()).await;
        let response = app
            .oneshot(get("/antigravity/v1/models?key=pwd", None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["models"].is_array());
    }

    #[tokio::test]
    async fn health_check_short_circuits_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                Some("pwd"),
                json!({ "model": "x", "messages": [{ "role": "user", "content": "Hi" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "gcli2api正常工作中"
        );
    }

    #[tokio::test]
    async fn chat_rejects_missing_and_wrong_auth() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let body = json!({ "model": "x", "messages": [{ "role": "user", "content": "hello" }] });

        let response = app
            .clone()
            .oneshot(post_json("/v1/chat/completions", None, body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post_json("/v1/chat/completions", Some("bad"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn chat_with_invalid_json_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("Content-Type", "application/json")
            .header("Authorization", "Bearer pwd")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_with_empty_pool_reports_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(dir.path()).await;
        let response = app
            .oneshot(post_json(
                "/v1/chat/completions",
                Some("pwd"),
                json!({ "model": "gemini-2.5-pro", "messages": [{ "role": "user", "content": "hello" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "no credentials available");
    }
}
