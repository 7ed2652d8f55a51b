//! REST routing, identity resolution, and SSE streaming bridge (spec
//! component I) — the daemon's one connection handler generalised from a
//! single Unix socket to an `axum` router serving many HTTP clients.

mod error;
mod identity;
mod routes;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use okcvm_config::ConfigHandle;
use okcvm_session::SessionStore;
use okcvm_store::ConversationStore;

pub use error::ApiError;

/// Shared state every handler reaches for: the per-client session map, the
/// conversation store, and the live config snapshot. Cheap to clone — every
/// field is already an `Arc` (or, for `ConfigHandle`, an `Arc`-backed swap
/// pointer) — so it's handed to `axum` by value rather than wrapped again.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub conversations: Arc<ConversationStore>,
    pub config: ConfigHandle,
}

impl AppState {
    pub fn new(sessions: Arc<SessionStore>, conversations: Arc<ConversationStore>, config: ConfigHandle) -> Self {
        Self { sessions, conversations, config }
    }
}

/// Builds the full router (§6.1). Deployment asset routes are registered
/// last so they don't shadow the `/api/*` tree.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/config", get(routes::get_config).post(routes::post_config))
        .route("/api/session/info", get(routes::session_info))
        .route("/api/session/boot", get(routes::session_boot))
        .route("/api/chat", post(routes::chat))
        .route("/api/session/history/{id}", get(routes::get_history_entry))
        .route("/api/session/history", delete(routes::delete_history))
        .route("/api/session/files", get(routes::list_files).post(routes::upload_files))
        .route("/api/session/workspace/snapshots", get(routes::list_snapshots).post(routes::create_snapshot))
        .route("/api/session/workspace/restore", post(routes::restore_snapshot))
        .route("/api/conversations", get(routes::list_conversations).post(routes::create_conversation))
        .route("/api/conversations/{id}", put(routes::update_conversation).delete(routes::delete_conversation))
        .route("/{deployment_id}", get(routes::deployment_asset_root))
        .route("/{deployment_id}/{*path}", get(routes::deployment_asset_path))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use okcvm_config::AppConfig;
    use okcvm_llm::{ChatDriver, ChatMessage, ChatResponse};
    use okcvm_tools::ToolRegistry;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct EchoDriver;

    #[async_trait]
    impl ChatDriver for EchoDriver {
        async fn chat(
            &self,
            _system_prompt: &str,
            messages: &[ChatMessage],
            _tools: Option<&Value>,
            on_token: Option<mpsc::Sender<String>>,
        ) -> anyhow::Result<ChatResponse> {
            let last_user = messages.iter().rev().find_map(|m| m.content.clone()).unwrap_or_default();
            let reply = format!("echo: {last_user}");
            if let Some(tx) = on_token {
                let _ = tx.send(reply.clone()).await;
            }
            Ok(ChatResponse { model: "echo-model".to_string(), content: reply, tool_calls: vec![], finish_reason: "stop".to_string() })
        }
    }

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigHandle::new(AppConfig::default());
        let sessions = Arc::new(SessionStore::new(
            dir.path().to_path_buf(),
            config.clone(),
            Arc::new(EchoDriver),
            Arc::new(ToolRegistry::new()),
            "You are a helpful assistant. Workspace: {{mount}}",
        ));
        let conversations = Arc::new(ConversationStore::open_in_memory().await.unwrap());
        (dir, AppState::new(sessions, conversations, config))
    }

    #[tokio::test]
    async fn get_config_redacts_api_key() {
        let (_dir, mut state) = test_state().await;
        state.config.apply_patch(okcvm_config::ConfigPatch {
            llm: Some(okcvm_config::LlmConfig { provider: "openrouter".to_string(), model: "m".to_string(), api_key: Some("sk-secret".to_string()), base_url: None }),
            ..Default::default()
        });
        let app = router(state);

        let response = app.oneshot(Request::builder().uri("/api/config").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["llm"]["api_key"], "<redacted>");
    }

    #[tokio::test]
    async fn boot_then_chat_round_trips() {
        let (_dir, state) = test_state().await;
        let app = router(state);

        let boot = app
            .clone()
            .oneshot(Request::builder().uri("/api/session/boot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(boot.status(), StatusCode::OK);

        let chat = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"message": "hello"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(chat.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(chat.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["reply"], "echo: hello");
    }

    #[tokio::test]
    async fn history_entry_404s_when_missing() {
        let (_dir, state) = test_state().await;
        let app = router(state);

        let response = app.oneshot(Request::builder().uri("/api/session/history/does-not-exist").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn conversations_round_trip_through_create_and_list() {
        let (_dir, state) = test_state().await;
        let app = router(state);

        let create = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/conversations")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "id": "conv-1",
                            "client_id": "ignored-by-server",
                            "title": "First chat",
                            "created_at": "1970-01-01T00:00:00Z",
                            "updated_at": "1970-01-01T00:00:00Z",
                            "messages": [],
                            "branches": {},
                            "outputs": {}
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(create.status(), StatusCode::OK);

        let list = app.oneshot(Request::builder().uri("/api/conversations").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(list.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(list.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["title"], "First chat");
    }

    #[tokio::test]
    async fn unknown_deployment_asset_is_not_found() {
        let (_dir, state) = test_state().await;
        let app = router(state);

        let response = app.oneshot(Request::builder().uri("/no-such-deployment").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
