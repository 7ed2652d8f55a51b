use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Component, Path as StdPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use okcvm_config::ConfigPatch;
use okcvm_git::Snapshot;
use okcvm_session::{BootPayload, Upload};
use okcvm_store::{Conversation, ConversationSummary};
use okcvm_vm::{HistoryEntry, VmEvent, VmInfo};

use crate::error::ApiError;
use crate::identity;
use crate::AppState;

type Params = HashMap<String, String>;

fn client_id(headers: &HeaderMap, query: &Params) -> String {
    identity::resolve(None, headers, query)
}

pub async fn get_config(State(state): State<AppState>) -> Json<okcvm_config::AppConfig> {
    Json(state.config.current().redacted())
}

pub async fn post_config(State(state): State<AppState>, Json(patch): Json<ConfigPatch>) -> Json<okcvm_config::AppConfig> {
    state.config.apply_patch(patch);
    Json(state.config.current().redacted())
}

pub async fn session_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
) -> Result<Json<VmInfo>, ApiError> {
    let session = state.sessions.get(&client_id(&headers, &query));
    let boot = session.boot().await?;
    Ok(Json(boot.vm_info))
}

pub async fn session_boot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
) -> Result<Json<BootPayload>, ApiError> {
    let session = state.sessions.get(&client_id(&headers, &query));
    Ok(Json(session.boot().await?))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub replace_last: bool,
    #[serde(default)]
    pub stream: bool,
}

fn wants_sse(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Json(req): Json<ChatRequest>,
) -> Response {
    let session = state.sessions.get(&client_id(&headers, &query));

    if req.stream && wants_sse(&headers) {
        return chat_stream(session, req).await.into_response();
    }

    match session.respond(&req.message, req.replace_last, None).await {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Channel backlog at which the bridge starts coalescing consecutive
/// `token` events instead of forwarding each as its own SSE frame (§4.G).
const COALESCE_THRESHOLD: usize = EVENT_CHANNEL_CAPACITY / 2;

/// Drains `rx`, concatenating the `delta`s of consecutive `VmEvent::Token`
/// events into one once the channel backlog reaches [`COALESCE_THRESHOLD`].
/// `tool_*` events are never coalesced and always break a run of tokens.
fn coalesce_tokens(rx: mpsc::Receiver<VmEvent>) -> impl Stream<Item = VmEvent> {
    futures::stream::unfold((rx, None::<VmEvent>), |(mut rx, pending)| async move {
        let mut event = match pending {
            Some(event) => event,
            None => rx.recv().await?,
        };

        if let VmEvent::Token { delta } = &mut event {
            while rx.len() >= COALESCE_THRESHOLD {
                match rx.try_recv() {
                    Ok(VmEvent::Token { delta: next }) => delta.push_str(&next),
                    Ok(other) => return Some((event, (rx, Some(other)))),
                    Err(_) => break,
                }
            }
        }

        Some((event, (rx, None)))
    })
}

/// Bridges the VM's token/tool event channel into an SSE stream, then
/// appends `final` (the fully normalised [`ChatPayload`]) and `stop` once
/// the turn completes, per §4.G's ordering guarantee: `final` is always the
/// last non-`stop` event.
async fn chat_stream(
    session: Arc<okcvm_session::SessionState>,
    req: ChatRequest,
) -> Sse<std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>> {
    let (tx, rx) = mpsc::channel::<VmEvent>(EVENT_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move { session.respond(&req.message, req.replace_last, Some(tx)).await });

    let token_events = coalesce_tokens(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().data(data))
    });

    let completion_events = futures::stream::once(async move {
        match handle.await {
            Ok(Ok(payload)) => vec![
                Ok(Event::default().data(serde_json::to_string(&json!({"type": "final", "payload": payload})).unwrap_or_default())),
                Ok(Event::default().data(serde_json::to_string(&json!({"type": "stop"})).unwrap_or_default())),
            ],
            Ok(Err(e)) => {
                vec![Ok(Event::default().data(serde_json::to_string(&json!({"type": "error", "message": e.to_string()})).unwrap_or_default()))]
            }
            Err(join_error) => {
                vec![Ok(Event::default().data(
                    serde_json::to_string(&json!({"type": "error", "message": join_error.to_string()})).unwrap_or_default(),
                ))]
            }
        }
    })
    .flat_map(futures::stream::iter);

    Sse::new(Box::pin(token_events.chain(completion_events)))
}

pub async fn get_history_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Path(id): Path<String>,
) -> Result<Json<HistoryEntry>, ApiError> {
    let session = state.sessions.get(&client_id(&headers, &query));
    let mut matches = session.list_history(Some(&id)).await?;
    matches.pop().map(Json).ok_or_else(|| ApiError::NotFound(format!("history entry '{id}' not found")))
}

pub async fn delete_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
) -> Result<StatusCode, ApiError> {
    let session = state.sessions.get(&client_id(&headers, &query));
    session.delete_history().await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
) -> Result<Json<Vec<Upload>>, ApiError> {
    let session = state.sessions.get(&client_id(&headers, &query));
    Ok(Json(session.list_uploads().await?))
}

pub async fn upload_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    mut multipart: Multipart,
) -> Result<Json<okcvm_session::UploadPayload>, ApiError> {
    let session = state.sessions.get(&client_id(&headers, &query));

    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::BadRequest(e.to_string()))? {
        let name = field.file_name().map(str::to_string).or_else(|| field.name().map(str::to_string)).unwrap_or_else(|| "upload".to_string());
        let bytes = field.bytes().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
        files.push((name, bytes.to_vec()));
    }

    Ok(Json(session.upload_files(files).await?))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotListQuery {
    #[serde(default = "default_snapshot_limit")]
    pub limit: usize,
}

fn default_snapshot_limit() -> usize {
    50
}

pub async fn list_snapshots(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Query(opts): Query<SnapshotListQuery>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    let session = state.sessions.get(&client_id(&headers, &query));
    Ok(Json(session.list_snapshots(opts.limit).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateSnapshotRequest {
    #[serde(default)]
    pub label: Option<String>,
}

pub async fn create_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Json(body): Json<CreateSnapshotRequest>,
) -> Result<Json<Snapshot>, ApiError> {
    let session = state.sessions.get(&client_id(&headers, &query));
    let label = body.label.unwrap_or_default();
    Ok(Json(session.create_snapshot(&label).await?))
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub checkout: bool,
}

pub async fn restore_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Json(body): Json<RestoreRequest>,
) -> Result<Json<okcvm_session::WorkspaceState>, ApiError> {
    let session = state.sessions.get(&client_id(&headers, &query));
    let reference = body
        .snapshot_id
        .or(body.branch)
        .ok_or_else(|| ApiError::BadRequest("restore requires snapshot_id or branch".to_string()))?;
    Ok(Json(session.restore_snapshot(&reference, body.checkout).await?))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    Ok(Json(state.conversations.list(&client_id(&headers, &query)).await?))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Json(payload): Json<Conversation>,
) -> Result<Json<Conversation>, ApiError> {
    let client_id = client_id(&headers, &query);
    Ok(Json(state.conversations.save(&client_id, payload).await?))
}

pub async fn update_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Path(id): Path<String>,
    Json(mut payload): Json<Conversation>,
) -> Result<Json<Conversation>, ApiError> {
    let client_id = client_id(&headers, &query);
    payload.id = id;
    Ok(Json(state.conversations.save(&client_id, payload).await?))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let client_id = client_id(&headers, &query);
    let report = state.conversations.delete(&client_id, &id).await?;

    if let Some(root) = report.workspace_root {
        let root = PathBuf::from(root);
        let _ = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&root)).await;
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct DeploymentError {
    error: String,
}

pub async fn deployment_asset_root(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Path(deployment_id): Path<String>,
) -> Response {
    serve_deployment_asset(state, &headers, &query, &deployment_id, None).await
}

pub async fn deployment_asset_path(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    Path((deployment_id, path)): Path<(String, String)>,
) -> Response {
    serve_deployment_asset(state, &headers, &query, &deployment_id, Some(path)).await
}

/// §4.I: resolve `<storage_root>/<client_id>/deployments/<deployment_id>/<path>`,
/// reject anything that escapes `<storage_root>/<client_id>/deployments/`
/// (absolute paths, `..` segments, symlink escapes), default `path` to
/// `index.html`, and set `Content-Type: text/html` for `.html`/`.htm`.
async fn serve_deployment_asset(state: AppState, headers: &HeaderMap, query: &Params, deployment_id: &str, path: Option<String>) -> Response {
    let client_id = client_id(headers, query);
    let deployments_root = PathBuf::from(state.config.current().storage.storage_root.clone()).join(&client_id).join("deployments");

    let requested = path.unwrap_or_else(|| "index.html".to_string());
    let raw = format!("{deployment_id}/{requested}");

    let target = match safe_join(&deployments_root, &raw) {
        Some(target) => target,
        None => return bad_request_json("path escapes deployment root"),
    };

    let canonical_root = match deployments_root.canonicalize() {
        Ok(root) => root,
        Err(_) => return not_found_json("no deployments for this client"),
    };
    let canonical_target = match target.canonicalize() {
        Ok(target) => target,
        Err(_) => return not_found_json("deployment asset not found"),
    };
    if !canonical_target.starts_with(&canonical_root) {
        return bad_request_json("path escapes deployment root");
    }

    let bytes = match tokio::fs::read(&canonical_target).await {
        Ok(bytes) => bytes,
        Err(_) => return not_found_json("deployment asset not found"),
    };

    let content_type = match canonical_target.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8".to_string(),
        _ => mime_guess::from_path(&canonical_target).first_or_octet_stream().to_string(),
    };

    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

fn bad_request_json(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(DeploymentError { error: message.to_string() })).into_response()
}

fn not_found_json(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(DeploymentError { error: message.to_string() })).into_response()
}

/// Joins `raw` onto `root` component-by-component, rejecting any `..`,
/// absolute, or prefix component outright rather than trusting string
/// prefix matching on the joined result.
fn safe_join(root: &StdPath, raw: &str) -> Option<PathBuf> {
    let mut joined = root.to_path_buf();
    for component in StdPath::new(raw).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(joined)
}

#[cfg(test)]
mod coalesce_tests {
    use super::*;

    #[tokio::test]
    async fn below_threshold_forwards_tokens_one_by_one() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        for i in 0..3 {
            tx.send(VmEvent::Token { delta: format!("{i}") }).await.unwrap();
        }
        drop(tx);

        let events: Vec<VmEvent> = coalesce_tokens(rx).collect().await;
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn backlog_past_threshold_concatenates_consecutive_tokens() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Fill well past COALESCE_THRESHOLD before the consumer ever polls,
        // so the backlog seen on the first receive is deep enough to trigger
        // coalescing. Draining brings the backlog below the threshold after
        // a few merges, matching a real bridge catching back up.
        let total = COALESCE_THRESHOLD + 4;
        for i in 0..total {
            tx.send(VmEvent::Token { delta: i.to_string() }).await.unwrap();
        }
        drop(tx);

        let events: Vec<VmEvent> = coalesce_tokens(rx).collect().await;
        assert_eq!(events.len(), total - 4);
        match &events[0] {
            VmEvent::Token { delta } => assert_eq!(delta, "01234"),
            other => panic!("expected a coalesced leading Token event, got {other:?}"),
        }
        let tail: String = events[1..]
            .iter()
            .map(|e| match e {
                VmEvent::Token { delta } => delta.clone(),
                other => panic!("expected a Token event, got {other:?}"),
            })
            .collect();
        let expected_tail: String = (5..total).map(|i| i.to_string()).collect();
        assert_eq!(tail, expected_tail);
    }

    #[tokio::test]
    async fn tool_events_are_never_coalesced() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let leading = COALESCE_THRESHOLD + 2;
        for i in 0..leading {
            tx.send(VmEvent::Token { delta: i.to_string() }).await.unwrap();
        }
        tx.send(VmEvent::ToolStarted { invocation_id: "call_1".to_string(), tool_name: "noop".to_string(), input: json!({}) }).await.unwrap();
        tx.send(VmEvent::Token { delta: "after".to_string() }).await.unwrap();
        drop(tx);

        let events: Vec<VmEvent> = coalesce_tokens(rx).collect().await;

        let tool_positions: Vec<usize> = events.iter().enumerate().filter(|(_, e)| matches!(e, VmEvent::ToolStarted { .. })).map(|(i, _)| i).collect();
        assert_eq!(tool_positions.len(), 1, "the tool event must survive untouched and exactly once");
        let tool_index = tool_positions[0];

        match &events[tool_index] {
            VmEvent::ToolStarted { invocation_id, tool_name, .. } => {
                assert_eq!(invocation_id, "call_1");
                assert_eq!(tool_name, "noop");
            }
            _ => unreachable!(),
        }

        match events.last().unwrap() {
            VmEvent::Token { delta } => assert_eq!(delta, "after"),
            other => panic!("expected the trailing Token event, got {other:?}"),
        }

        // No event before the tool marker absorbed the token sent after it.
        for event in &events[..tool_index] {
            if let VmEvent::Token { delta } = event {
                assert!(!delta.contains("after"));
            }
        }
    }
}
