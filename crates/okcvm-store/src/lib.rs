//! Durable store of conversation trees.
//!
//! One row per conversation, keyed by `(client_id, id)`. Writes go through a
//! single SQL transaction; reads and writes for the whole database are
//! serialised behind one connection, matching `querymt-agent`'s "no
//! connection pool, one local transactional store" posture for a store this
//! small.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("conversation {id} belongs to a different client")]
    ClientMismatch { id: String },

    #[error("conversation {id} not found")]
    NotFound { id: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// The workspace side of a persisted conversation: where its files live and
/// what the git engine last saw.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_mount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub git_dirty: bool,
    /// Internal (host-side) workspace root, used for cleanup on delete. Not
    /// part of the public payload shape — carried alongside it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_root: Option<String>,
}

/// The full conversation tree as the HTTP surface and the browser see it.
/// Opaque to the store beyond the fields it indexes on — `messages`,
/// `branches` and `outputs` round-trip as free-form JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub client_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: serde_json::Value,
    #[serde(default)]
    pub branches: serde_json::Value,
    #[serde(default)]
    pub outputs: serde_json::Value,
    #[serde(default)]
    pub workspace: WorkspaceRef,
}

/// A summary row as returned by `List` — the full `payload` minus the large
/// JSON blobs, enough to render a conversation picker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub client_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Report of what `Delete` attempted to clean up on disk, beyond the row
/// itself. The actual workspace/deployment removal is performed by the
/// caller (it owns the workspace manager); the store only tells it what it
/// saw in the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub workspace_root: Option<String>,
    pub session_id: Option<String>,
}

/// Durable, transactional store for `Conversation` trees.
#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    pub async fn open(path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let path = path.into();
        let conn = tokio::task::spawn_blocking(move || -> PersistenceResult<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PersistenceError::Database(e.to_string()))?;
            }
            let mut conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
            init_schema(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))??;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Opens an in-memory database. Used by tests and by callers that don't
    /// need persistence across restarts.
    pub async fn open_in_memory() -> PersistenceResult<Self> {
        let conn = tokio::task::spawn_blocking(|| -> PersistenceResult<Connection> {
            let mut conn = Connection::open_in_memory()?;
            init_schema(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))??;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn run_blocking<F, R>(&self, f: F) -> PersistenceResult<R>
    where
        F: FnOnce(&mut Connection) -> PersistenceResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("conversation store connection poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))?
    }

    pub async fn list(&self, client_id: &str) -> PersistenceResult<Vec<ConversationSummary>> {
        let client_id = client_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, client_id, title, created_at, updated_at \
                 FROM conversations WHERE client_id = ?1 ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map(params![client_id], |row| {
                    Ok(ConversationSummary {
                        id: row.get(0)?,
                        client_id: row.get(1)?,
                        title: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get(&self, client_id: &str, id: &str) -> PersistenceResult<Conversation> {
        let client_id = client_id.to_string();
        let id = id.to_string();
        self.run_blocking(move |conn| load_conversation(conn, &client_id, &id)).await
    }

    /// Upserts by `id`. A row that already exists under a different
    /// `client_id` is rejected rather than rebound to the caller.
    pub async fn save(&self, client_id: &str, mut payload: Conversation) -> PersistenceResult<Conversation> {
        let client_id = client_id.to_string();
        payload.client_id = client_id.clone();
        payload.updated_at = Utc::now();

        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;

            let existing: Option<(String, DateTime<Utc>)> = tx
                .query_row(
                    "SELECT client_id, created_at FROM conversations WHERE id = ?1",
                    params![payload.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((owner, created_at)) => {
                    if owner != payload.client_id {
                        return Err(PersistenceError::ClientMismatch { id: payload.id.clone() });
                    }
                    // created_at is immutable once set; keep the DB's value
                    // regardless of what the caller passed in.
                    payload.created_at = created_at;
                }
                None if payload.created_at == DateTime::<Utc>::default() => {
                    payload.created_at = payload.updated_at;
                }
                None => {}
            }

            let messages_json = serde_json::to_string(&payload.messages)?;
            let branches_json = serde_json::to_string(&payload.branches)?;
            let outputs_json = serde_json::to_string(&payload.outputs)?;

            tx.execute(
                "INSERT INTO conversations (
                    id, client_id, title, created_at, updated_at,
                    messages_json, branches_json, outputs_json,
                    workspace_root, workspace_mount, session_id,
                    git_commit, git_dirty, internal_root
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    updated_at = excluded.updated_at,
                    messages_json = excluded.messages_json,
                    branches_json = excluded.branches_json,
                    outputs_json = excluded.outputs_json,
                    workspace_root = excluded.workspace_root,
                    workspace_mount = excluded.workspace_mount,
                    session_id = excluded.session_id,
                    git_commit = excluded.git_commit,
                    git_dirty = excluded.git_dirty,
                    internal_root = excluded.internal_root",
                params![
                    payload.id,
                    payload.client_id,
                    payload.title,
                    payload.created_at,
                    payload.updated_at,
                    messages_json,
                    branches_json,
                    outputs_json,
                    payload.workspace.workspace_root,
                    payload.workspace.workspace_mount,
                    payload.workspace.session_id,
                    payload.workspace.git_commit,
                    payload.workspace.git_dirty,
                    payload.workspace.internal_root,
                ],
            )?;

            tx.commit()?;
            Ok(payload)
        })
        .await
    }

    /// Removes the row and reports what the payload said about workspace
    /// state, so the caller can clean up the workspace and deployment
    /// directories it owns. Returns `NotFound` if the client doesn't own (or
    /// the id doesn't name) a conversation.
    pub async fn delete(&self, client_id: &str, id: &str) -> PersistenceResult<CleanupReport> {
        let client_id = client_id.to_string();
        let id = id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;

            let row: Option<(String, Option<String>, Option<String>)> = tx
                .query_row(
                    "SELECT client_id, internal_root, session_id FROM conversations WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let (owner, internal_root, session_id) = match row {
                Some(row) => row,
                None => return Err(PersistenceError::NotFound { id: id.clone() }),
            };
            if owner != client_id {
                return Err(PersistenceError::NotFound { id: id.clone() });
            }

            tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            tx.commit()?;

            Ok(CleanupReport { workspace_root: internal_root, session_id })
        })
        .await
    }
}

fn load_conversation(conn: &Connection, client_id: &str, id: &str) -> PersistenceResult<Conversation> {
    let row = conn
        .query_row(
            "SELECT id, client_id, title, created_at, updated_at, \
                    messages_json, branches_json, outputs_json, \
                    workspace_root, workspace_mount, session_id, \
                    git_commit, git_dirty, internal_root \
             FROM conversations WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, bool>(12)?,
                    row.get::<_, Option<String>>(13)?,
                ))
            },
        )
        .optional()?;

    let (
        row_id,
        owner,
        title,
        created_at,
        updated_at,
        messages_json,
        branches_json,
        outputs_json,
        workspace_root,
        workspace_mount,
        session_id,
        git_commit,
        git_dirty,
        internal_root,
    ) = match row {
        Some(row) => row,
        None => return Err(PersistenceError::NotFound { id: id.to_string() }),
    };

    if owner != client_id {
        return Err(PersistenceError::NotFound { id: id.to_string() });
    }

    Ok(Conversation {
        id: row_id,
        client_id: owner,
        title,
        created_at,
        updated_at,
        messages: serde_json::from_str(&messages_json)?,
        branches: serde_json::from_str(&branches_json)?,
        outputs: serde_json::from_str(&outputs_json)?,
        workspace: WorkspaceRef {
            workspace_root,
            workspace_mount,
            session_id,
            git_commit,
            git_dirty,
            internal_root,
        },
    })
}

fn init_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            client_id       TEXT NOT NULL,
            title           TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            messages_json   TEXT NOT NULL DEFAULT '[]',
            branches_json   TEXT NOT NULL DEFAULT '{}',
            outputs_json    TEXT NOT NULL DEFAULT '{}',
            workspace_root  TEXT,
            workspace_mount TEXT,
            session_id      TEXT,
            git_commit      TEXT,
            git_dirty       INTEGER NOT NULL DEFAULT 0,
            internal_root   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_client_updated
            ON conversations (client_id, updated_at DESC);
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, client_id: &str, title: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            client_id: client_id.to_string(),
            title: title.to_string(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            messages: serde_json::json!([]),
            branches: serde_json::json!({}),
            outputs: serde_json::json!({}),
            workspace: WorkspaceRef::default(),
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = ConversationStore::open_in_memory().await.unwrap();
        store.save("client-a", sample("conv-1", "client-a", "Hello")).await.unwrap();

        let loaded = store.get("client-a", "conv-1").await.unwrap();
        assert_eq!(loaded.title, "Hello");
        assert_eq!(loaded.client_id, "client-a");
    }

    #[tokio::test]
    async fn save_is_upsert_by_id() {
        let store = ConversationStore::open_in_memory().await.unwrap();
        store.save("client-a", sample("conv-1", "client-a", "First")).await.unwrap();
        store.save("client-a", sample("conv-1", "client-a", "Second")).await.unwrap();

        let rows = store.list("client-a").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Second");
    }

    #[tokio::test]
    async fn save_rejects_cross_client_rebind() {
        let store = ConversationStore::open_in_memory().await.unwrap();
        store.save("client-a", sample("conv-1", "client-a", "Mine")).await.unwrap();

        let err = store.save("client-b", sample("conv-1", "client-b", "Stolen")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::ClientMismatch { .. }));
    }

    #[tokio::test]
    async fn get_hides_other_clients_conversations() {
        let store = ConversationStore::open_in_memory().await.unwrap();
        store.save("client-a", sample("conv-1", "client-a", "Private")).await.unwrap();

        let err = store.get("client-b", "conv-1").await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let store = ConversationStore::open_in_memory().await.unwrap();
        store.save("client-a", sample("conv-1", "client-a", "Oldest")).await.unwrap();
        store.save("client-a", sample("conv-2", "client-a", "Newest")).await.unwrap();

        let rows = store.list("client-a").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "conv-2");
        assert_eq!(rows[1].id, "conv-1");
    }

    #[tokio::test]
    async fn delete_removes_row_and_reports_workspace() {
        let store = ConversationStore::open_in_memory().await.unwrap();
        let mut payload = sample("conv-1", "client-a", "Doomed");
        payload.workspace.internal_root = Some("/var/okcvm/workspaces/conv-1".to_string());
        payload.workspace.session_id = Some("sess-1".to_string());
        store.save("client-a", payload).await.unwrap();

        let report = store.delete("client-a", "conv-1").await.unwrap();
        assert_eq!(report.workspace_root.as_deref(), Some("/var/okcvm/workspaces/conv-1"));
        assert_eq!(report.session_id.as_deref(), Some("sess-1"));

        let err = store.get("client-a", "conv-1").await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_missing_row_is_not_found() {
        let store = ConversationStore::open_in_memory().await.unwrap();
        let err = store.delete("client-a", "does-not-exist").await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_from_wrong_client_is_not_found() {
        let store = ConversationStore::open_in_memory().await.unwrap();
        store.save("client-a", sample("conv-1", "client-a", "Private")).await.unwrap();

        let err = store.delete("client-b", "conv-1").await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound { .. }));
    }
}
