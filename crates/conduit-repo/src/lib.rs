// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The canonical relational `ConversationRepository` (C8): `sessions` and
//! `messages` tables, saved inside one transaction in topological
//! (root→leaf) order so foreign keys always resolve and a half-written
//! session never becomes visible to a concurrent reader.
mod pool;

pub use pool::Pool;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use conduit_core::{ConduitError, Conversation, RepositoryHandle, Session, SessionSummary, StoredMessage};
use conduit_model::Message;
use uuid::Uuid;

/// A pluggable conversation store backed by a shared [`Pool`], scoped to one
/// `project_name` (every query filters on it).
pub struct ConversationRepository {
    pool: Arc<Pool>,
    project_name: String,
}

impl ConversationRepository {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        project_name: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let pool = pool::get_or_create(database_url, max_connections).await?;
        let repo = Self { pool, project_name: project_name.into() };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        match &*self.pool {
            Pool::Postgres(p) => {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS sessions (
                        session_id text PRIMARY KEY,
                        project_name text NOT NULL,
                        leaf_message_id text,
                        title text,
                        metadata jsonb NOT NULL DEFAULT '{}',
                        created_at bigint NOT NULL,
                        last_updated timestamptz NOT NULL DEFAULT now()
                    )",
                )
                .execute(p)
                .await?;
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS messages (
                        message_id text PRIMARY KEY,
                        session_id text NOT NULL REFERENCES sessions(session_id),
                        predecessor_id text,
                        role text NOT NULL,
                        content jsonb NOT NULL,
                        created_at bigint NOT NULL
                    )",
                )
                .execute(p)
                .await?;
            }
            Pool::Sqlite(p) => {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS sessions (
                        session_id text PRIMARY KEY,
                        project_name text NOT NULL,
                        leaf_message_id text,
                        title text,
                        metadata text NOT NULL DEFAULT '{}',
                        created_at bigint NOT NULL,
                        last_updated timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP
                    )",
                )
                .execute(p)
                .await?;
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS messages (
                        message_id text PRIMARY KEY,
                        session_id text NOT NULL REFERENCES sessions(session_id),
                        predecessor_id text,
                        role text NOT NULL,
                        content text NOT NULL,
                        created_at bigint NOT NULL
                    )",
                )
                .execute(p)
                .await?;
            }
        }
        Ok(())
    }

    fn storage_error(context: &str, err: sqlx::Error) -> ConduitError {
        ConduitError::UpstreamUnavailable(format!("{context}: {err}"))
    }
}

fn role_column(message: &Message) -> &'static str {
    use conduit_model::{MessageContent, Role};
    match &message.content {
        MessageContent::ToolCall { .. } => "assistant",
        MessageContent::ToolResult { .. } => "tool",
        _ => match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        },
    }
}

/// Order every message in `session.message_dict` root-first (a message
/// always appears after its predecessor), following the teacher-grounded
/// `Session::ancestry` walk generalized from one leaf to the whole forest.
fn topological_order(session: &Session) -> Vec<&StoredMessage> {
    let mut children: HashMap<Option<Uuid>, Vec<&StoredMessage>> = HashMap::new();
    for m in session.message_dict.values() {
        children.entry(m.predecessor_id).or_default().push(m);
    }
    for list in children.values_mut() {
        list.sort_by_key(|m| m.timestamp);
    }

    let mut ordered = Vec::with_capacity(session.message_dict.len());
    let mut queue: std::collections::VecDeque<&StoredMessage> =
        children.remove(&None).unwrap_or_default().into();
    while let Some(m) = queue.pop_front() {
        ordered.push(m);
        if let Some(kids) = children.remove(&Some(m.id)) {
            for k in kids {
                queue.push_back(k);
            }
        }
    }
    ordered
}

#[async_trait]
impl RepositoryHandle for ConversationRepository {
    async fn save(&self, session: &Session, title: Option<&str>) -> Result<(), ConduitError> {
        let ordered = topological_order(session);
        let leaf_id = session.leaf.map(|u| u.to_string());
        let created_at = session.created_at.timestamp_millis();

        match &*self.pool {
            Pool::Postgres(p) => {
                let mut tx = p.begin().await.map_err(|e| Self::storage_error("save begin", e))?;
                sqlx::query(
                    "INSERT INTO sessions (session_id, project_name, leaf_message_id, title, created_at, last_updated)
                     VALUES ($1, $2, $3, $4, $5, now())
                     ON CONFLICT (session_id)
                     DO UPDATE SET leaf_message_id = excluded.leaf_message_id,
                                   title = COALESCE(excluded.title, sessions.title),
                                   last_updated = now()",
                )
                .bind(session.id.to_string())
                .bind(&self.project_name)
                .bind(&leaf_id)
                .bind(title)
                .bind(created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::storage_error("save session row", e))?;

                for m in &ordered {
                    let payload = serde_json::to_string(&m.message)
                        .map_err(|e| ConduitError::ValidationError(format!("message not serializable: {e}")))?;
                    sqlx::query(
                        "INSERT INTO messages (message_id, session_id, predecessor_id, role, content, created_at)
                         VALUES ($1, $2, $3, $4, $5::jsonb, $6)
                         ON CONFLICT (message_id) DO NOTHING",
                    )
                    .bind(m.id.to_string())
                    .bind(m.session_id.to_string())
                    .bind(m.predecessor_id.map(|u| u.to_string()))
                    .bind(role_column(&m.message))
                    .bind(&payload)
                    .bind(m.timestamp.timestamp_millis())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::storage_error("save message row", e))?;
                }
                tx.commit().await.map_err(|e| Self::storage_error("save commit", e))?;
            }
            Pool::Sqlite(p) => {
                let mut tx = p.begin().await.map_err(|e| Self::storage_error("save begin", e))?;
                sqlx::query(
                    "INSERT INTO sessions (session_id, project_name, leaf_message_id, title, created_at, last_updated)
                     VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                     ON CONFLICT(session_id)
                     DO UPDATE SET leaf_message_id = excluded.leaf_message_id,
                                   title = COALESCE(excluded.title, title),
                                   last_updated = CURRENT_TIMESTAMP",
                )
                .bind(session.id.to_string())
                .bind(&self.project_name)
                .bind(&leaf_id)
                .bind(title)
                .bind(created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::storage_error("save session row", e))?;

                for m in &ordered {
                    let payload = serde_json::to_string(&m.message)
                        .map_err(|e| ConduitError::ValidationError(format!("message not serializable: {e}")))?;
                    sqlx::query(
                        "INSERT INTO messages (message_id, session_id, predecessor_id, role, content, created_at)
                         VALUES (?, ?, ?, ?, ?, ?)
                         ON CONFLICT(message_id) DO NOTHING",
                    )
                    .bind(m.id.to_string())
                    .bind(m.session_id.to_string())
                    .bind(m.predecessor_id.map(|u| u.to_string()))
                    .bind(role_column(&m.message))
                    .bind(&payload)
                    .bind(m.timestamp.timestamp_millis())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::storage_error("save message row", e))?;
                }
                tx.commit().await.map_err(|e| Self::storage_error("save commit", e))?;
            }
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>, ConduitError> {
        let session_row: Option<(String, Option<String>, i64)> = match &*self.pool {
            Pool::Postgres(p) => {
                sqlx::query_as(
                    "SELECT session_id, leaf_message_id, created_at FROM sessions WHERE session_id = $1 AND project_name = $2",
                )
                .bind(session_id)
                .bind(&self.project_name)
                .fetch_optional(p)
                .await
                .map_err(|e| Self::storage_error("load session row", e))?
            }
            Pool::Sqlite(p) => {
                sqlx::query_as(
                    "SELECT session_id, leaf_message_id, created_at FROM sessions WHERE session_id = ? AND project_name = ?",
                )
                .bind(session_id)
                .bind(&self.project_name)
                .fetch_optional(p)
                .await
                .map_err(|e| Self::storage_error("load session row", e))?
            }
        };
        let Some((id_str, leaf_str, created_at_ms)) = session_row else { return Ok(None) };

        let rows: Vec<(String, Option<String>, String, i64)> = match &*self.pool {
            Pool::Postgres(p) => sqlx::query_as(
                "SELECT message_id, predecessor_id, content::text, created_at FROM messages WHERE session_id = $1",
            )
            .bind(session_id)
            .fetch_all(p)
            .await
            .map_err(|e| Self::storage_error("load messages", e))?,
            Pool::Sqlite(p) => sqlx::query_as(
                "SELECT message_id, predecessor_id, content, created_at FROM messages WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_all(p)
            .await
            .map_err(|e| Self::storage_error("load messages", e))?,
        };

        let session_uuid = parse_uuid(&id_str)?;
        let mut message_dict = HashMap::with_capacity(rows.len());
        for (msg_id, pred_id, content, created_at) in rows {
            let message: Message = serde_json::from_str(&content)
                .map_err(|e| ConduitError::BadRequest(format!("corrupt stored message: {e}")))?;
            let id = parse_uuid(&msg_id)?;
            message_dict.insert(
                id,
                StoredMessage {
                    id,
                    predecessor_id: pred_id.as_deref().map(parse_uuid).transpose()?,
                    session_id: session_uuid,
                    timestamp: millis_to_datetime(created_at),
                    message,
                },
            );
        }

        Ok(Some(Session {
            id: session_uuid,
            leaf: leaf_str.as_deref().map(parse_uuid).transpose()?,
            message_dict,
            created_at: millis_to_datetime(created_at_ms),
        }))
    }

    async fn rehydrate_from_leaf(&self, message_id: &str) -> Result<Option<Conversation>, ConduitError> {
        let mut chain: Vec<StoredMessage> = Vec::new();
        let mut cursor = Some(message_id.to_string());
        let mut session_id: Option<Uuid> = None;

        while let Some(id) = cursor.take() {
            let row: Option<(String, Option<String>, String, String, i64)> = match &*self.pool {
                Pool::Postgres(p) => sqlx::query_as(
                    "SELECT message_id, predecessor_id, session_id, content::text, created_at FROM messages WHERE message_id = $1",
                )
                .bind(&id)
                .fetch_optional(p)
                .await
                .map_err(|e| Self::storage_error("rehydrate", e))?,
                Pool::Sqlite(p) => sqlx::query_as(
                    "SELECT message_id, predecessor_id, session_id, content, created_at FROM messages WHERE message_id = ?",
                )
                .bind(&id)
                .fetch_optional(p)
                .await
                .map_err(|e| Self::storage_error("rehydrate", e))?,
            };
            let Some((msg_id, pred_id, sess_id, content, created_at)) = row else { break };
            let message: Message = serde_json::from_str(&content)
                .map_err(|e| ConduitError::BadRequest(format!("corrupt stored message: {e}")))?;
            let this_id = parse_uuid(&msg_id)?;
            let sess_uuid = parse_uuid(&sess_id)?;
            session_id = Some(sess_uuid);
            chain.push(StoredMessage {
                id: this_id,
                predecessor_id: pred_id.as_deref().map(parse_uuid).transpose()?,
                session_id: sess_uuid,
                timestamp: millis_to_datetime(created_at),
                message,
            });
            cursor = pred_id;
        }

        let Some(session_id) = session_id else { return Ok(None) };
        chain.reverse();
        Ok(Some(Conversation { session_id, messages: chain }))
    }

    async fn list(&self, limit: usize) -> Result<Vec<SessionSummary>, ConduitError> {
        let rows: Vec<(String, String, Option<String>, i64)> = match &*self.pool {
            Pool::Postgres(p) => sqlx::query_as(
                "SELECT session_id, project_name, title, EXTRACT(EPOCH FROM last_updated)::bigint * 1000
                 FROM sessions WHERE project_name = $1 ORDER BY last_updated DESC LIMIT $2",
            )
            .bind(&self.project_name)
            .bind(limit as i64)
            .fetch_all(p)
            .await
            .map_err(|e| Self::storage_error("list sessions", e))?,
            Pool::Sqlite(p) => sqlx::query_as(
                "SELECT session_id, project_name, title, CAST(strftime('%s', last_updated) AS integer) * 1000
                 FROM sessions WHERE project_name = ? ORDER BY last_updated DESC LIMIT ?",
            )
            .bind(&self.project_name)
            .bind(limit as i64)
            .fetch_all(p)
            .await
            .map_err(|e| Self::storage_error("list sessions", e))?,
        };
        Ok(rows
            .into_iter()
            .map(|(session_id, project_name, title, last_updated_ms)| SessionSummary {
                session_id,
                project_name,
                title,
                last_updated_ms,
            })
            .collect())
    }

    async fn delete(&self, session_id: &str) -> Result<(), ConduitError> {
        match &*self.pool {
            Pool::Postgres(p) => {
                let mut tx = p.begin().await.map_err(|e| Self::storage_error("delete begin", e))?;
                sqlx::query("DELETE FROM messages WHERE session_id = $1")
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::storage_error("delete messages", e))?;
                sqlx::query("DELETE FROM sessions WHERE session_id = $1 AND project_name = $2")
                    .bind(session_id)
                    .bind(&self.project_name)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::storage_error("delete session", e))?;
                tx.commit().await.map_err(|e| Self::storage_error("delete commit", e))?;
            }
            Pool::Sqlite(p) => {
                let mut tx = p.begin().await.map_err(|e| Self::storage_error("delete begin", e))?;
                sqlx::query("DELETE FROM messages WHERE session_id = ?")
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::storage_error("delete messages", e))?;
                sqlx::query("DELETE FROM sessions WHERE session_id = ? AND project_name = ?")
                    .bind(session_id)
                    .bind(&self.project_name)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::storage_error("delete session", e))?;
                tx.commit().await.map_err(|e| Self::storage_error("delete commit", e))?;
            }
        }
        Ok(())
    }

    async fn wipe(&self) -> Result<(), ConduitError> {
        match &*self.pool {
            Pool::Postgres(p) => {
                sqlx::query(
                    "DELETE FROM messages WHERE session_id IN (SELECT session_id FROM sessions WHERE project_name = $1)",
                )
                .bind(&self.project_name)
                .execute(p)
                .await
                .map_err(|e| Self::storage_error("wipe messages", e))?;
                sqlx::query("DELETE FROM sessions WHERE project_name = $1")
                    .bind(&self.project_name)
                    .execute(p)
                    .await
                    .map_err(|e| Self::storage_error("wipe sessions", e))?;
            }
            Pool::Sqlite(p) => {
                sqlx::query(
                    "DELETE FROM messages WHERE session_id IN (SELECT session_id FROM sessions WHERE project_name = ?)",
                )
                .bind(&self.project_name)
                .execute(p)
                .await
                .map_err(|e| Self::storage_error("wipe messages", e))?;
                sqlx::query("DELETE FROM sessions WHERE project_name = ?")
                    .bind(&self.project_name)
                    .execute(p)
                    .await
                    .map_err(|e| Self::storage_error("wipe sessions", e))?;
            }
        }
        Ok(())
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, ConduitError> {
    Uuid::parse_str(s).map_err(|e| ConduitError::BadRequest(format!("corrupt stored id {s:?}: {e}")))
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_model::Message;

    async fn test_repo(name: &str) -> ConversationRepository {
        let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
        ConversationRepository::connect(&url, 1, "test-project").await.unwrap()
    }

    fn seeded_session() -> (Session, Conversation) {
        let mut session = Session::new();
        let mut conv = Conversation { session_id: session.id, messages: Vec::new() };
        conv.add(&mut session, Message::user("hello")).unwrap();
        conv.add(&mut session, Message::assistant("hi there")).unwrap();
        (session, conv)
    }

    #[tokio::test]
    async fn save_then_load_round_trips_messages() {
        let repo = test_repo("save_load").await;
        let (session, _conv) = seeded_session();
        repo.save(&session, Some("greeting")).await.unwrap();

        let loaded = repo.load(&session.id.to_string()).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.leaf, session.leaf);
        assert_eq!(loaded.message_dict.len(), 2);
    }

    #[tokio::test]
    async fn load_unknown_session_returns_none() {
        let repo = test_repo("load_unknown").await;
        assert!(repo.load(&Uuid::new_v4().to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rehydrate_from_leaf_matches_s6() {
        let repo = test_repo("rehydrate").await;
        let (session, _conv) = seeded_session();
        let leaf = session.leaf.unwrap();
        repo.save(&session, None).await.unwrap();

        let rehydrated = repo.rehydrate_from_leaf(&leaf.to_string()).await.unwrap().unwrap();
        assert_eq!(rehydrated.messages.len(), 2);
        assert_eq!(rehydrated.messages.last().unwrap().id, leaf);
        assert_eq!(rehydrated.messages[0].message.as_text(), Some("hello"));
        assert_eq!(rehydrated.messages[1].message.as_text(), Some("hi there"));
    }

    #[tokio::test]
    async fn list_orders_by_last_updated_desc() {
        let repo = test_repo("list_order").await;
        let (s1, _) = seeded_session();
        repo.save(&s1, Some("first")).await.unwrap();
        let (s2, _) = seeded_session();
        repo.save(&s2, Some("second")).await.unwrap();

        let summaries = repo.list(10).await.unwrap();
        assert_eq!(summaries.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_session_and_messages() {
        let repo = test_repo("delete").await;
        let (session, _conv) = seeded_session();
        repo.save(&session, None).await.unwrap();
        repo.delete(&session.id.to_string()).await.unwrap();
        assert!(repo.load(&session.id.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wipe_is_scoped_to_project_name() {
        let url = "sqlite:file:wipe_scope?mode=memory&cache=shared";
        let repo_a = ConversationRepository::connect(url, 1, "project-a").await.unwrap();
        let repo_b = ConversationRepository::connect(url, 1, "project-b").await.unwrap();
        let (sa, _) = seeded_session();
        repo_a.save(&sa, None).await.unwrap();
        let (sb, _) = seeded_session();
        repo_b.save(&sb, None).await.unwrap();

        repo_a.wipe().await.unwrap();
        assert!(repo_a.load(&sa.id.to_string()).await.unwrap().is_none());
        assert!(repo_b.load(&sb.id.to_string()).await.unwrap().is_some());
    }
}
