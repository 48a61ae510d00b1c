// SQLite-backed chat history store. Messages keep their insertion order via
// rowid; sessions are soft-deleted so transcripts survive deletion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use crate::core::chat::{
    ChatError, ChatHistoryStore, ChatRole, ChatSessionDetail, ChatSessionSummary, StoredMessage,
};

#[derive(Clone)]
pub struct SqliteChatStore {
    pool: Pool<Sqlite>,
}

impl SqliteChatStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), ChatError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT NOT NULL,
                subject TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (subject, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_session \
             ON chat_messages (subject, session_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn messages_for(
        &self,
        subject: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>, ChatError> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE subject = ? AND session_id = ? ORDER BY rowid",
        )
        .bind(subject)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                Ok(StoredMessage {
                    id: parse_uuid(row.get::<String, _>("id"))?,
                    role: parse_role(&row.get::<String, _>("role"))?,
                    content: row.get("content"),
                    timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
                })
            })
            .collect()
    }
}

fn storage_err(e: sqlx::Error) -> ChatError {
    ChatError::Storage(e.to_string())
}

fn parse_uuid(raw: String) -> Result<Uuid, ChatError> {
    Uuid::parse_str(&raw).map_err(|e| ChatError::Storage(format!("bad uuid in store: {e}")))
}

fn parse_role(raw: &str) -> Result<ChatRole, ChatError> {
    match raw {
        "user" => Ok(ChatRole::User),
        "assistant" => Ok(ChatRole::Assistant),
        "tool" => Ok(ChatRole::Tool),
        other => Err(ChatError::Storage(format!("bad role in store: {other}"))),
    }
}

#[async_trait]
impl ChatHistoryStore for SqliteChatStore {
    async fn create(
        &self,
        subject: &str,
        id: Option<String>,
        title: &str,
    ) -> Result<ChatSessionDetail, ChatError> {
        let now = Utc::now();
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        // Re-creating an id resurrects the session rather than erroring;
        // clients retry with the ids they generated.
        sqlx::query(
            r#"
            INSERT INTO chat_sessions (id, subject, title, created_at, updated_at, is_active)
            VALUES (?, ?, ?, ?, ?, 1)
            ON CONFLICT(subject, id) DO UPDATE SET
                is_active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(subject)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        let messages = self.messages_for(subject, &id).await?;
        Ok(ChatSessionDetail {
            id,
            title: title.to_string(),
            messages,
            created_at: now,
            updated_at: now,
            is_active: true,
        })
    }

    async fn list(&self, subject: &str, limit: usize) -> Result<Vec<ChatSessionSummary>, ChatError> {
        let rows = sqlx::query(
            r#"
            SELECT s.*,
                   (SELECT COUNT(*) FROM chat_messages m
                    WHERE m.subject = s.subject AND m.session_id = s.id) AS message_count
            FROM chat_sessions s
            WHERE s.subject = ? AND s.is_active = 1
            ORDER BY s.updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(subject)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .iter()
            .map(|row| ChatSessionSummary {
                id: row.get("id"),
                title: row.get("title"),
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
                updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
                message_count: row.get::<i64, _>("message_count") as usize,
                is_active: true,
            })
            .collect())
    }

    async fn get(&self, subject: &str, id: &str) -> Result<Option<ChatSessionDetail>, ChatError> {
        let row = sqlx::query(
            "SELECT * FROM chat_sessions WHERE subject = ? AND id = ? AND is_active = 1",
        )
        .bind(subject)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let messages = self.messages_for(subject, id).await?;
        Ok(Some(ChatSessionDetail {
            id: row.get("id"),
            title: row.get("title"),
            messages,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
            is_active: true,
        }))
    }

    async fn append(
        &self,
        subject: &str,
        id: &str,
        message: StoredMessage,
    ) -> Result<bool, ChatError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // Bumping updated_at doubles as the existence check.
        let touched = sqlx::query(
            "UPDATE chat_sessions SET updated_at = ? WHERE subject = ? AND id = ? AND is_active = 1",
        )
        .bind(Utc::now())
        .bind(subject)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?
        .rows_affected();

        if touched == 0 {
            tx.rollback().await.map_err(storage_err)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, subject, session_id, role, content, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(subject)
        .bind(id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(true)
    }

    async fn rename(&self, subject: &str, id: &str, title: &str) -> Result<bool, ChatError> {
        let updated = sqlx::query(
            "UPDATE chat_sessions SET title = ?, updated_at = ? WHERE subject = ? AND id = ? AND is_active = 1",
        )
        .bind(title)
        .bind(Utc::now())
        .bind(subject)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn soft_delete(&self, subject: &str, id: &str) -> Result<bool, ChatError> {
        let updated = sqlx::query(
            "UPDATE chat_sessions SET is_active = 0, updated_at = ? WHERE subject = ? AND id = ?",
        )
        .bind(Utc::now())
        .bind(subject)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?
        .rows_affected();
        Ok(updated > 0)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteChatStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteChatStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_append_get_round_trip() {
        let store = store().await;
        store
            .create("u1", Some("c1".into()), "Planning")
            .await
            .unwrap();

        store
            .append("u1", "c1", StoredMessage::new(ChatRole::User, "hello"))
            .await
            .unwrap();
        store
            .append(
                "u1",
                "c1",
                StoredMessage::new(ChatRole::Assistant, "hi there"),
            )
            .await
            .unwrap();

        let detail = store.get("u1", "c1").await.unwrap().unwrap();
        assert_eq!(detail.title, "Planning");
        assert_eq!(detail.messages.len(), 2);
        assert_eq!(detail.messages[0].role, ChatRole::User);
        assert_eq!(detail.messages[1].content, "hi there");
    }

    #[tokio::test]
    async fn append_to_unknown_session_reports_false() {
        let store = store().await;
        assert!(!store
            .append("u1", "nope", StoredMessage::new(ChatRole::User, "x"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn soft_delete_hides_from_list_and_get() {
        let store = store().await;
        store.create("u1", Some("c1".into()), "t").await.unwrap();
        store.create("u1", Some("c2".into()), "t").await.unwrap();

        assert!(store.soft_delete("u1", "c1").await.unwrap());
        assert!(store.get("u1", "c1").await.unwrap().is_none());

        let listed = store.list("u1", 50).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "c2");
    }

    #[tokio::test]
    async fn rename_bumps_and_requires_existing_session() {
        let store = store().await;
        store.create("u1", Some("c1".into()), "old").await.unwrap();

        assert!(store.rename("u1", "c1", "new title").await.unwrap());
        assert!(!store.rename("u1", "missing", "x").await.unwrap());

        let detail = store.get("u1", "c1").await.unwrap().unwrap();
        assert_eq!(detail.title, "new title");
    }
}
