// In-memory chat history store, backed by DashMap. Same trait as the SQLite
// store, so tests and ephemeral deployments can skip the database file.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::core::chat::{
    ChatError, ChatHistoryStore, ChatSessionDetail, ChatSessionSummary, StoredMessage,
};

/// Clones share the underlying map, like the SQLite store shares its pool.
#[derive(Default, Clone)]
pub struct InMemoryChatStore {
    /// (subject, session id) -> session. Scoping the key by subject keeps one
    /// user's chats invisible to another's queries by construction.
    sessions: Arc<DashMap<(String, String), ChatSessionDetail>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatHistoryStore for InMemoryChatStore {
    async fn create(
        &self,
        subject: &str,
        id: Option<String>,
        title: &str,
    ) -> Result<ChatSessionDetail, ChatError> {
        let now = Utc::now();
        let detail = ChatSessionDetail {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: title.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            is_active: true,
        };
        self.sessions
            .insert((subject.to_string(), detail.id.clone()), detail.clone());
        Ok(detail)
    }

    async fn list(&self, subject: &str, limit: usize) -> Result<Vec<ChatSessionSummary>, ChatError> {
        let mut summaries: Vec<ChatSessionSummary> = self
            .sessions
            .iter()
            .filter(|e| e.key().0 == subject && e.value().is_active)
            .map(|e| ChatSessionSummary {
                id: e.value().id.clone(),
                title: e.value().title.clone(),
                created_at: e.value().created_at,
                updated_at: e.value().updated_at,
                message_count: e.value().messages.len(),
                is_active: true,
            })
            .collect();

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn get(&self, subject: &str, id: &str) -> Result<Option<ChatSessionDetail>, ChatError> {
        Ok(self
            .sessions
            .get(&(subject.to_string(), id.to_string()))
            .filter(|e| e.is_active)
            .map(|e| e.clone()))
    }

    async fn append(
        &self,
        subject: &str,
        id: &str,
        message: StoredMessage,
    ) -> Result<bool, ChatError> {
        match self.sessions.get_mut(&(subject.to_string(), id.to_string())) {
            Some(mut entry) if entry.is_active => {
                entry.messages.push(message);
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rename(&self, subject: &str, id: &str, title: &str) -> Result<bool, ChatError> {
        match self.sessions.get_mut(&(subject.to_string(), id.to_string())) {
            Some(mut entry) if entry.is_active => {
                entry.title = title.to_string();
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete(&self, subject: &str, id: &str) -> Result<bool, ChatError> {
        match self.sessions.get_mut(&(subject.to_string(), id.to_string())) {
            Some(mut entry) => {
                entry.is_active = false;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
