// Chat history: persisted sessions and their messages.
// The store trait is implemented in infra (DashMap and SQLite); the service
// adds the behavior the HTTP layer and orchestrator share.

use async_trait::async_trait;

use super::models::{ChatError, ChatRole, ChatSessionDetail, ChatSessionSummary, StoredMessage};

/// Storage port for chat sessions, always scoped by the owning subject -
/// one user can never see or touch another user's chats.
#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    /// Creates a session. `id` lets the client supply its own chat id
    /// (the web client generates them); `None` means the store picks one.
    async fn create(
        &self,
        subject: &str,
        id: Option<String>,
        title: &str,
    ) -> Result<ChatSessionDetail, ChatError>;

    /// Active sessions for a subject, most recently updated first.
    async fn list(&self, subject: &str, limit: usize) -> Result<Vec<ChatSessionSummary>, ChatError>;

    async fn get(&self, subject: &str, id: &str) -> Result<Option<ChatSessionDetail>, ChatError>;

    /// Appends to an existing active session and bumps `updated_at`.
    /// Returns `false` if the session does not exist.
    async fn append(
        &self,
        subject: &str,
        id: &str,
        message: StoredMessage,
    ) -> Result<bool, ChatError>;

    /// Returns `false` if the session does not exist.
    async fn rename(&self, subject: &str, id: &str, title: &str) -> Result<bool, ChatError>;

    /// Soft delete: the session stops listing but its rows survive.
    /// Returns `false` if the session does not exist.
    async fn soft_delete(&self, subject: &str, id: &str) -> Result<bool, ChatError>;
}

const DEFAULT_TITLE: &str = "New Chat";
const LIST_LIMIT: usize = 50;

pub struct ChatHistoryService<S> {
    store: S,
}

impl<S: ChatHistoryStore> ChatHistoryService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn create_session(
        &self,
        subject: &str,
        id: Option<String>,
        title: Option<String>,
    ) -> Result<ChatSessionDetail, ChatError> {
        self.store
            .create(subject, id, title.as_deref().unwrap_or(DEFAULT_TITLE))
            .await
    }

    pub async fn list_sessions(&self, subject: &str) -> Result<Vec<ChatSessionSummary>, ChatError> {
        self.store.list(subject, LIST_LIMIT).await
    }

    pub async fn session_detail(
        &self,
        subject: &str,
        id: &str,
    ) -> Result<ChatSessionDetail, ChatError> {
        self.store.get(subject, id).await?.ok_or(ChatError::NotFound)
    }

    /// Appends a message, creating the session on the fly when the client
    /// sends a chat id we have never seen.
    pub async fn record_message(
        &self,
        subject: &str,
        chat_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<StoredMessage, ChatError> {
        let message = StoredMessage::new(role, content);

        if !self.store.append(subject, chat_id, message.clone()).await? {
            tracing::info!(%chat_id, "auto-creating chat session for unknown id");
            self.store
                .create(subject, Some(chat_id.to_string()), DEFAULT_TITLE)
                .await?;
            if !self.store.append(subject, chat_id, message.clone()).await? {
                return Err(ChatError::Storage(
                    "session vanished between create and append".to_string(),
                ));
            }
        }
        Ok(message)
    }

    pub async fn rename_session(
        &self,
        subject: &str,
        id: &str,
        title: &str,
    ) -> Result<(), ChatError> {
        if self.store.rename(subject, id, title).await? {
            Ok(())
        } else {
            Err(ChatError::NotFound)
        }
    }

    pub async fn delete_session(&self, subject: &str, id: &str) -> Result<(), ChatError> {
        if self.store.soft_delete(subject, id).await? {
            Ok(())
        } else {
            Err(ChatError::NotFound)
        }
    }
}
