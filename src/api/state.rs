// Application state shared across HTTP handlers: the concrete instantiation
// of the core's generic services. Tests exercise the services with mock
// stores; this is the one place the production types are spelled out.

use std::sync::Arc;

use crate::core::auth::{CredentialExchanger, SessionTokenManager};
use crate::core::chat::{ChatHistoryService, ChatOrchestrator};
use crate::core::tools::ToolRouter;
use crate::infra::ai::GroqChatClient;
use crate::infra::auth::{GoogleIdTokenVerifier, SqliteAuthStore};
use crate::infra::chat::SqliteChatStore;
use crate::infra::tools::{GoogleCredentialBroker, WorkspaceToolClient};

pub type Exchanger = CredentialExchanger<GoogleIdTokenVerifier, SqliteAuthStore, SqliteAuthStore>;
pub type Sessions = SessionTokenManager<SqliteAuthStore, SqliteAuthStore>;
pub type Tools = ToolRouter<WorkspaceToolClient, GoogleCredentialBroker>;
pub type History = ChatHistoryService<SqliteChatStore>;
pub type Orchestrator = ChatOrchestrator<Sessions, GroqChatClient, Tools, SqliteChatStore>;

#[derive(Clone)]
pub struct AppState {
    pub exchanger: Arc<Exchanger>,
    pub sessions: Arc<Sessions>,
    pub orchestrator: Arc<Orchestrator>,
    pub history: Arc<History>,
    /// Public identifier handed to the web client; never a secret.
    pub google_client_id: String,
}
