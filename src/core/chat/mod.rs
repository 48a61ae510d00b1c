pub mod engine;
pub mod history;
pub mod models;
pub mod orchestrator;

pub use engine::{ConversationEngine, EngineError, EngineReply, ToolCallIntent};
pub use history::{ChatHistoryService, ChatHistoryStore};
pub use models::{
    ChatError, ChatRole, ChatSessionDetail, ChatSessionSummary, StoredMessage, TranscriptEntry,
};
pub use orchestrator::{
    ChatOrchestrator, OrchestratorConfig, TurnCancel, TurnCancelHandle, TurnError, TurnOutcome,
};
