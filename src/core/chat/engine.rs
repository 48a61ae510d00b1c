// The conversation engine seam.
//
// The hosted language model is a black box that, given a transcript, emits
// either a direct natural-language reply or a set of tool-call intents.
// Anything satisfying this trait can back the orchestrator - the Groq client
// in infra, or a scripted fake in tests.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::tools::ToolDescriptor;

use super::models::TranscriptEntry;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Conversation engine error: {0}")]
    Provider(String),
}

/// A tool call the model wants executed. Becomes a `ToolCallRequest` (with a
/// correlation id) once the orchestrator accepts it.
#[derive(Debug, Clone)]
pub struct ToolCallIntent {
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// What one engine round produced.
#[derive(Debug, Clone)]
pub enum EngineReply {
    /// A final natural-language answer; the turn is done.
    Direct(String),
    /// The model wants tool results before it answers.
    ToolCalls(Vec<ToolCallIntent>),
}

#[async_trait]
pub trait ConversationEngine: Send + Sync {
    /// Runs one model round over the transcript.
    ///
    /// `tools` is the currently registered tool surface; an empty slice means
    /// the model must answer directly.
    async fn respond(
        &self,
        system_prompt: &str,
        transcript: &[TranscriptEntry],
        tools: &[ToolDescriptor],
    ) -> Result<EngineReply, EngineError>;
}
