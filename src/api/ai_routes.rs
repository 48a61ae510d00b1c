// The AI chat route - the composition boundary for a full orchestrator turn.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::chat::TurnCancel;

use super::errors::ApiError;
use super::extract::bearer_token;
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub chat_id: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub chat_id: String,
    pub message_id: String,
}

/// `POST /api/ai/chat` - run one conversational turn to completion.
///
/// Tool failures inside the turn do not surface here; they are folded into
/// the transcript and the reply, so a timed-out calendar lookup still
/// answers 200 with an apologetic response.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let token = bearer_token(&headers)?;

    let outcome = state
        .orchestrator
        .run_turn(
            token,
            &request.chat_id,
            &request.message,
            request.context,
            TurnCancel::never(),
        )
        .await?;

    Ok(Json(ChatResponse {
        response: outcome.reply,
        chat_id: request.chat_id,
        message_id: outcome.message_id.to_string(),
    }))
}
