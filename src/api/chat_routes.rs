// Chat session management routes: create, list, read, rename, soft delete.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::chat::{ChatSessionDetail, ChatSessionSummary};

use super::errors::ApiError;
use super::extract::current_identity;
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub id: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTitleRequest {
    pub title: String,
}

/// `POST /api/chat/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<ChatSessionDetail>, ApiError> {
    let identity = current_identity(&state, &headers).await?;
    let session = state
        .history
        .create_session(&identity.subject, request.id, request.title)
        .await?;
    Ok(Json(session))
}

/// `GET /api/chat/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatSessionSummary>>, ApiError> {
    let identity = current_identity(&state, &headers).await?;
    let sessions = state.history.list_sessions(&identity.subject).await?;
    Ok(Json(sessions))
}

/// `GET /api/chat/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ChatSessionDetail>, ApiError> {
    let identity = current_identity(&state, &headers).await?;
    let session = state.history.session_detail(&identity.subject, &id).await?;
    Ok(Json(session))
}

/// `PUT /api/chat/sessions/{id}/title`
pub async fn rename_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdateTitleRequest>,
) -> Result<Json<Value>, ApiError> {
    let identity = current_identity(&state, &headers).await?;
    state
        .history
        .rename_session(&identity.subject, &id, &request.title)
        .await?;
    Ok(Json(json!({ "message": "Title updated" })))
}

/// `DELETE /api/chat/sessions/{id}`
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let identity = current_identity(&state, &headers).await?;
    state
        .history
        .delete_session(&identity.subject, &id)
        .await?;
    Ok(Json(json!({ "message": "Chat session deleted" })))
}
