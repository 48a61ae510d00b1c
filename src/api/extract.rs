// Bearer-token plumbing shared by the protected routes.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

use crate::core::auth::Identity;

use super::errors::ApiError;
use super::state::AppState;

/// Pulls the bearer token out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;

    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Authorization header is not a bearer token"))
}

/// Resolves the request's session to an identity, or 401.
pub async fn current_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, ApiError> {
    let token = bearer_token(headers)?;
    Ok(state.sessions.validate(token).await?)
}
