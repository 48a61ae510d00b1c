// Authentication routes: the HTTP face of the credential exchanger and the
// session token manager.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::auth::{AuthArtifact, AuthError, Identity, IssuedSession};

use super::errors::ApiError;
use super::extract::{bearer_token, current_identity};
use super::state::AppState;

// ============================================================================
// REQUEST / RESPONSE BODIES
// ============================================================================

/// Login request. Exactly one artifact is used; when the client sends more
/// than one, the temp token takes precedence over the authorization code,
/// and a signed credential takes precedence over both.
#[derive(Debug, Deserialize)]
pub struct GoogleAuthRequest {
    pub credential: Option<String>,
    pub temp_token: Option<String>,
    pub authorization_code: Option<String>,
    pub state: Option<String>,
}

impl GoogleAuthRequest {
    fn into_artifact(self) -> Result<AuthArtifact, ApiError> {
        if let Some(credential) = self.credential {
            return Ok(AuthArtifact::Credential(credential));
        }
        if let Some(token) = self.temp_token {
            return Ok(AuthArtifact::TempToken(token));
        }
        if let Some(code) = self.authorization_code {
            let state = self.state.ok_or_else(|| {
                ApiError::bad_request("authorization_code requires the accompanying state")
            })?;
            return Ok(AuthArtifact::AuthCode { code, state });
        }
        Err(ApiError::bad_request(
            "one of credential, temp_token or authorization_code is required",
        ))
    }
}

/// Identity as exposed to the client. The stored Google refresh token is
/// deliberately absent.
#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<&Identity> for UserProfile {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.subject.clone(),
            email: identity.email.clone(),
            name: identity.name.clone(),
            picture: identity.picture.clone(),
            created_at: identity.created_at,
            last_login: identity.last_login,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
}

impl AuthResponse {
    fn new(issued: IssuedSession, user: UserProfile) -> Self {
        Self {
            access_token: issued.access_token,
            refresh_token: issued.refresh_token,
            token_type: "bearer",
            expires_at: issued.access_expires_at,
            user,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// `POST /api/auth/google` - exchange a Google artifact for a session.
pub async fn google_auth(
    State(state): State<AppState>,
    Json(request): Json<GoogleAuthRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let artifact = request.into_artifact()?;
    let identity = state.exchanger.exchange(artifact).await?;
    let issued = state.sessions.issue(&identity).await?;

    tracing::info!(subject = %identity.subject, "login succeeded");
    Ok(Json(AuthResponse::new(issued, UserProfile::from(&identity))))
}

/// `POST /api/auth/refresh` - rotate a refresh token.
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<Value>, ApiError> {
    let issued = state.sessions.refresh(&request.refresh_token).await?;
    Ok(Json(json!({
        "access_token": issued.access_token,
        "refresh_token": issued.refresh_token,
        "token_type": "bearer",
        "expires_at": issued.access_expires_at,
    })))
}

/// `GET /api/auth/google-config` - the public OAuth client id.
pub async fn google_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "client_id": state.google_client_id }))
}

/// `GET /api/auth/check` - optional-auth probe used by the web client on
/// startup. Always 200; the body says whether the session is live.
pub async fn check(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    match current_identity(&state, &headers).await {
        Ok(identity) => Json(json!({
            "authenticated": true,
            "user": UserProfile::from(&identity),
        })),
        Err(_) => Json(json!({ "authenticated": false })),
    }
}

/// `GET /api/auth/me` - the authenticated user's profile.
pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserProfile>, ApiError> {
    let identity = current_identity(&state, &headers).await?;
    Ok(Json(UserProfile::from(&identity)))
}

/// `POST /api/auth/logout` - revoke the presented session. Succeeds even
/// when the token is already dead; logout is idempotent from the client's
/// point of view.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    if let Ok(token) = bearer_token(&headers) {
        match state.sessions.revoke_by_access(token).await {
            Ok(()) => {}
            Err(
                AuthError::SessionInvalid | AuthError::SessionExpired | AuthError::SessionRevoked,
            ) => {}
            Err(e) => tracing::warn!(error = %e, "logout revocation failed"),
        }
    }
    Json(json!({ "message": "Successfully logged out" }))
}
