// Error translation at the HTTP boundary.
//
// Auth and session failures become structured 4xx responses with a `detail`
// body; infrastructure faults become 500s with a generic body (the real
// cause goes to the log, never to the client). Tool failures never reach
// this module - the router folds them into the conversation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::core::auth::AuthError;
use crate::core::chat::{ChatError, TurnError};

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::InvalidCredential | AuthError::CredentialExpired => StatusCode::UNAUTHORIZED,
            AuthError::ExpiredGrant | AuthError::StateMismatch => StatusCode::BAD_REQUEST,
            AuthError::SessionExpired
            | AuthError::SessionRevoked
            | AuthError::SessionInvalid
            | AuthError::RefreshInvalid
            | AuthError::RefreshExpired => StatusCode::UNAUTHORIZED,
            AuthError::Storage(_) | AuthError::Provider(_) | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "auth infrastructure fault");
            Self::new(status, "Internal server error")
        } else {
            Self::new(status, err.to_string())
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::NotFound => Self::new(StatusCode::NOT_FOUND, "Chat session not found"),
            ChatError::Storage(detail) => {
                tracing::error!(%detail, "chat storage fault");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl From<TurnError> for ApiError {
    fn from(err: TurnError) -> Self {
        match err {
            TurnError::Auth(auth) => auth.into(),
            TurnError::History(chat) => chat.into(),
            TurnError::Engine(engine) => {
                tracing::error!(error = %engine, "conversation engine fault");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to process chat message",
                )
            }
            TurnError::Cancelled => Self::new(
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "Turn was cancelled",
            ),
        }
    }
}
