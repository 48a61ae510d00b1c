// API layer - the axum HTTP adapter over the core services.

#[path = "ai_routes.rs"]
pub mod ai_routes;
#[path = "auth_routes.rs"]
pub mod auth_routes;
#[path = "chat_routes.rs"]
pub mod chat_routes;
#[path = "errors.rs"]
pub mod errors;
#[path = "extract.rs"]
pub mod extract;
#[path = "state.rs"]
pub mod state;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// `GET /health` - liveness only, no core logic behind it.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "workspace-assistant",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Builds the CORS layer from the allowed browser origins. Credentials are
/// allowed, so origins must be listed explicitly rather than wildcarded.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
}

/// Assembles the full HTTP surface.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/auth/google", post(auth_routes::google_auth))
        .route("/api/auth/refresh", post(auth_routes::refresh))
        .route("/api/auth/google-config", get(auth_routes::google_config))
        .route("/api/auth/check", get(auth_routes::check))
        .route("/api/auth/me", get(auth_routes::me))
        .route("/api/auth/logout", post(auth_routes::logout))
        .route("/api/ai/chat", post(ai_routes::chat))
        .route(
            "/api/chat/sessions",
            post(chat_routes::create_session).get(chat_routes::list_sessions),
        )
        .route(
            "/api/chat/sessions/:id",
            get(chat_routes::get_session).delete(chat_routes::delete_session),
        )
        .route(
            "/api/chat/sessions/:id/title",
            put(chat_routes::rename_session),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(allowed_origins))
}
