// This is the entry point of the Workspace Assistant server.
//
// **Architecture Overview:**
// - `core/` = Business logic (transport-agnostic)
// - `infra/` = Implementations of core traits (stores, Google, Groq, tools)
// - `api/`  = HTTP adapters (axum routes)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Start background maintenance (tool registry refresh)
// 4. Serve the HTTP API

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "api/api_layer.rs"]
mod api;
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;

use crate::api::AppState;
use crate::core::auth::{CredentialExchanger, SessionTokenManager};
use crate::core::chat::{ChatHistoryService, ChatOrchestrator, OrchestratorConfig};
use crate::core::tools::{RouterConfig, ToolRegistry, ToolRouter};
use crate::infra::ai::{GroqChatClient, GroqConfig};
use crate::infra::auth::{GoogleIdTokenVerifier, SqliteAuthStore};
use crate::infra::chat::SqliteChatStore;
use crate::infra::tools::{GoogleCredentialBroker, WorkspaceToolClient};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let google_client_id = std::env::var("GOOGLE_OAUTH_CLIENT_ID")
        .expect("Missing GOOGLE_OAUTH_CLIENT_ID environment variable!");
    let google_client_secret = env_or("GOOGLE_OAUTH_CLIENT_SECRET", "");
    if google_client_secret.is_empty() {
        tracing::warn!(
            "GOOGLE_OAUTH_CLIENT_SECRET is not set - Google credential refresh will fail \
             and tool calls will ask the user to re-authenticate"
        );
    }

    let jwt_secret = std::env::var("JWT_SECRET_KEY").unwrap_or_else(|_| {
        tracing::warn!("JWT_SECRET_KEY not set - using an insecure development default");
        "change-this-in-production".to_string()
    });
    let access_ttl = Duration::minutes(env_parse("ACCESS_TOKEN_EXPIRE_MINUTES", 60));
    let refresh_ttl = Duration::days(env_parse("REFRESH_TOKEN_EXPIRE_DAYS", 7));

    let groq_api_key =
        std::env::var("GROQ_API_KEY").expect("Missing GROQ_API_KEY environment variable!");
    let groq_config = GroqConfig {
        model: env_or("GROQ_MODEL", "qwen/qwen3-32b"),
        temperature: env_parse("GROQ_TEMPERATURE", 0.7),
        max_tokens: std::env::var("GROQ_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok()),
    };

    let tool_endpoint = env_or("TOOL_SERVER_URL", "http://localhost:8001");
    let registry_refresh_secs: u64 = env_parse("TOOL_REGISTRY_REFRESH_SECS", 300);

    let port: u16 = env_parse("API_PORT", 8000);
    let allowed_origins: Vec<String> = env_or(
        "ALLOWED_ORIGINS",
        "http://localhost:3000,http://127.0.0.1:3000",
    )
    .split(',')
    .map(|s| s.trim().to_string())
    .filter(|s| !s.is_empty())
    .collect();

    // Keep runtime databases in a dedicated folder so the repo root stays tidy.
    let data_dir = "data";
    std::fs::create_dir_all(data_dir).expect("Failed to create data directory for SQLite files");
    let db_path = format!("{}/assistant.db", data_dir);

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // Create our services with their dependencies.
    // This is the "composition root" where we wire everything together.

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&format!("sqlite://{}?mode=rwc", db_path))
        .await
        .expect("Failed to connect to SQLite database");

    let auth_store = SqliteAuthStore::new(pool.clone());
    auth_store
        .migrate()
        .await
        .expect("Failed to migrate auth tables");

    let chat_store = SqliteChatStore::new(pool.clone());
    chat_store
        .migrate()
        .await
        .expect("Failed to migrate chat tables");

    // OAuth-to-session bridge
    let verifier = GoogleIdTokenVerifier::new(google_client_id.clone());
    let exchanger = Arc::new(CredentialExchanger::new(
        verifier,
        auth_store.clone(),
        auth_store.clone(),
    ));
    let sessions = Arc::new(SessionTokenManager::new(
        auth_store.clone(),
        auth_store,
        &jwt_secret,
        access_ttl,
        refresh_ttl,
    ));

    // Tool invocation router
    let registry = Arc::new(ToolRegistry::new());
    let transport = WorkspaceToolClient::new(tool_endpoint.clone());
    let broker = GoogleCredentialBroker::new(google_client_id.clone(), google_client_secret);
    let tool_router = Arc::new(ToolRouter::new(
        transport,
        broker,
        Arc::clone(&registry),
        RouterConfig::default(),
    ));

    // First capability fetch. A down tool endpoint is not fatal: the
    // assistant still chats, tools come back on the next refresh.
    match tool_router.refresh_registry().await {
        Ok(count) => tracing::info!(count, endpoint = %tool_endpoint, "tool registry loaded"),
        Err(e) => {
            tracing::warn!(error = %e, endpoint = %tool_endpoint, "initial tool registry load failed")
        }
    }

    // Background registry refresh, so tools added to the endpoint show up
    // without a restart.
    {
        let tool_router = Arc::clone(&tool_router);
        tokio::spawn(async move {
            loop {
                sleep(StdDuration::from_secs(registry_refresh_secs)).await;
                match tool_router.refresh_registry().await {
                    Ok(count) => tracing::debug!(count, "tool registry refreshed"),
                    Err(e) => tracing::warn!(error = %e, "tool registry refresh failed"),
                }
            }
        });
    }

    // Chat orchestration
    let engine = Arc::new(GroqChatClient::new(groq_api_key, groq_config));
    let history = Arc::new(ChatHistoryService::new(chat_store));
    let orchestrator = Arc::new(ChatOrchestrator::new(
        Arc::clone(&sessions),
        engine,
        Arc::clone(&tool_router),
        Arc::clone(&history),
        OrchestratorConfig::default(),
    ));

    let state = AppState {
        exchanger,
        sessions,
        orchestrator,
        history,
        google_client_id,
    };

    // ========================================================================
    // HTTP SERVER
    // ========================================================================

    let app = api::router(state, &allowed_origins);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "workspace assistant listening");
    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind API port");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
