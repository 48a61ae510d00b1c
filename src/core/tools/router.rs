// The tool invocation router: resolves a named tool against the registry,
// attaches the caller's scoped Google credential, dispatches with a bounded
// timeout and retry policy, and folds every outcome - good or bad - into a
// `ToolCallResult`. A failed tool call is conversational information, not a
// system failure, so `invoke` is infallible at the type level.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use crate::core::auth::Identity;

use super::models::{
    ToolCallRequest, ToolCallResult, ToolDescriptor, ToolFailure, ToolTransportError,
};
use super::registry::ToolRegistry;

/// Wire access to the tool-execution endpoint. The router's contract
/// (timeout, retry, correlation) holds regardless of what this is backed by.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolTransportError>;

    /// Invokes one tool. `credential` is the caller's scoped Google access
    /// token - never the application session token.
    async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        credential: &str,
        correlation_id: Uuid,
    ) -> Result<Value, ToolTransportError>;
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no Google credential on file for this account")]
    MissingCredential,

    #[error("Google credential refresh failed: {0}")]
    Refresh(String),
}

/// Yields a current, valid Google access token for an identity, refreshing
/// it when it nears expiry. Keeping this behind a trait bounds the blast
/// radius of a compromised tool endpoint to the Google scopes of one user.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn access_token(&self, identity: &Identity) -> Result<String, BrokerError>;
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Per-dispatch bound; exceeding it yields a `ToolTimeout` result.
    pub call_timeout: Duration,
    /// Extra attempts after the first, for transient transport failures only.
    pub max_retries: u32,
    /// Base backoff between attempts, doubled each retry.
    pub retry_backoff: Duration,
    /// Result payloads above this many serialized bytes are truncated.
    pub max_result_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
            max_result_bytes: 16 * 1024,
        }
    }
}

pub struct ToolRouter<T, B> {
    transport: T,
    broker: B,
    registry: Arc<ToolRegistry>,
    config: RouterConfig,
}

impl<T, B> ToolRouter<T, B>
where
    T: ToolTransport,
    B: CredentialBroker,
{
    pub fn new(transport: T, broker: B, registry: Arc<ToolRegistry>, config: RouterConfig) -> Self {
        Self {
            transport,
            broker,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Re-reads the endpoint's capability list into the registry. Called at
    /// startup and by the periodic refresh task.
    pub async fn refresh_registry(&self) -> Result<usize, ToolTransportError> {
        self.registry.refresh(&self.transport).await
    }

    /// Dispatches one tool call and returns its result. Every failure mode
    /// is folded into the result so the conversation can continue.
    pub async fn invoke(&self, identity: &Identity, request: &ToolCallRequest) -> ToolCallResult {
        let started = Instant::now();

        // Unknown names fail fast - no credential work, no network.
        let Some(_descriptor) = self.registry.lookup(&request.name) else {
            tracing::warn!(tool = %request.name, correlation_id = %request.correlation_id, "unknown tool requested");
            return ToolCallResult::failed(
                request,
                ToolFailure::UnknownTool(request.name.clone()),
                elapsed_ms(started),
            );
        };

        let credential = match self.broker.access_token(identity).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(tool = %request.name, subject = %identity.subject, error = %e, "could not obtain Google credential");
                return ToolCallResult::failed(
                    request,
                    ToolFailure::Rejected {
                        detail: e.to_string(),
                        auth_required: true,
                    },
                    elapsed_ms(started),
                );
            }
        };

        let mut attempt: u32 = 0;
        loop {
            let dispatch = self.transport.call_tool(
                &request.name,
                &request.arguments,
                &credential,
                request.correlation_id,
            );

            match timeout(self.config.call_timeout, dispatch).await {
                // Transport never answered within the bound; the dispatch
                // future is dropped (cancelled) here.
                Err(_) => {
                    tracing::warn!(tool = %request.name, correlation_id = %request.correlation_id, "tool call timed out");
                    return ToolCallResult::failed(
                        request,
                        ToolFailure::Timeout {
                            seconds: self.config.call_timeout.as_secs(),
                        },
                        elapsed_ms(started),
                    );
                }
                Ok(Ok(payload)) => {
                    let (payload, truncated) =
                        bound_payload(payload, self.config.max_result_bytes);
                    tracing::debug!(
                        tool = %request.name,
                        correlation_id = %request.correlation_id,
                        latency_ms = elapsed_ms(started),
                        truncated,
                        "tool call succeeded"
                    );
                    return ToolCallResult::succeeded(
                        request,
                        payload,
                        truncated,
                        elapsed_ms(started),
                    );
                }
                Ok(Err(e)) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self.config.retry_backoff * 2u32.pow(attempt - 1);
                    tracing::debug!(tool = %request.name, attempt, error = %e, "retrying tool call");
                    sleep(backoff).await;
                }
                Ok(Err(ToolTransportError::Status { status, detail })) if status < 500 => {
                    // Deterministic rejection (bad arguments, missing scope):
                    // retrying cannot help.
                    return ToolCallResult::failed(
                        request,
                        ToolFailure::Rejected {
                            detail: format!("{status}: {detail}"),
                            auth_required: status == 401 || status == 403,
                        },
                        elapsed_ms(started),
                    );
                }
                Ok(Err(e)) => {
                    tracing::warn!(tool = %request.name, correlation_id = %request.correlation_id, error = %e, "tool call failed");
                    return ToolCallResult::failed(
                        request,
                        ToolFailure::Transport(e.to_string()),
                        elapsed_ms(started),
                    );
                }
            }
        }
    }
}

/// The orchestrator's view of tool dispatch: the advertised tool surface
/// plus `invoke`. A trait so turns are testable with scripted invokers.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn available_tools(&self) -> Arc<Vec<ToolDescriptor>>;

    async fn invoke(&self, identity: &Identity, request: &ToolCallRequest) -> ToolCallResult;
}

#[async_trait]
impl<T, B> ToolInvoker for ToolRouter<T, B>
where
    T: ToolTransport,
    B: CredentialBroker,
{
    fn available_tools(&self) -> Arc<Vec<ToolDescriptor>> {
        self.registry.descriptors()
    }

    async fn invoke(&self, identity: &Identity, request: &ToolCallRequest) -> ToolCallResult {
        ToolRouter::invoke(self, identity, request).await
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Enforces the result size bound. Oversized payloads are replaced by a
/// serialized prefix (cut at a char boundary) rather than failing the call.
fn bound_payload(payload: Value, max_bytes: usize) -> (Value, bool) {
    let serialized = payload.to_string();
    if serialized.len() <= max_bytes {
        return (payload, false);
    }

    let mut cut = max_bytes;
    while !serialized.is_char_boundary(cut) {
        cut -= 1;
    }
    (Value::String(serialized[..cut].to_string()), true)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::GoogleClaims;
    use chrono::Utc;
    use serde_json::json;
    use std::future::pending;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTransport {
        calls: AtomicU32,
        /// Status errors to serve before the scripted success, oldest first.
        failures: Vec<ToolTransportError>,
        response: Value,
        hang: bool,
    }

    impl ScriptedTransport {
        fn ok(response: Value) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures: Vec::new(),
                response,
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures: Vec::new(),
                response: Value::Null,
                hang: true,
            }
        }

        fn failing_then_ok(failures: Vec<ToolTransportError>, response: Value) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                response,
                hang: false,
            }
        }
    }

    #[async_trait]
    impl ToolTransport for ScriptedTransport {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolTransportError> {
            Ok(Vec::new())
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: &Map<String, Value>,
            credential: &str,
            _correlation_id: Uuid,
        ) -> Result<Value, ToolTransportError> {
            assert_eq!(credential, "google-token", "router must forward the scoped credential");
            if self.hang {
                pending::<()>().await;
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.failures.get(call) {
                Some(ToolTransportError::Status { status, detail }) => {
                    Err(ToolTransportError::Status {
                        status: *status,
                        detail: detail.clone(),
                    })
                }
                Some(ToolTransportError::Network(msg)) => {
                    Err(ToolTransportError::Network(msg.clone()))
                }
                None => Ok(self.response.clone()),
            }
        }
    }

    struct StaticBroker;

    #[async_trait]
    impl CredentialBroker for StaticBroker {
        async fn access_token(&self, _identity: &Identity) -> Result<String, BrokerError> {
            Ok("google-token".to_string())
        }
    }

    struct EmptyBroker;

    #[async_trait]
    impl CredentialBroker for EmptyBroker {
        async fn access_token(&self, _identity: &Identity) -> Result<String, BrokerError> {
            Err(BrokerError::MissingCredential)
        }
    }

    fn identity() -> Identity {
        Identity::from_claims(
            &GoogleClaims {
                subject: "u1".into(),
                email: "a@b.com".into(),
                name: "Ada".into(),
                picture: None,
            },
            Utc::now(),
        )
    }

    fn registry_with(names: &[&str]) -> Arc<ToolRegistry> {
        let registry = ToolRegistry::new();
        registry.install(
            names
                .iter()
                .map(|n| ToolDescriptor {
                    name: n.to_string(),
                    description: String::new(),
                    input_schema: Value::Null,
                    parallel_safe: false,
                })
                .collect(),
        );
        Arc::new(registry)
    }

    fn request(name: &str) -> ToolCallRequest {
        ToolCallRequest::new(Uuid::new_v4(), 0, name.to_string(), Map::new())
    }

    fn fast_config() -> RouterConfig {
        RouterConfig {
            call_timeout: Duration::from_millis(100),
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
            max_result_bytes: 64,
        }
    }

    #[tokio::test]
    async fn unknown_tool_fails_fast_without_dispatch() {
        let transport = ScriptedTransport::ok(json!({}));
        let router = ToolRouter::new(transport, StaticBroker, registry_with(&[]), fast_config());

        let result = router.invoke(&identity(), &request("nope")).await;
        assert!(!result.success);
        assert!(matches!(result.failure, Some(ToolFailure::UnknownTool(_))));
        assert_eq!(router.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_call_carries_the_correlation_id() {
        let transport = ScriptedTransport::ok(json!({"events": []}));
        let router = ToolRouter::new(
            transport,
            StaticBroker,
            registry_with(&["list_events"]),
            fast_config(),
        );

        let req = request("list_events");
        let result = router.invoke(&identity(), &req).await;
        assert!(result.success);
        assert_eq!(result.correlation_id, req.correlation_id);
        assert_eq!(result.payload, json!({"events": []}));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_dispatch_folds_into_a_timeout_result() {
        let transport = ScriptedTransport::hanging();
        let router = ToolRouter::new(
            transport,
            StaticBroker,
            registry_with(&["slow_tool"]),
            fast_config(),
        );

        let result = router.invoke(&identity(), &request("slow_tool")).await;
        assert!(!result.success);
        assert!(matches!(result.failure, Some(ToolFailure::Timeout { .. })));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let transport = ScriptedTransport::failing_then_ok(
            vec![
                ToolTransportError::Network("connection reset".into()),
                ToolTransportError::Status {
                    status: 503,
                    detail: "unavailable".into(),
                },
            ],
            json!("ok"),
        );
        let router = ToolRouter::new(
            transport,
            StaticBroker,
            registry_with(&["flaky"]),
            fast_config(),
        );

        let result = router.invoke(&identity(), &request("flaky")).await;
        assert!(result.success);
        assert_eq!(router.transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = ScriptedTransport::failing_then_ok(
            vec![ToolTransportError::Status {
                status: 400,
                detail: "malformed arguments".into(),
            }],
            json!("never served"),
        );
        let router = ToolRouter::new(
            transport,
            StaticBroker,
            registry_with(&["strict"]),
            fast_config(),
        );

        let result = router.invoke(&identity(), &request("strict")).await;
        assert!(!result.success);
        assert!(matches!(
            result.failure,
            Some(ToolFailure::Rejected {
                auth_required: false,
                ..
            })
        ));
        assert_eq!(router.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_google_credential_becomes_auth_required_rejection() {
        let transport = ScriptedTransport::ok(json!({}));
        let router = ToolRouter::new(
            transport,
            EmptyBroker,
            registry_with(&["send_email"]),
            fast_config(),
        );

        let result = router.invoke(&identity(), &request("send_email")).await;
        assert!(matches!(
            result.failure,
            Some(ToolFailure::Rejected {
                auth_required: true,
                ..
            })
        ));
        assert_eq!(router.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_payloads_are_truncated_not_failed() {
        let big = json!({ "blob": "x".repeat(4096) });
        let transport = ScriptedTransport::ok(big);
        let router = ToolRouter::new(
            transport,
            StaticBroker,
            registry_with(&["read_doc"]),
            fast_config(),
        );

        let result = router.invoke(&identity(), &request("read_doc")).await;
        assert!(result.success);
        assert!(result.truncated);
        assert!(result.payload.as_str().unwrap().len() <= 64);
    }

    #[test]
    fn bound_payload_respects_char_boundaries() {
        let payload = Value::String("héllo wörld".repeat(20));
        let (bounded, truncated) = bound_payload(payload, 32);
        assert!(truncated);
        assert!(bounded.as_str().unwrap().len() <= 32);
    }
}
