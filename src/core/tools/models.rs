// Tool invocation models. A request/result pair is owned by a single
// conversation turn and linked by its correlation id; results are never
// mutated after creation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// A remote tool as advertised by the tool-execution endpoint's capability
/// list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments object, passed through to the model.
    #[serde(default)]
    pub input_schema: Value,
    /// Opt-in flag: calls to this tool may run concurrently with other
    /// parallel-safe calls in the same round. Absent means sequential.
    #[serde(default)]
    pub parallel_safe: bool,
}

/// One tool call as requested by the conversation engine.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Unique per request; links the eventual result back to this request
    /// even when several calls are issued within one turn.
    pub correlation_id: Uuid,
    pub turn_id: Uuid,
    /// Issue order within the round. Results are appended to the transcript
    /// in this order regardless of completion order.
    pub sequence: usize,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(turn_id: Uuid, sequence: usize, name: String, arguments: Map<String, Value>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            turn_id,
            sequence,
            name,
            arguments,
        }
    }
}

/// Why a tool call did not produce a usable payload.
///
/// These are conversational information, not faults: the router folds them
/// into a `ToolCallResult` so the model can react (retry, apologize, ask).
#[derive(Debug, Clone, Error)]
pub enum ToolFailure {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool rejected the call: {detail}")]
    Rejected { detail: String, auth_required: bool },

    #[error("tool call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("tool endpoint unreachable: {0}")]
    Transport(String),
}

impl ToolFailure {
    /// Stable machine-readable label for transcript entries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolFailure::UnknownTool(_) => "unknown_tool",
            ToolFailure::Rejected { .. } => "tool_rejected",
            ToolFailure::Timeout { .. } => "tool_timeout",
            ToolFailure::Transport(_) => "transport_error",
        }
    }
}

/// The outcome of one tool invocation. Exactly one result exists per request.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub correlation_id: Uuid,
    pub tool_name: String,
    pub sequence: usize,
    pub success: bool,
    pub payload: Value,
    pub failure: Option<ToolFailure>,
    pub truncated: bool,
    pub latency_ms: u64,
}

impl ToolCallResult {
    pub fn succeeded(
        request: &ToolCallRequest,
        payload: Value,
        truncated: bool,
        latency_ms: u64,
    ) -> Self {
        Self {
            correlation_id: request.correlation_id,
            tool_name: request.name.clone(),
            sequence: request.sequence,
            success: true,
            payload,
            failure: None,
            truncated,
            latency_ms,
        }
    }

    pub fn failed(request: &ToolCallRequest, failure: ToolFailure, latency_ms: u64) -> Self {
        Self {
            correlation_id: request.correlation_id,
            tool_name: request.name.clone(),
            sequence: request.sequence,
            success: false,
            payload: Value::Null,
            failure: Some(failure),
            truncated: false,
            latency_ms,
        }
    }

    /// The JSON object folded into the transcript as the tool-role entry.
    pub fn transcript_payload(&self) -> Value {
        match &self.failure {
            None => {
                let mut body = json!({
                    "success": true,
                    "tool_name": self.tool_name,
                    "result": self.payload,
                });
                if self.truncated {
                    body["truncated"] = json!(true);
                    body["note"] = json!("result truncated to fit the size bound");
                }
                body
            }
            Some(failure) => {
                let mut body = json!({
                    "success": false,
                    "tool_name": self.tool_name,
                    "error": failure.to_string(),
                    "kind": failure.kind(),
                });
                if let ToolFailure::Rejected {
                    auth_required: true,
                    ..
                } = failure
                {
                    body["auth_required"] = json!(true);
                }
                body
            }
        }
    }
}

/// Transport-level errors, classified for the retry policy.
#[derive(Debug, Error)]
pub enum ToolTransportError {
    #[error("tool endpoint returned {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("network error: {0}")]
    Network(String),
}

impl ToolTransportError {
    /// Connection-level failures and 5xx answers are transient; 4xx answers
    /// are deterministic rejections and must not be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolTransportError::Network(_) => true,
            ToolTransportError::Status { status, .. } => *status >= 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(ToolTransportError::Network("reset".into()).is_retryable());
        assert!(ToolTransportError::Status {
            status: 503,
            detail: "unavailable".into()
        }
        .is_retryable());
        assert!(!ToolTransportError::Status {
            status: 400,
            detail: "bad args".into()
        }
        .is_retryable());
    }

    #[test]
    fn transcript_payload_marks_auth_required() {
        let request = ToolCallRequest::new(Uuid::new_v4(), 0, "send_email".into(), Map::new());
        let result = ToolCallResult::failed(
            &request,
            ToolFailure::Rejected {
                detail: "Google authentication required".into(),
                auth_required: true,
            },
            12,
        );
        let body = result.transcript_payload();
        assert_eq!(body["success"], false);
        assert_eq!(body["auth_required"], true);
        assert_eq!(body["kind"], "tool_rejected");
    }

    #[test]
    fn transcript_payload_notes_truncation() {
        let request = ToolCallRequest::new(Uuid::new_v4(), 0, "list_events".into(), Map::new());
        let result = ToolCallResult::succeeded(&request, json!("partial…"), true, 5);
        let body = result.transcript_payload();
        assert_eq!(body["truncated"], true);
    }
}
