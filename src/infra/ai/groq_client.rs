// =============================================================================
// GROQ CLIENT - OpenAI-compatible chat completions with function tools
// =============================================================================
//
// Implements `ConversationEngine` against Groq's chat completions API.
// The orchestrator's transcript is text-first: assistant entries that
// requested tools carry a JSON announcement ({"tool_calls": [...]}) and tool
// entries carry the folded result plus the correlation id. This client maps
// those back onto the wire protocol's structured `tool_calls` /
// `tool_call_id` fields so the model sees a properly threaded conversation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::core::chat::{
    ChatRole, ConversationEngine, EngineError, EngineReply, ToolCallIntent, TranscriptEntry,
};
use crate::core::tools::ToolDescriptor;

const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct GroqConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for GroqConfig {
    fn default() -> Self {
        Self {
            model: "qwen/qwen3-32b".to_string(),
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded arguments object, per the OpenAI wire format.
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// The JSON shape of an assistant transcript entry that requested tools.
#[derive(Debug, Deserialize)]
struct Announcement {
    tool_calls: Vec<AnnouncedCall>,
}

#[derive(Debug, Deserialize)]
struct AnnouncedCall {
    correlation_id: Uuid,
    name: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}

// =============================================================================
// CONVERSION
// =============================================================================

fn convert_entry(entry: &TranscriptEntry) -> WireMessage {
    match entry.role {
        ChatRole::User => WireMessage::text("user", &entry.content),
        ChatRole::Assistant => {
            // An announcement becomes a structured tool_calls message; any
            // other assistant entry is plain text.
            if let Ok(announcement) = serde_json::from_str::<Announcement>(&entry.content) {
                WireMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: Some(
                        announcement
                            .tool_calls
                            .into_iter()
                            .map(|call| WireToolCall {
                                id: call.correlation_id.to_string(),
                                call_type: "function".to_string(),
                                function: WireFunctionCall {
                                    name: call.name,
                                    arguments: Value::Object(call.arguments).to_string(),
                                },
                            })
                            .collect(),
                    ),
                    tool_call_id: None,
                }
            } else {
                WireMessage::text("assistant", &entry.content)
            }
        }
        ChatRole::Tool => WireMessage {
            role: "tool".to_string(),
            content: Some(entry.content.clone()),
            tool_calls: None,
            tool_call_id: entry.correlation_id.map(|id| id.to_string()),
        },
    }
}

fn convert_tools(tools: &[ToolDescriptor]) -> Vec<WireTool> {
    tools
        .iter()
        .map(|tool| WireTool {
            tool_type: "function",
            function: WireFunctionDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: if tool.input_schema.is_object() {
                    tool.input_schema.clone()
                } else {
                    json!({"type": "object", "properties": {}})
                },
            },
        })
        .collect()
}

fn reply_from_message(message: WireMessage) -> Result<EngineReply, EngineError> {
    if let Some(calls) = message.tool_calls.filter(|c| !c.is_empty()) {
        let intents = calls
            .into_iter()
            .map(|call| {
                let arguments = match serde_json::from_str::<Value>(&call.function.arguments) {
                    Ok(Value::Object(map)) => map,
                    _ => {
                        tracing::warn!(
                            tool = %call.function.name,
                            "model produced non-object tool arguments; passing empty object"
                        );
                        Map::new()
                    }
                };
                ToolCallIntent {
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();
        return Ok(EngineReply::ToolCalls(intents));
    }

    match message.content {
        Some(content) if !content.is_empty() => Ok(EngineReply::Direct(content)),
        _ => Err(EngineError::Provider(
            "model returned neither content nor tool calls".to_string(),
        )),
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct GroqChatClient {
    client: Client,
    api_key: String,
    config: GroqConfig,
}

impl GroqChatClient {
    pub fn new(api_key: String, config: GroqConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            config,
        }
    }
}

#[async_trait]
impl ConversationEngine for GroqChatClient {
    async fn respond(
        &self,
        system_prompt: &str,
        transcript: &[TranscriptEntry],
        tools: &[ToolDescriptor],
    ) -> Result<EngineReply, EngineError> {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        messages.push(WireMessage::text("system", system_prompt));
        messages.extend(transcript.iter().map(convert_entry));

        let wire_tools = (!tools.is_empty()).then(|| convert_tools(tools));
        let tool_choice = wire_tools.as_ref().map(|_| "auto");

        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            tools: wire_tools,
            tool_choice,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        tracing::debug!(
            model = %self.config.model,
            messages = transcript.len(),
            tools = tools.len(),
            "groq request"
        );

        let response = self
            .client
            .post(GROQ_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Provider(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());

            // Prefer the API's own error message when the body parses.
            if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(EngineError::Provider(format!(
                    "Groq API error ({status}): {}",
                    parsed.error.message
                )));
            }
            return Err(EngineError::Provider(format!(
                "Groq API error ({status}): {body}"
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Provider(format!("response parse failed: {e}")))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Provider("no choices in response".to_string()))?;

        reply_from_message(choice.message)
    }
}

// =============================================================================
// TESTS
// =============================================================================
