// HTTP transport for the remote tool-execution endpoint.
//
// The endpoint exposes a capability list (`GET /tools`) and per-tool
// invocation (`POST /tools/{name}`). Every invocation carries the user's
// scoped Google access token as the bearer credential and the request's
// correlation id as a header; the application session token never crosses
// this boundary.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::tools::{ToolDescriptor, ToolTransport, ToolTransportError};

const CORRELATION_HEADER: &str = "X-Correlation-Id";

#[derive(Debug, Deserialize)]
struct ToolListResponse {
    tools: Vec<ToolDescriptor>,
}

pub struct WorkspaceToolClient {
    client: Client,
    base_url: String,
}

impl WorkspaceToolClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
        }
    }

    fn list_endpoint(&self) -> String {
        format!("{}/tools", self.base_url)
    }

    fn call_endpoint(&self, name: &str) -> String {
        format!("{}/tools/{}", self.base_url, name)
    }
}

#[async_trait]
impl ToolTransport for WorkspaceToolClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolTransportError> {
        let response = self
            .client
            .get(self.list_endpoint())
            .send()
            .await
            .map_err(|e| ToolTransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(ToolTransportError::Status { status, detail });
        }

        let listing: ToolListResponse = response
            .json()
            .await
            .map_err(|e| ToolTransportError::Network(format!("capability list parse: {e}")))?;

        Ok(listing.tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        credential: &str,
        correlation_id: Uuid,
    ) -> Result<Value, ToolTransportError> {
        let response = self
            .client
            .post(self.call_endpoint(name))
            .header("Authorization", format!("Bearer {credential}"))
            .header(CORRELATION_HEADER, correlation_id.to_string())
            .json(arguments)
            .send()
            .await
            .map_err(|e| ToolTransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(ToolTransportError::Status { status, detail });
        }

        response
            .json()
            .await
            .map_err(|e| ToolTransportError::Network(format!("result parse: {e}")))
    }
}
