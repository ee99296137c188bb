//! OpenAI-compatible LLM Provider
//!
//! Implementation of `LlmProvider` for any endpoint exposing the OpenAI
//! `chat/completions` API, including native function calling.

use std::collections::HashMap;
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, FinishReason, GenerationOptions, LlmProvider, ModelInfo, ProviderInfo,
        TokenUsage,
    },
    tool::{ToolCall, ToolSchema},
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// API base URL (without the trailing `/chat/completions`)
    pub base_url: String,

    /// Bearer credential
    pub api_key: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: String::new(),
            timeout_secs: 120,
        }
    }
}

impl OpenAiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// OpenAI-compatible LLM provider
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    /// Create from configuration; fails when no credential is set
    pub fn from_config(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(AgentError::Config("LLM API key is not set".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))?;

        tracing::info!(endpoint = %config.base_url, "Initialized OpenAI-compatible provider");

        Ok(Self { client, config })
    }

    /// Convert agent messages to the wire format
    fn convert_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::System => ApiMessage::plain("system", &m.content),
                Role::User => ApiMessage::plain("user", &m.content),
                Role::Assistant if m.has_tool_calls() => ApiMessage {
                    role: "assistant",
                    content: (!m.content.is_empty()).then(|| m.content.clone()),
                    tool_calls: Some(m.tool_calls.iter().map(ApiToolCall::from_call).collect()),
                    tool_call_id: None,
                },
                Role::Assistant => ApiMessage::plain("assistant", &m.content),
                Role::Tool => match m.tool_call_id() {
                    Some(id) => ApiMessage {
                        role: "tool",
                        content: Some(m.content.clone()),
                        tool_calls: None,
                        tool_call_id: Some(id.to_string()),
                    },
                    // Tool output without a call ID (fenced style) appears as user context
                    None => ApiMessage::plain("user", &m.content),
                },
            })
            .collect()
    }

    /// Convert tool schemas to function definitions
    fn convert_tools(tools: &[ToolSchema]) -> Vec<ApiTool> {
        tools
            .iter()
            .map(|t| ApiTool {
                kind: "function",
                function: ApiFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    /// Convert a wire response to an agent completion
    fn convert_completion(response: ChatCompletionResponse, requested_model: &str) -> Result<Completion> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Provider("Response contained no choices".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(ApiToolCall::into_call)
            .collect();

        let finish_reason = choice.finish_reason.as_deref().map(FinishReason::parse);

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            model: response.model.unwrap_or_else(|| requested_model.to_string()),
            tool_calls,
            usage: response.usage,
            truncated: finish_reason == Some(FinishReason::Length),
            finish_reason,
        })
    }

    /// Map a non-success HTTP status to an agent error
    fn status_error(status: StatusCode, body: &str) -> AgentError {
        let detail = format!("HTTP {}: {}", status, body.chars().take(500).collect::<String>());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Auth(detail),
            StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited(detail),
            s if s.is_server_error() => AgentError::ProviderUnavailable(detail),
            _ => AgentError::Provider(detail),
        }
    }

    fn transport_error(err: &reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::Timeout(format!("model request: {}", err))
        } else if err.is_connect() {
            AgentError::ProviderUnavailable(err.to_string())
        } else {
            AgentError::Provider(err.to_string())
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "OpenAI-compatible".into(),
            endpoint: self.config.base_url.clone(),
            supports_tools: true,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        match self.list_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("LLM endpoint health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let request = ChatCompletionRequest {
            model: &options.model,
            messages: Self::convert_messages(messages),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stop: (!options.stop_sequences.is_empty()).then_some(&options.stop_sequences),
            tools: (!tools.is_empty()).then(|| Self::convert_tools(tools)),
        };

        tracing::debug!(model = %options.model, messages = messages.len(), tools = tools.len(), "Requesting completion");

        let response = self.client
            .post(self.config.endpoint("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::status_error(status, &body));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("Malformed completion response: {}", e)))?;

        Self::convert_completion(body, &options.model)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self.client
            .get(self.config.endpoint("models"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::status_error(status, &body));
        }

        let models: ModelList = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("Malformed model list: {}", e)))?;

        Ok(models
            .data
            .into_iter()
            .map(|m| ModelInfo { id: m.id, owned_by: m.owned_by })
            .collect())
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn plain(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ApiFunctionDef,
}

#[derive(Debug, Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: ApiFunctionCall,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    /// JSON-encoded argument object
    #[serde(default)]
    arguments: String,
}

impl ApiToolCall {
    fn from_call(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: function_kind(),
            function: ApiFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments_object().to_string(),
            },
        }
    }

    fn into_call(self) -> ToolCall {
        let arguments = if self.function.arguments.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str::<HashMap<String, serde_json::Value>>(&self.function.arguments)
                .unwrap_or_else(|e| {
                    tracing::warn!(tool = %self.function.name, "Model sent unparseable tool arguments: {}", e);
                    HashMap::new()
                })
        };

        ToolCall {
            name: self.function.name,
            arguments,
            id: self.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ApiModel>,
}

#[derive(Debug, Deserialize)]
struct ApiModel {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
}
