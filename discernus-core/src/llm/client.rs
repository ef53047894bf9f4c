//! LLM client trait and provider implementations.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

use super::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, ModelSpec,
    Provider, StopReason, ToolCall, ToolChoice, ToolDefinition, TokenUsage,
};

/// LLM client trait for making completions and embeddings.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Create embeddings for texts.
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Get the provider for this client.
    fn provider(&self) -> Provider;

    /// List available models.
    fn available_models(&self) -> Vec<ModelSpec>;
}

/// Configuration for LLM clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Max retries on failure
    pub max_retries: u32,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 120,
            max_retries: 3,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);

    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| {
        Client::builder().timeout(timeout).build()
    })) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client"),
    }
}

/// Translate a gateway-level [`ToolChoice`] into Anthropic's wire shape.
fn anthropic_tool_choice(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => serde_json::json!({"type": "auto"}),
        ToolChoice::Required => serde_json::json!({"type": "any"}),
        ToolChoice::Named(name) => serde_json::json!({"type": "tool", "name": name}),
    }
}

/// Anthropic Claude client.
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);

        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// Anthropic API types
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .clone()
            .or(self.config.default_model.clone())
            .unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string());

        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .map(|m| AnthropicMessage {
                role: match m.role {
                    super::types::ChatRole::User => "user".to_string(),
                    super::types::ChatRole::Assistant => "assistant".to_string(),
                    super::types::ChatRole::System => "user".to_string(), // System handled separately
                },
                content: m.content.clone(),
            })
            .collect();

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t: &ToolDefinition| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect()
        });
        let tool_choice = request.tool_choice.as_ref().map(anthropic_tool_choice);

        let api_request = AnthropicRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system,
            temperature: request.temperature,
            stop_sequences: request.stop,
            tools,
            tool_choice,
        };

        let url = format!("{}/v1/messages", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm_api("anthropic", format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_api("anthropic", format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<AnthropicError>(&body) {
                return Err(Error::llm_api(
                    "anthropic",
                    format!("{}: {}", error.error.error_type, error.error.message),
                ));
            }
            return Err(Error::llm_api("anthropic", format!("{}: {}", status, body)));
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_api("anthropic", format!("failed to parse response: {}", e)))?;

        let content = api_response
            .content
            .iter()
            .filter(|c| c.content_type == "text")
            .filter_map(|c| c.text.as_ref())
            .cloned()
            .collect::<Vec<_>>()
            .join("");

        let tool_calls: Vec<ToolCall> = api_response
            .content
            .iter()
            .filter(|c| c.content_type == "tool_use")
            .map(|c| ToolCall {
                id: c.id.clone().unwrap_or_default(),
                name: c.name.clone().unwrap_or_default(),
                arguments: c.input.clone().unwrap_or(serde_json::Value::Null),
            })
            .collect();

        let stop_reason = api_response.stop_reason.as_deref().map(|r| match r {
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            "tool_use" => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        });

        let usage = TokenUsage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
            cache_read_tokens: api_response.usage.cache_read_input_tokens,
            cache_creation_tokens: api_response.usage.cache_creation_input_tokens,
        };

        // Calculate cost based on model
        let model_spec = self
            .available_models()
            .into_iter()
            .find(|m| m.id == model)
            .unwrap_or_else(ModelSpec::claude_sonnet);
        let cost = model_spec.calculate_cost(usage.input_tokens, usage.output_tokens);

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content,
            stop_reason,
            usage,
            timestamp: Utc::now(),
            cost: Some(cost),
            tool_calls,
        })
    }

    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        // Anthropic doesn't have a native embedding API
        Err(Error::llm_api(
            "anthropic",
            "does not provide a direct embedding API",
        ))
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        vec![
            ModelSpec::claude_opus(),
            ModelSpec::claude_sonnet(),
            ModelSpec::claude_haiku(),
        ]
    }
}

/// OpenAI client.
pub struct OpenAIClient {
    config: ClientConfig,
    http: Client,
}

impl OpenAIClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);

        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAIFunctionDef,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: OpenAIUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    error: OpenAIErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorDetail {
    message: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    error_type: Option<String>,
}

// OpenAI Embedding types
#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    model: String,
    data: Vec<OpenAIEmbeddingData>,
    usage: OpenAIEmbeddingUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingUsage {
    prompt_tokens: u64,
    #[allow(dead_code)]
    total_tokens: u64,
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .clone()
            .or(self.config.default_model.clone())
            .unwrap_or_else(|| "gpt-4o".to_string());

        let mut messages: Vec<OpenAIMessage> = Vec::new();

        // Add system message if present
        if let Some(system) = &request.system {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
                tool_calls: None,
            });
        }

        // Add conversation messages
        for m in &request.messages {
            messages.push(OpenAIMessage {
                role: match m.role {
                    super::types::ChatRole::User => "user".to_string(),
                    super::types::ChatRole::Assistant => "assistant".to_string(),
                    super::types::ChatRole::System => "system".to_string(),
                },
                content: Some(m.content.clone()),
                tool_calls: None,
            });
        }

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t: &ToolDefinition| OpenAITool {
                    tool_type: "function",
                    function: OpenAIFunctionDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect()
        });
        let tool_choice = request.tool_choice.as_ref().map(|c| match c {
            ToolChoice::Auto => serde_json::json!("auto"),
            ToolChoice::Required => serde_json::json!("required"),
            ToolChoice::Named(name) => {
                serde_json::json!({"type": "function", "function": {"name": name}})
            }
        });

        let api_request = OpenAIRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop,
            tools,
            tool_choice,
        };

        let url = format!("{}/v1/chat/completions", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm_api("openai", format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_api("openai", format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<OpenAIError>(&body) {
                return Err(Error::llm_api("openai", error.error.message));
            }
            return Err(Error::llm_api("openai", format!("{}: {}", status, body)));
        }

        let api_response: OpenAIResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_api("openai", format!("failed to parse response: {}", e)))?;

        let choice = api_response
            .choices
            .first()
            .ok_or_else(|| Error::llm_api("openai", "no choices in response"))?;

        let stop_reason = choice.finish_reason.as_deref().map(|r| match r {
            "stop" => StopReason::EndTurn,
            "length" => StopReason::MaxTokens,
            "tool_calls" => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        });

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .as_ref()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| {
                        serde_json::from_str::<serde_json::Value>(&c.function.arguments)
                            .ok()
                            .map(|arguments| ToolCall {
                                id: c.id.clone(),
                                name: c.function.name.clone(),
                                arguments,
                            })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = TokenUsage {
            input_tokens: api_response.usage.prompt_tokens,
            output_tokens: api_response.usage.completion_tokens,
            cache_read_tokens: None,
            cache_creation_tokens: None,
        };

        // Calculate cost based on model
        let model_spec = self
            .available_models()
            .into_iter()
            .find(|m| m.id == model || model.starts_with(&m.id))
            .unwrap_or_else(ModelSpec::gpt4o);
        let cost = model_spec.calculate_cost(usage.input_tokens, usage.output_tokens);

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content: choice.message.content.clone().unwrap_or_default(),
            stop_reason,
            usage,
            timestamp: Utc::now(),
            cost: Some(cost),
            tool_calls,
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        let model = request
            .model
            .unwrap_or_else(|| "text-embedding-3-small".to_string());

        let api_request = OpenAIEmbeddingRequest {
            model: model.clone(),
            input: request.texts,
        };

        let url = format!("{}/v1/embeddings", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm_api("openai", format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_api("openai", format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<OpenAIError>(&body) {
                return Err(Error::llm_api("openai", error.error.message));
            }
            return Err(Error::llm_api("openai", format!("{}: {}", status, body)));
        }

        let api_response: OpenAIEmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_api("openai", format!("failed to parse response: {}", e)))?;

        let embeddings = api_response.data.into_iter().map(|d| d.embedding).collect();

        Ok(EmbeddingResponse {
            model: api_response.model,
            embeddings,
            usage: TokenUsage {
                input_tokens: api_response.usage.prompt_tokens,
                output_tokens: 0,
                cache_read_tokens: None,
                cache_creation_tokens: None,
            },
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        vec![ModelSpec::gpt4o(), ModelSpec::gpt4o_mini()]
    }
}

/// Google Gemini client. Used as the adversarial/verification model family
/// (§4.7 requires a different model family than the analysis call).
#[cfg(feature = "gemini")]
pub struct GoogleClient {
    config: ClientConfig,
    http: Client,
}

#[cfg(feature = "gemini")]
impl GoogleClient {
    const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);

        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// Google Gemini API types
#[cfg(feature = "gemini")]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiToolGroup>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<GeminiToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    safety_settings: Option<serde_json::Value>,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Serialize)]
struct GeminiToolGroup {
    function_declarations: Vec<GeminiFunctionDecl>,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Serialize)]
struct GeminiFunctionDecl {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiToolConfig {
    function_calling_config: GeminiFunctionCallingConfig,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFunctionCallingConfig {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_function_names: Option<Vec<String>>,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Serialize, Deserialize, Clone)]
struct GeminiFunctionCall {
    name: String,
    args: serde_json::Value,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: GeminiContent,
    finish_reason: Option<String>,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: u64,
    candidates_token_count: Option<u64>,
    #[allow(dead_code)]
    total_token_count: Option<u64>,
    cached_content_token_count: Option<u64>,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[cfg(feature = "gemini")]
#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[allow(dead_code)]
    status: Option<String>,
}

#[cfg(feature = "gemini")]
#[async_trait]
impl LLMClient for GoogleClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .clone()
            .or(self.config.default_model.clone())
            .unwrap_or_else(|| "gemini-2.0-flash".to_string());

        // Build contents from messages
        let contents: Vec<GeminiContent> = request
            .messages
            .iter()
            .map(|m| GeminiContent {
                role: match m.role {
                    super::types::ChatRole::User => "user".to_string(),
                    super::types::ChatRole::Assistant => "model".to_string(),
                    super::types::ChatRole::System => "user".to_string(), // Handled separately
                },
                parts: vec![GeminiPart {
                    text: Some(m.content.clone()),
                    function_call: None,
                }],
            })
            .collect();

        // System instruction (Gemini's equivalent of system prompt)
        let system_instruction = request.system.map(|s| GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart {
                text: Some(s),
                function_call: None,
            }],
        });

        let generation_config = Some(GeminiGenerationConfig {
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
            stop_sequences: request.stop,
        });

        let tools = request.tools.as_ref().map(|tools| {
            vec![GeminiToolGroup {
                function_declarations: tools
                    .iter()
                    .map(|t: &ToolDefinition| GeminiFunctionDecl {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        });
        let tool_config = request.tool_choice.as_ref().map(|c| match c {
            ToolChoice::Auto => GeminiToolConfig {
                function_calling_config: GeminiFunctionCallingConfig {
                    mode: "AUTO",
                    allowed_function_names: None,
                },
            },
            ToolChoice::Required => GeminiToolConfig {
                function_calling_config: GeminiFunctionCallingConfig {
                    mode: "ANY",
                    allowed_function_names: None,
                },
            },
            ToolChoice::Named(name) => GeminiToolConfig {
                function_calling_config: GeminiFunctionCallingConfig {
                    mode: "ANY",
                    allowed_function_names: Some(vec![name.clone()]),
                },
            },
        });

        let safety_settings = request.safety_settings.clone();

        let api_request = GeminiRequest {
            contents,
            system_instruction,
            generation_config,
            tools,
            tool_config,
            safety_settings,
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url(),
            model,
            self.config.api_key
        );

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm_api("google", format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_api("google", format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<GeminiError>(&body) {
                return Err(Error::llm_api("google", error.error.message));
            }
            return Err(Error::llm_api("google", format!("{}: {}", status, body)));
        }

        let api_response: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_api("google", format!("failed to parse response: {}", e)))?;

        let candidate = api_response
            .candidates
            .first()
            .ok_or_else(|| Error::llm_api("google", "no candidates in response"))?;

        let content = candidate
            .content
            .parts
            .iter()
            .filter_map(|p| p.text.clone())
            .collect::<Vec<_>>()
            .join("");

        let tool_calls: Vec<ToolCall> = candidate
            .content
            .parts
            .iter()
            .filter_map(|p| p.function_call.as_ref())
            .enumerate()
            .map(|(i, fc)| ToolCall {
                id: format!("gemini-call-{}", i),
                name: fc.name.clone(),
                arguments: fc.args.clone(),
            })
            .collect();

        let stop_reason = candidate.finish_reason.as_deref().map(|r| match r {
            "STOP" => StopReason::EndTurn,
            "MAX_TOKENS" => StopReason::MaxTokens,
            "STOP_SEQUENCE" => StopReason::StopSequence,
            _ if !tool_calls.is_empty() => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        });

        let usage_metadata = api_response.usage_metadata.unwrap_or(GeminiUsageMetadata {
            prompt_token_count: 0,
            candidates_token_count: Some(0),
            total_token_count: Some(0),
            cached_content_token_count: None,
        });

        let usage = TokenUsage {
            input_tokens: usage_metadata.prompt_token_count,
            output_tokens: usage_metadata.candidates_token_count.unwrap_or(0),
            cache_read_tokens: usage_metadata.cached_content_token_count,
            cache_creation_tokens: None,
        };

        // Calculate cost based on model
        let model_spec = self
            .available_models()
            .into_iter()
            .find(|m| m.id == model || model.contains(&m.id))
            .unwrap_or_else(ModelSpec::gemini_2_0_flash);
        let cost = model_spec.calculate_cost(usage.input_tokens, usage.output_tokens);

        // Generate a unique ID since Gemini doesn't return one
        let id = format!("gemini-{}", Utc::now().timestamp_millis());

        Ok(CompletionResponse {
            id,
            model,
            content,
            stop_reason,
            usage,
            timestamp: Utc::now(),
            cost: Some(cost),
            tool_calls,
        })
    }

    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        // Gemini's embedding API lives on a separate endpoint and model family;
        // not wired up since no component in this crate currently needs it
        // (the knowledge index's default Embedder routes through the hashing
        // embedder or a provider chosen by Config, not specifically Gemini).
        Err(Error::llm_api("google", "embedding not implemented"))
    }

    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        vec![
            ModelSpec::gemini_2_0_flash(),
            ModelSpec::gemini_1_5_pro(),
            ModelSpec::gemini_1_5_flash(),
        ]
    }
}

/// Multi-provider client that manages multiple LLM providers.
pub struct MultiProviderClient {
    clients: HashMap<Provider, Arc<dyn LLMClient>>,
    default_provider: Provider,
}

impl MultiProviderClient {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            default_provider: Provider::Anthropic,
        }
    }

    /// Add a client for a provider.
    pub fn with_client(mut self, client: Arc<dyn LLMClient>) -> Self {
        let provider = client.provider();
        self.clients.insert(provider, client);
        self
    }

    /// Set the default provider.
    pub fn with_default_provider(mut self, provider: Provider) -> Self {
        self.default_provider = provider;
        self
    }

    /// Get a client for a specific provider.
    pub fn get_client(&self, provider: Provider) -> Option<&Arc<dyn LLMClient>> {
        self.clients.get(&provider)
    }

    /// Get the default client.
    pub fn default_client(&self) -> Option<&Arc<dyn LLMClient>> {
        self.clients.get(&self.default_provider)
    }

    /// Complete using a specific provider.
    pub async fn complete_with(
        &self,
        provider: Provider,
        request: CompletionRequest,
    ) -> Result<CompletionResponse> {
        let client = self
            .clients
            .get(&provider)
            .ok_or_else(|| Error::llm_api(provider.to_string(), "no client registered"))?;
        client.complete(request).await
    }

    /// Complete using the default provider.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.complete_with(self.default_provider, request).await
    }

    /// Create embeddings using a specific provider.
    pub async fn embed_with(
        &self,
        provider: Provider,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        let client = self
            .clients
            .get(&provider)
            .ok_or_else(|| Error::llm_api(provider.to_string(), "no client registered"))?;
        client.embed(request).await
    }

    /// List all available models across providers.
    pub fn all_models(&self) -> Vec<ModelSpec> {
        self.clients
            .values()
            .flat_map(|c| c.available_models())
            .collect()
    }
}

impl Default for MultiProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe client wrapper with cost tracking.
pub struct TrackedClient {
    inner: Arc<dyn LLMClient>,
    costs: Arc<RwLock<super::types::CostTracker>>,
}

impl TrackedClient {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            inner: client,
            costs: Arc::new(RwLock::new(super::types::CostTracker::new())),
        }
    }

    /// Complete and track costs.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let response = self.inner.complete(request).await?;

        let mut costs = self.costs.write().await;
        costs.record(&response.model, &response.usage, response.cost);

        Ok(response)
    }

    /// Get current cost summary.
    pub async fn get_costs(&self) -> super::types::CostTracker {
        self.costs.read().await.clone()
    }

    /// Reset cost tracking.
    pub async fn reset_costs(&self) {
        let mut costs = self.costs.write().await;
        *costs = super::types::CostTracker::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("test-key")
            .with_base_url("https://custom.api.com")
            .with_default_model("claude-3-5-haiku")
            .with_timeout(60);

        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.base_url, Some("https://custom.api.com".to_string()));
        assert_eq!(config.default_model, Some("claude-3-5-haiku".to_string()));
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_multi_provider_client() {
        let client = MultiProviderClient::new().with_default_provider(Provider::OpenAI);

        assert!(client.default_client().is_none()); // No clients added yet
        assert_eq!(client.default_provider, Provider::OpenAI);
    }

    #[test]
    fn test_anthropic_available_models() {
        let client = AnthropicClient::new(ClientConfig::new("test"));
        let models = client.available_models();

        assert_eq!(models.len(), 3);
        assert!(models.iter().any(|m| m.id.contains("opus")));
        assert!(models.iter().any(|m| m.id.contains("sonnet")));
        assert!(models.iter().any(|m| m.id.contains("haiku")));
    }

    #[test]
    fn test_openai_available_models() {
        let client = OpenAIClient::new(ClientConfig::new("test"));
        let models = client.available_models();

        assert_eq!(models.len(), 2);
        assert!(models.iter().any(|m| m.id == "gpt-4o"));
        assert!(models.iter().any(|m| m.id == "gpt-4o-mini"));
    }

    #[test]
    fn test_anthropic_tool_choice_named() {
        let choice = ToolChoice::Named("record_analysis_with_work".to_string());
        let value = anthropic_tool_choice(&choice);
        assert_eq!(value["type"], "tool");
        assert_eq!(value["name"], "record_analysis_with_work");
    }
}
