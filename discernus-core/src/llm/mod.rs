//! LLM client abstraction, provider implementations, and the Gateway that
//! fronts them (§4.3).
//!
//! `client` holds the per-provider `LLMClient` implementations and the
//! `MultiProviderClient` that dispatches across them; `gateway` is the single
//! choke point every component calls through (parameter cleaning, rate
//! limiting, retries, fallback routing, cost accounting); `types` holds the
//! shared wire types.

pub mod client;
pub mod gateway;
pub mod types;

pub use client::{AnthropicClient, ClientConfig, LLMClient, MultiProviderClient, OpenAIClient, TrackedClient};
#[cfg(feature = "gemini")]
pub use client::GoogleClient;
pub use gateway::{GatewayResponse, Health, LLMGateway};
pub use types::{
    CacheControl, ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostTracker,
    EmbeddingRequest, EmbeddingResponse, ModelCosts, ModelSpec, Provider, StopReason, ToolCall,
    ToolChoice, ToolDefinition, TokenUsage,
};
