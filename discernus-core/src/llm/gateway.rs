//! LLM Gateway (§4.3).
//!
//! The single choke point every component calls through to reach a
//! model: parameter cleaning (§4.2), rate limiting, retry with backoff and
//! rolling health classification, fallback-model routing, and per-call
//! cost accounting against a daily budget. Nothing upstream talks to an
//! `LLMClient` directly.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::artifact::AuditEvent;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider_params::ProviderParameterManager;

use super::client::MultiProviderClient;
use super::types::{CompletionRequest, CompletionResponse, CostTracker, Provider};

/// Health bucket derived from a rolling window of recent call outcomes
/// (§4.3): `healthy` at ratio ≥0.8, `degraded` in [0.5, 0.8), else `broken`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
    Broken,
}

const HEALTH_WINDOW: usize = 20;

struct ModelHealth {
    outcomes: VecDeque<bool>,
}

impl ModelHealth {
    fn new() -> Self {
        Self {
            outcomes: VecDeque::with_capacity(HEALTH_WINDOW),
        }
    }

    fn record(&mut self, success: bool) {
        if self.outcomes.len() == HEALTH_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|s| **s).count();
        successes as f64 / self.outcomes.len() as f64
    }

    fn classification(&self) -> Health {
        let ratio = self.ratio();
        if ratio >= 0.8 {
            Health::Healthy
        } else if ratio >= 0.5 {
            Health::Degraded
        } else {
            Health::Broken
        }
    }
}

/// Token-bucket rate limiter for cloud providers, and a simple
/// inter-request gap for local/self-hosted providers like ollama (§4.3:
/// "token-bucket for cloud, inter-request gap for local/ollama").
enum RateLimiter {
    TokenBucket {
        capacity: f64,
        tokens: f64,
        refill_per_sec: f64,
        last_refill: Instant,
    },
    InterRequestGap {
        min_gap: Duration,
        last_call: Option<Instant>,
    },
}

impl RateLimiter {
    fn token_bucket(capacity: f64, refill_per_sec: f64) -> Self {
        Self::TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn inter_request_gap(min_gap: Duration) -> Self {
        Self::InterRequestGap {
            min_gap,
            last_call: None,
        }
    }

    /// Return how long the caller must wait before the call is allowed.
    fn wait_duration(&mut self) -> Duration {
        match self {
            Self::TokenBucket {
                capacity,
                tokens,
                refill_per_sec,
                last_refill,
            } => {
                let now = Instant::now();
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * *refill_per_sec).min(*capacity);
                *last_refill = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Duration::ZERO
                } else {
                    let deficit = 1.0 - *tokens;
                    *tokens = 0.0;
                    Duration::from_secs_f64(deficit / *refill_per_sec)
                }
            }
            Self::InterRequestGap { min_gap, last_call } => {
                let now = Instant::now();
                let wait = match last_call {
                    Some(last) => {
                        let elapsed = now.duration_since(*last);
                        if elapsed < *min_gap {
                            *min_gap - elapsed
                        } else {
                            Duration::ZERO
                        }
                    }
                    None => Duration::ZERO,
                };
                *last_call = Some(now + wait);
                wait
            }
        }
    }
}

fn default_rate_limiter(provider: &str) -> RateLimiter {
    if provider == "ollama" {
        RateLimiter::inter_request_gap(Duration::from_millis(250))
    } else {
        RateLimiter::token_bucket(10.0, 2.0)
    }
}

/// The static per-model price table's static portion lives on `ModelSpec`
/// already (`input_cost_per_m`/`output_cost_per_m`); the Gateway only adds
/// the accumulated-cost-vs-budget bookkeeping on top.
pub struct LLMGateway {
    client: MultiProviderClient,
    params: ProviderParameterManager,
    config: Config,
    limiters: Mutex<HashMap<String, RateLimiter>>,
    health: Mutex<HashMap<String, ModelHealth>>,
    costs: Mutex<CostTracker>,
    audit_log: Mutex<Vec<AuditEvent>>,
}

/// Outcome of a gateway call, including whether a fallback model was used.
pub struct GatewayResponse {
    pub response: CompletionResponse,
    pub fallback_used: Option<(String, String)>,
}

impl LLMGateway {
    pub fn new(client: MultiProviderClient, config: Config) -> Self {
        Self {
            client,
            params: ProviderParameterManager::new(),
            config,
            limiters: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            costs: Mutex::new(CostTracker::new()),
            audit_log: Mutex::new(Vec::new()),
        }
    }

    /// Health classification for a model, based on its rolling outcome
    /// window (§4.3).
    pub async fn health_for(&self, model: &str) -> Health {
        let mut health = self.health.lock().await;
        health
            .entry(model.to_string())
            .or_insert_with(ModelHealth::new)
            .classification()
    }

    /// Current accumulated cost for the day.
    pub async fn accumulated_cost(&self) -> f64 {
        self.costs.lock().await.total_cost
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit_log.lock().await.clone()
    }

    fn provider_for(&self, model: &str) -> Provider {
        let tag = self.params.provider_from_model(model);
        match tag.as_str() {
            "openai" => Provider::OpenAI,
            #[cfg(feature = "gemini")]
            "vertex_ai" => Provider::Google,
            _ => Provider::Anthropic,
        }
    }

    async fn wait_for_rate_limit(&self, model: &str) {
        let provider = self.params.provider_from_model(model);
        let mut limiters = self.limiters.lock().await;
        let limiter = limiters
            .entry(provider.clone())
            .or_insert_with(|| default_rate_limiter(&provider));
        let wait = limiter.wait_duration();
        drop(limiters);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn record_outcome(&self, model: &str, success: bool) {
        let mut health = self.health.lock().await;
        health
            .entry(model.to_string())
            .or_insert_with(ModelHealth::new)
            .record(success);
    }

    async fn audit(&self, kind: &str, detail: serde_json::Value) {
        self.audit_log.lock().await.push(AuditEvent::new(kind, detail));
    }

    /// Preflight budget check: deny the call outright if it would push
    /// accumulated cost past the daily limit, using a worst-case estimate.
    async fn check_budget(&self, estimate_usd: f64) -> Result<()> {
        let accumulated = self.accumulated_cost().await;
        if accumulated + estimate_usd > self.config.daily_budget_usd {
            return Err(Error::BudgetExceeded {
                accumulated_usd: accumulated,
                estimate_usd,
                limit_usd: self.config.daily_budget_usd,
            });
        }
        Ok(())
    }

    /// Issue a completion request through the gateway: clean parameters,
    /// rate-limit, retry with backoff, classify health, and fall back to
    /// an alternate model on a safety-filter block if permitted (§9).
    pub async fn complete(
        &self,
        mut request: CompletionRequest,
        fallback_model: Option<&str>,
    ) -> Result<GatewayResponse> {
        let primary_model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_models[0].clone());

        let rough_estimate = 0.05;
        self.check_budget(rough_estimate).await?;

        match self.try_model(&primary_model, request.clone()).await {
            Ok(response) => {
                self.record_outcome(&primary_model, true).await;
                self.account_cost(&response).await;
                self.audit(
                    "llm_call",
                    serde_json::json!({"model": primary_model, "fallback": false}),
                )
                .await;
                Ok(GatewayResponse {
                    response,
                    fallback_used: None,
                })
            }
            Err(Error::SafetyFilterBlocked { model }) if self.config.allow_fallback_models => {
                self.record_outcome(&primary_model, false).await;
                let fallback = fallback_model
                    .map(|s| s.to_string())
                    .or_else(|| self.config.default_models.get(1).cloned())
                    .ok_or_else(|| Error::SafetyFilterBlocked { model: model.clone() })?;

                warn!(primary = %model, fallback = %fallback, "safety filter block, routing to fallback model");
                request.model = Some(fallback.clone());
                let response = self.try_model(&fallback, request).await?;
                self.record_outcome(&fallback, true).await;
                self.account_cost(&response).await;
                self.audit(
                    "llm_call",
                    serde_json::json!({"model": fallback, "fallback": true, "primary": primary_model}),
                )
                .await;
                Ok(GatewayResponse {
                    response,
                    fallback_used: Some((primary_model, fallback)),
                })
            }
            Err(e) => {
                self.record_outcome(&primary_model, false).await;
                self.audit(
                    "llm_call_failed",
                    serde_json::json!({"model": primary_model, "error": e.to_string()}),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn account_cost(&self, response: &CompletionResponse) {
        let mut costs = self.costs.lock().await;
        costs.record(&response.model, &response.usage, response.cost);
    }

    /// Retry with exponential backoff on retryable errors, up to 3
    /// attempts, waiting for the rate limiter before every attempt.
    async fn try_model(&self, model: &str, mut request: CompletionRequest) -> Result<CompletionResponse> {
        request.model = Some(model.to_string());

        let base_params = serde_json::json!({
            "max_tokens": request.max_tokens,
            "safety_settings": request.safety_settings,
        });
        let cleaned = self.params.clean_parameters(model, &base_params);
        info!(model, ?cleaned, "issuing gateway call");

        // Apply the cleaned parameters back onto the actual outgoing
        // request — cleaning that's only computed and logged never stops
        // the forbidden parameter from reaching the provider.
        request.max_tokens = cleaned
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        request.safety_settings = cleaned
            .get("safety_settings")
            .filter(|v| !v.is_null())
            .cloned();

        const MAX_ATTEMPTS: u32 = 3;
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            self.wait_for_rate_limit(model).await;
            let provider = self.provider_for(model);
            match self.client.complete_with(provider, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff = Duration::from_millis(250 * 2u64.pow(attempt));
                    warn!(model, attempt, ?backoff, error = %e, "retrying after transient error");
                    tokio::time::sleep(backoff).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("retry loop exhausted without error".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_classification_boundaries() {
        let mut health = ModelHealth::new();
        for _ in 0..8 {
            health.record(true);
        }
        for _ in 0..2 {
            health.record(false);
        }
        assert_eq!(health.classification(), Health::Healthy);

        let mut health = ModelHealth::new();
        for _ in 0..6 {
            health.record(true);
        }
        for _ in 0..4 {
            health.record(false);
        }
        assert_eq!(health.classification(), Health::Degraded);

        let mut health = ModelHealth::new();
        for _ in 0..4 {
            health.record(true);
        }
        for _ in 0..6 {
            health.record(false);
        }
        assert_eq!(health.classification(), Health::Broken);
    }

    #[test]
    fn test_token_bucket_depletes_and_refills() {
        let mut limiter = RateLimiter::token_bucket(2.0, 100.0);
        assert!(limiter.wait_duration().is_zero());
        assert!(limiter.wait_duration().is_zero());
        // Third call within the same instant should have to wait.
        assert!(!limiter.wait_duration().is_zero());
    }

    #[tokio::test]
    async fn test_budget_denies_when_exceeded() {
        let client = MultiProviderClient::new();
        let mut config = Config::default();
        config.daily_budget_usd = 0.01;
        let gateway = LLMGateway::new(client, config);
        let result = gateway.check_budget(0.05).await;
        assert!(matches!(result, Err(Error::BudgetExceeded { .. })));
    }

    /// A stub client that records the request it actually received, so
    /// cleaning can be checked against what would have reached the wire
    /// rather than against the value computed for logging.
    struct RecordingClient {
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl RecordingClient {
        fn new() -> Self {
            Self {
                last_request: Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl super::super::client::LLMClient for RecordingClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            *self.last_request.lock().await = Some(request);
            Ok(CompletionResponse {
                id: "rec-1".to_string(),
                model: "claude-3-5-sonnet-20241022".to_string(),
                content: String::new(),
                stop_reason: None,
                usage: Default::default(),
                timestamp: chrono::Utc::now(),
                cost: Some(0.0),
                tool_calls: Vec::new(),
            })
        }

        async fn embed(
            &self,
            _request: super::super::types::EmbeddingRequest,
        ) -> Result<super::super::types::EmbeddingResponse> {
            Err(Error::llm_api("recording", "not supported"))
        }

        fn provider(&self) -> Provider {
            Provider::Anthropic
        }

        fn available_models(&self) -> Vec<super::super::types::ModelSpec> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_forbidden_param_stripped_from_outgoing_request() {
        let recorder = std::sync::Arc::new(RecordingClient::new());
        let client = MultiProviderClient::new().with_client(recorder.clone() as std::sync::Arc<dyn super::super::client::LLMClient>);
        let config = Config::default();
        let gateway = LLMGateway::new(client, config);

        let request = CompletionRequest::new()
            .with_model("claude-3-5-sonnet-20241022")
            .with_message(crate::llm::types::ChatMessage::user("hi"))
            .with_max_tokens(8000);

        gateway.complete(request, None).await.unwrap();

        let sent = recorder.last_request.lock().await.clone().unwrap();
        assert_eq!(
            sent.max_tokens, None,
            "max_tokens is forbidden for every configured provider and must not reach the wire request"
        );
    }
}
