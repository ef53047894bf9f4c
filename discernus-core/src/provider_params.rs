//! Provider Parameter Manager (§4.2).
//!
//! Different LLM providers trip on different call parameters — `max_tokens`
//! has been observed to trigger safety-filter behaviour on several cloud
//! providers when applied to political/rhetorical content. This module
//! centralizes the allow/deny policy per provider tag so that knowledge
//! lives in one inspectable place instead of being rediscovered at each
//! call site.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Static per-provider parameter policy.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Parameters stripped from the caller's request before the call.
    pub forbidden_params: Vec<&'static str>,
    /// Parameters merged in regardless of what the caller passed.
    pub required_params: Vec<(&'static str, Value)>,
    /// Parameters added only if the caller didn't already set them.
    pub default_params: Vec<(&'static str, Value)>,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
    /// Set on providers that are recognized but not yet wired to a concrete
    /// `LLMClient` implementation (mirrors the source's `perplexity`
    /// placeholder).
    pub placeholder: bool,
}

impl ProviderConfig {
    fn new(timeout_seconds: u64) -> Self {
        Self {
            forbidden_params: vec!["max_tokens"],
            required_params: Vec::new(),
            default_params: Vec::new(),
            timeout_seconds,
            placeholder: false,
        }
    }
}

/// Resolve the full table of provider-level policies.
///
/// Grounded directly on `ProviderParameterManager.PROVIDER_CONFIGS`: the
/// `vertex_ai` entry additionally requires permissive safety settings
/// (political/rhetorical analysis corpora routinely trip default content
/// filters), and `perplexity` is carried as an unimplemented placeholder.
fn provider_configs() -> HashMap<&'static str, ProviderConfig> {
    let mut configs = HashMap::new();

    let mut vertex = ProviderConfig::new(180);
    vertex.required_params.push((
        "safety_settings",
        serde_json::json!([
            {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"},
            {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE"},
            {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE"},
            {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE"},
        ]),
    ));
    configs.insert("vertex_ai", vertex);

    configs.insert("openai", ProviderConfig::new(120));
    configs.insert("anthropic", ProviderConfig::new(120));
    configs.insert("mistral", ProviderConfig::new(120));

    let mut perplexity = ProviderConfig::new(120);
    perplexity.placeholder = true;
    configs.insert("perplexity", perplexity);

    configs.insert("ollama", ProviderConfig::new(600));

    configs
}

/// Model-specific overrides, checked before falling back to the
/// provider-level policy (§4.2: "Model-specific overrides take precedence").
fn model_specific_configs() -> HashMap<&'static str, ProviderConfig> {
    let mut configs = HashMap::new();
    configs.insert("ollama/llama3.2", ProviderConfig::new(600));

    let mut mistral = ProviderConfig::new(120);
    mistral.placeholder = false;
    configs.insert("ollama/mistral", mistral);

    configs.insert("ollama/llama3.3", ProviderConfig::new(600));
    configs
}

/// Centralized provider-parameter policy lookup and cleaning.
pub struct ProviderParameterManager {
    providers: HashMap<&'static str, ProviderConfig>,
    models: HashMap<&'static str, ProviderConfig>,
}

impl ProviderParameterManager {
    pub fn new() -> Self {
        Self {
            providers: provider_configs(),
            models: model_specific_configs(),
        }
    }

    /// Resolve a provider tag from a model name. Model-specific entries are
    /// checked first; otherwise the provider is detected from a prefix or
    /// substring match. Unknown models resolve to `"unknown"`.
    pub fn provider_from_model(&self, model_name: &str) -> String {
        if let Some(cfg) = self.models.get(model_name) {
            let _ = cfg;
            return "ollama".to_string();
        }

        let lower = model_name.to_lowercase();
        if lower.starts_with("vertex_ai/") {
            "vertex_ai".to_string()
        } else if lower.starts_with("ollama/") {
            "ollama".to_string()
        } else if ["gpt", "openai", "o1", "o3", "o4"]
            .iter()
            .any(|tag| lower.contains(tag))
        {
            "openai".to_string()
        } else if ["claude", "anthropic"].iter().any(|tag| lower.contains(tag)) {
            "anthropic".to_string()
        } else if ["mistral", "codestral"].iter().any(|tag| lower.contains(tag)) {
            "mistral".to_string()
        } else if ["gemini", "google"].iter().any(|tag| lower.contains(tag)) {
            // Gemini defaults to Vertex AI per the source; a direct
            // Google AI Studio key is a distinct, non-default path.
            "vertex_ai".to_string()
        } else if lower.contains("perplexity") {
            "perplexity".to_string()
        } else {
            warn!(model = %model_name, "unknown provider for model");
            "unknown".to_string()
        }
    }

    fn config_for(&self, model_name: &str) -> Option<&ProviderConfig> {
        if let Some(cfg) = self.models.get(model_name) {
            return Some(cfg);
        }
        let provider = self.provider_from_model(model_name);
        self.providers.get(provider.as_str())
    }

    /// Clean caller-supplied parameters per §4.2's
    /// `merge(default, caller_without_forbidden, required)`, logging every
    /// parameter removed or overridden (a documented source of silent
    /// failures upstream).
    pub fn clean_parameters(&self, model_name: &str, base_params: &Value) -> Value {
        let mut clean = base_params.as_object().cloned().unwrap_or_default();

        let Some(config) = self.config_for(model_name) else {
            return Value::Object(clean);
        };

        for param in &config.forbidden_params {
            if let Some(removed) = clean.remove(*param) {
                info!(model = %model_name, param, value = %removed, "removed forbidden parameter");
            }
        }

        for (param, value) in &config.required_params {
            clean.insert((*param).to_string(), value.clone());
            debug!(model = %model_name, param, "added required parameter");
        }

        for (param, value) in &config.default_params {
            clean
                .entry((*param).to_string())
                .or_insert_with(|| value.clone());
        }

        clean.insert(
            "timeout".to_string(),
            serde_json::json!(config.timeout_seconds),
        );

        Value::Object(clean)
    }

    /// Timeout to apply for a model's HTTP calls.
    pub fn timeout_for_model(&self, model_name: &str) -> u64 {
        self.config_for(model_name)
            .map(|c| c.timeout_seconds)
            .unwrap_or(60)
    }

    /// Whether a resolved provider tag is wired to a concrete client rather
    /// than carried as a placeholder (mirrors `perplexity`'s `status`).
    pub fn is_provider_supported(&self, provider: &str) -> bool {
        self.providers
            .get(provider)
            .map(|c| !c.placeholder)
            .unwrap_or(false)
    }
}

impl Default for ProviderParameterManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_detection() {
        let mgr = ProviderParameterManager::new();
        assert_eq!(mgr.provider_from_model("claude-3-5-sonnet-20241022"), "anthropic");
        assert_eq!(mgr.provider_from_model("gpt-4o"), "openai");
        assert_eq!(mgr.provider_from_model("vertex_ai/gemini-2.0-flash"), "vertex_ai");
        assert_eq!(mgr.provider_from_model("gemini-1.5-pro"), "vertex_ai");
        assert_eq!(mgr.provider_from_model("ollama/llama3.2"), "ollama");
        assert_eq!(mgr.provider_from_model("something-else"), "unknown");
    }

    #[test]
    fn test_forbidden_param_removed() {
        let mgr = ProviderParameterManager::new();
        let base = serde_json::json!({"max_tokens": 4096, "temperature": 0.2});
        let clean = mgr.clean_parameters("claude-3-5-sonnet-20241022", &base);
        assert!(clean.get("max_tokens").is_none());
        assert_eq!(clean["temperature"], 0.2);
        assert_eq!(clean["timeout"], 120);
    }

    #[test]
    fn test_vertex_required_safety_settings_always_applied() {
        let mgr = ProviderParameterManager::new();
        let base = serde_json::json!({"safety_settings": "caller-value"});
        let clean = mgr.clean_parameters("vertex_ai/gemini-2.0-flash", &base);
        assert_ne!(clean["safety_settings"], serde_json::json!("caller-value"));
        assert!(clean["safety_settings"].is_array());
    }

    #[test]
    fn test_model_specific_overrides_provider(){
        let mgr = ProviderParameterManager::new();
        assert_eq!(mgr.timeout_for_model("ollama/mistral"), 120);
        assert_eq!(mgr.timeout_for_model("ollama/llama3.2"), 600);
    }

    /// Idempotence (L3): cleaning parameters twice yields the same result.
    #[test]
    fn test_clean_parameters_idempotent() {
        let mgr = ProviderParameterManager::new();
        let base = serde_json::json!({"max_tokens": 100, "temperature": 0.5});
        let once = mgr.clean_parameters("gpt-4o", &base);
        let twice = mgr.clean_parameters("gpt-4o", &once);
        assert_eq!(once, twice);
    }
}
