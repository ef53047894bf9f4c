//! Process-wide configuration (§1.1 ambient stack / §6 environment inputs).
//!
//! Loaded from environment variables and, optionally, a TOML file whose
//! values act as defaults under whatever the environment sets. Construction
//! fails closed: a missing API key for a selected provider is a [`Error::Config`],
//! never a panic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::integrity::QualityThresholds;

/// Per-provider credentials and location fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Vertex AI / GCP-style project id, when the provider needs one.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Vertex AI / GCP-style region, when the provider needs one.
    #[serde(default)]
    pub location: Option<String>,
    /// Local-provider base URL override (e.g. an Ollama host).
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Process-wide configuration for a Discernus run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Per-provider tag (`anthropic`, `openai`, `vertex_ai`, `ollama`, ...) credentials.
    #[serde(default)]
    pub providers: HashMap<String, ProviderCredentials>,

    /// Daily accumulated-cost cap enforced by the Gateway (§4.3).
    #[serde(default = "default_daily_budget_usd")]
    pub daily_budget_usd: f64,

    /// Root directory for the content-addressed store (§4.1).
    #[serde(default = "default_cas_root")]
    pub cas_root: String,

    /// Default models tried in order absent an explicit experiment selection.
    #[serde(default = "default_models")]
    pub default_models: Vec<String>,

    /// Model used for verification when the experiment config doesn't name
    /// one; must be a different model family than the analysis model (§4.7).
    #[serde(default = "default_verifier_model")]
    pub default_verifier_model: String,

    /// Whether fallback-model routing after a safety-filter block is
    /// permitted at all (§9 open question — defaults to allowed).
    #[serde(default = "default_true")]
    pub allow_fallback_models: bool,

    /// Quality pre-flight thresholds (§4.11), overridable per-experiment.
    #[serde(default)]
    pub quality_thresholds: QualityThresholds,

    /// Maximum concurrent (document, model) worker tasks (§5).
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

fn default_daily_budget_usd() -> f64 {
    25.0
}

fn default_cas_root() -> String {
    "./cas".to_string()
}

fn default_models() -> Vec<String> {
    vec!["claude-3-5-sonnet-20241022".to_string()]
}

fn default_verifier_model() -> String {
    "gpt-4o".to_string()
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            daily_budget_usd: default_daily_budget_usd(),
            cas_root: default_cas_root(),
            default_models: default_models(),
            default_verifier_model: default_verifier_model(),
            allow_fallback_models: default_true(),
            quality_thresholds: QualityThresholds::default(),
            max_concurrency: default_concurrency(),
        }
    }
}

impl Config {
    /// Load defaults from an optional TOML file, then overlay environment
    /// variables, then validate. Environment always wins over the file.
    pub fn load(toml_path: Option<&Path>) -> Result<Self> {
        let mut config = match toml_path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)
                    .map_err(|e| Error::Config(format!("invalid config file {:?}: {}", path, e)))?
            }
            _ => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        for provider in ["anthropic", "openai", "vertex_ai", "ollama", "mistral", "google"] {
            let env_var = format!("DISCERNUS_{}_API_KEY", provider.to_uppercase());
            if let Ok(key) = std::env::var(&env_var) {
                self.providers.entry(provider.to_string()).or_default().api_key = Some(key);
            }
        }

        if let Ok(project) = std::env::var("DISCERNUS_VERTEX_AI_PROJECT") {
            self.providers
                .entry("vertex_ai".to_string())
                .or_default()
                .project_id = Some(project);
        }
        if let Ok(location) = std::env::var("DISCERNUS_VERTEX_AI_LOCATION") {
            self.providers
                .entry("vertex_ai".to_string())
                .or_default()
                .location = Some(location);
        }
        if let Ok(base_url) = std::env::var("DISCERNUS_OLLAMA_BASE_URL") {
            self.providers.entry("ollama".to_string()).or_default().base_url = Some(base_url);
        }

        if let Ok(budget) = std::env::var("DISCERNUS_DAILY_BUDGET_USD") {
            if let Ok(parsed) = budget.parse() {
                self.daily_budget_usd = parsed;
            }
        }
        if let Ok(root) = std::env::var("DISCERNUS_CAS_ROOT") {
            self.cas_root = root;
        }
    }

    /// Fail closed on an invalid configuration rather than surfacing a
    /// confusing panic deep inside a pipeline stage.
    fn validate(&self) -> Result<()> {
        if self.daily_budget_usd <= 0.0 {
            return Err(Error::Config(
                "daily_budget_usd must be positive".to_string(),
            ));
        }
        if self.cas_root.trim().is_empty() {
            return Err(Error::Config("cas_root must not be empty".to_string()));
        }
        if self.default_models.is_empty() {
            return Err(Error::Config(
                "default_models must name at least one model".to_string(),
            ));
        }
        Ok(())
    }

    /// Credentials for a provider tag, if configured.
    pub fn credentials(&self, provider: &str) -> Option<&ProviderCredentials> {
        self.providers.get(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_budget() {
        let mut config = Config::default();
        config.daily_budget_usd = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/discernus.toml"))).unwrap();
        assert_eq!(config.cas_root, default_cas_root());
    }
}
