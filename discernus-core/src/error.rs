//! Error types for discernus-core.
//!
//! One enum covers the whole pipeline so callers can match on failure kind
//! without downcasting; each variant documents its propagation policy in the
//! component that raises it rather than here.

use thiserror::Error;

/// Result type alias using discernus-core's `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running an experiment.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP 5xx, timeout, or connection failure. Retried with backoff inside
    /// the Gateway; only surfaced once retries are exhausted.
    #[error("transient network error calling {provider}: {message}")]
    TransientNetworkError { provider: String, message: String },

    /// Provider returned 429. The Gateway honours `retry_after` and queues
    /// the call rather than surfacing this to the caller, except as a last
    /// resort after repeated limiting.
    #[error("rate limited by {provider}, retry after {retry_after_ms:?}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: Option<u64>,
    },

    /// Provider refused the request (safety filter). Triggers fallback-model
    /// routing if one is configured for the primary model.
    #[error("safety filter blocked request to {model}")]
    SafetyFilterBlocked { model: String },

    /// Structured output could not be parsed by any cascade strategy, or
    /// failed post-parse validation.
    #[error("failed to parse structured output from {model}: {reason}")]
    ParseFailure { model: String, reason: String },

    /// The Verification Agent's attestation did not succeed. Fatal for the
    /// whole experiment (fail-fast, §4.7/§5).
    #[error("verification failed for analysis {analysis_id}: {reason}")]
    VerificationFailed { analysis_id: String, reason: String },

    /// Pre-flight or mid-run cost cap exceeded. Fatal for the experiment.
    #[error("budget exceeded: accumulated {accumulated_usd:.4} + estimate {estimate_usd:.4} > limit {limit_usd:.4}")]
    BudgetExceeded {
        accumulated_usd: f64,
        estimate_usd: f64,
        limit_usd: f64,
    },

    /// Framework, data, or quality pre-flight validation failed.
    #[error("transaction integrity violation in {domain}: {failed_checks:?}")]
    TransactionIntegrityError {
        domain: String,
        failed_checks: Vec<String>,
        guidance: Vec<String>,
    },

    /// Stored bytes no longer hash to their artifact id. Fatal; marks the
    /// CAS suspect.
    #[error("integrity violation: artifact {id} no longer hashes to its id")]
    IntegrityViolation { id: String },

    /// An artifact or referenced file could not be found. Fatal; the
    /// pipeline cannot continue without it.
    #[error("not found: {0}")]
    NotFound(String),

    /// A synthesis step cited a quote classified as hallucinated even after
    /// one corrective retry (§4.10 open-question resolution).
    #[error("hallucination detected in synthesis step {step}: quote {quote:?}")]
    HallucinationDetected { step: String, quote: String },

    /// The CAS backing store is unavailable (disk full, permissions). The
    /// caller may retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Missing or invalid configuration (API keys, budget, paths). Fatal at
    /// startup, before any pipeline stage runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// LLM API error not otherwise classified above.
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// Template rendering failed (unbound slot, malformed template).
    #[error("prompt render error: {0}")]
    PromptRender(String),

    /// Tool-call arguments did not validate against their declared schema.
    #[error("schema validation failed for {schema}: {reason}")]
    SchemaValidation { schema: String, reason: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation; should not occur in correct operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Construct a [`Error::TransientNetworkError`].
    pub fn transient_network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientNetworkError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Construct a [`Error::RateLimited`].
    pub fn rate_limited(provider: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            retry_after_ms,
        }
    }

    /// Construct a [`Error::ParseFailure`].
    pub fn parse_failure(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseFailure {
            model: model.into(),
            reason: reason.into(),
        }
    }

    /// Construct a [`Error::VerificationFailed`].
    pub fn verification_failed(analysis_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VerificationFailed {
            analysis_id: analysis_id.into(),
            reason: reason.into(),
        }
    }

    /// Construct a [`Error::TransactionIntegrityError`].
    pub fn transaction_integrity(
        domain: impl Into<String>,
        failed_checks: Vec<String>,
        guidance: Vec<String>,
    ) -> Self {
        Self::TransactionIntegrityError {
            domain: domain.into(),
            failed_checks,
            guidance,
        }
    }

    /// Construct a [`Error::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Construct a [`Error::LlmApi`].
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether this error kind is worth retrying by the Gateway's backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetworkError { .. } | Self::RateLimited { .. } | Self::StorageUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::transient_network("anthropic", "timeout").is_retryable());
        assert!(Error::rate_limited("openai", Some(1000)).is_retryable());
        assert!(!Error::verification_failed("abc", "mismatch").is_retryable());
        assert!(!Error::Config("missing key".into()).is_retryable());
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("framework_spec abc123");
        assert!(err.to_string().contains("framework_spec abc123"));
    }
}
