//! # discernus-core
//!
//! The experiment execution core of Discernus: an orchestrator that drives
//! per-document LLM analysis, adversarial verification, knowledge indexing,
//! statistics, and multi-step narrative synthesis over a content-addressed
//! artifact store.
//!
//! ## Core components
//!
//! - [`cas`] — the content-addressable artifact store (§4.1)
//! - [`provider_params`] — per-provider call-parameter policy (§4.2)
//! - [`llm`] — the provider-agnostic Gateway: rate limiting, retries,
//!   fallback routing, cost accounting (§4.3)
//! - [`prompt`] — deterministic prompt rendering (§4.4)
//! - [`schemas`] — tool-call JSON-schema registry (§4.4)
//! - [`parser`] — the fallback response-parsing cascade (§4.5)
//! - [`analysis`] — the Analysis Agent (§4.6)
//! - [`verification`] — the Verification Agent (§4.7)
//! - [`statistics`] — the Statistical Processor (§4.8)
//! - [`knowledge_index`] — the hybrid semantic/text Knowledge Index (§4.9)
//! - [`synthesis`] — the Sequential Synthesis Agent (§4.10)
//! - [`integrity`] — the Transaction Integrity Manager (§4.11)
//! - [`orchestrator`] — binds every component into one execution plan (§4.12)

pub mod analysis;
pub mod artifact;
pub mod cas;
pub mod config;
pub mod error;
pub mod integrity;
pub mod knowledge_index;
pub mod llm;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod provider_params;
pub mod schemas;
pub mod statistics;
pub mod synthesis;
pub mod verification;

pub use analysis::{AnalysisAgent, AnalysisOutcome};
pub use artifact::{
    ArtifactId, ArtifactType, Attestation, AuditEvent, CorpusDocument, DimensionScore,
    EvidenceQuote, ExperimentConfig, FallbackUsed, FinalReport, FrameworkSpec, Hypothesis,
    StatField, SynthesisStep, Work,
};
pub use cas::{ArtifactMetadata, ContentStore};
pub use config::{Config, ProviderCredentials};
pub use error::{Error, Result};
pub use integrity::{
    validate_data, validate_framework, validate_quality, FailedCheck, IntegrityReport,
    QualityInputs, QualityThresholds, QualityValidationResult,
};
pub use knowledge_index::{
    ContentType, DriftLevel, Embedder, Hit, KnowledgeIndex, QueryFilters, QuoteValidation,
};
pub use llm::{
    AnthropicClient, ChatMessage, ClientConfig, CompletionRequest, CompletionResponse,
    CostTracker, LLMClient, LLMGateway, ModelSpec, MultiProviderClient, Provider,
};
pub use orchestrator::{CancellationToken, Orchestrator, RunManifest, RunOutcome};
pub use parser::{parse_response, ParsedScores};
pub use prompt::PromptLibrary;
pub use provider_params::ProviderParameterManager;
pub use schemas::{schema_for, tool_definition, validate_tool_arguments};
pub use statistics::{StatisticalProcessor, Statistics};
pub use synthesis::{SequentialSynthesisAgent, SynthesisInputs, SynthesisOutcome};
pub use verification::VerificationAgent;
