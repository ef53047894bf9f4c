//! The data model (§3): typed artifacts, their obligatory fields, and the
//! hashing convention that makes the provenance DAG verifiable.
//!
//! Every artifact is modeled as a tagged variant with an explicit schema
//! rather than a dynamically typed map — parsing raw LLM text remains
//! boundary code (see [`crate::parser`]), but everything inside the core
//! is strongly typed from here on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content-address: the lowercase hex SHA-256 digest of an artifact's
/// canonical serialized bytes (I1).
pub type ArtifactId = String;

/// Compute the content-address of a byte string.
pub fn hash_bytes(bytes: &[u8]) -> ArtifactId {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute the content-address of a value's canonical JSON serialization.
pub fn hash_value<T: Serialize>(value: &T) -> crate::error::Result<ArtifactId> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Discriminates the artifact types named in §3. Used as the CAS's
/// top-level directory and as a metadata filter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    CorpusDocument,
    FrameworkSpec,
    ExperimentConfig,
    AnalysisResult,
    Work,
    Attestation,
    Statistics,
    SynthesisStep,
    FinalReport,
    AuditEvent,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CorpusDocument => "corpus_document",
            Self::FrameworkSpec => "framework_spec",
            Self::ExperimentConfig => "experiment_config",
            Self::AnalysisResult => "analysis_result",
            Self::Work => "work",
            Self::Attestation => "attestation",
            Self::Statistics => "statistics",
            Self::SynthesisStep => "synthesis_step",
            Self::FinalReport => "final_report",
            Self::AuditEvent => "audit_event",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A raw document from the corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusDocument {
    pub document_id: String,
    pub filename: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One scoring dimension declared by a framework.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub description: String,
    /// e.g. "0.0-1.0" or a human-readable description of the scale.
    #[serde(default)]
    pub scale: String,
}

/// A versioned framework definition (§6 External Interfaces).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkSpec {
    pub name: String,
    pub version: String,
    pub dimensions: Vec<Dimension>,
}

impl FrameworkSpec {
    pub fn dimension_names(&self) -> Vec<&str> {
        self.dimensions.iter().map(|d| d.name.as_str()).collect()
    }
}

/// A named, statable hypothesis under test (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub name: String,
    pub statement: String,
}

/// Per-experiment overrides of the default quality thresholds (§4.11).
pub type ThresholdOverrides = std::collections::HashMap<String, f64>;

/// The experiment definition that roots the provenance DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub framework_ref: String,
    pub corpus_ref: String,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub hypotheses: Vec<Hypothesis>,
    #[serde(default = "default_analysis_mode")]
    pub analysis_mode: String,
    pub selected_models: Vec<String>,
    #[serde(default)]
    pub thresholds: ThresholdOverrides,
}

fn default_analysis_mode() -> String {
    "single_model".to_string()
}

/// One scored dimension on one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionScore {
    pub raw: f64,
    pub salience: f64,
    pub confidence: f64,
}

/// A verbatim citation attributed to a dimension (§4.6/§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceQuote {
    pub dimension: String,
    pub quote: String,
    pub source: String,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Per-(document × framework × model) scoring payload (I2, I3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub document_id: String,
    pub document_hash: ArtifactId,
    pub framework_hash: ArtifactId,
    pub model: String,
    pub scores: std::collections::BTreeMap<String, DimensionScore>,
    #[serde(default)]
    pub derived_metrics: std::collections::BTreeMap<String, f64>,
    #[serde(default)]
    pub evidence: Vec<EvidenceQuote>,
    /// Set when this analysis was produced on a fallback model after the
    /// primary model was safety-filter-blocked (§9, B4).
    #[serde(default)]
    pub fallback_used: Option<FallbackUsed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackUsed {
    pub primary: String,
    pub fallback: String,
    pub reason: String,
}

impl AnalysisResult {
    /// P3: every score component is in [0,1].
    pub fn scores_in_range(&self) -> bool {
        self.scores.values().all(|s| {
            (0.0..=1.0).contains(&s.raw)
                && (0.0..=1.0).contains(&s.salience)
                && (0.0..=1.0).contains(&s.confidence)
        })
    }

    /// P2: the analysis's dimension set exactly equals the framework's.
    pub fn dimensions_match_framework(&self, framework: &FrameworkSpec) -> bool {
        let mut analysis_dims: Vec<&str> = self.scores.keys().map(|s| s.as_str()).collect();
        let mut framework_dims = framework.dimension_names();
        analysis_dims.sort_unstable();
        framework_dims.sort_unstable();
        analysis_dims == framework_dims
    }
}

/// The code the scoring LLM claims to have executed, plus its claimed output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub code: String,
    pub claimed_output: String,
}

/// The Verification Agent's sealed pass/fail judgement on one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub target_analysis_hash: ArtifactId,
    pub target_work_hash: ArtifactId,
    pub success: bool,
    pub verifier_model: String,
    pub reasoning: String,
    #[serde(default)]
    pub re_execution_output: Option<std::collections::HashMap<String, f64>>,
    /// Whether the numeric tolerance check (§4.7 open-question resolution)
    /// independently agreed with the verifier's own verdict.
    pub numeric_check_passed: bool,
}

/// A single field in the `statistics` artifact: either a computed value or
/// an explicit insufficient-sample error leaf (I4, P5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatField<T> {
    Value(T),
    Error {
        error: String,
        sample_size: usize,
        minimum_required: usize,
        recommendation: String,
    },
}

impl<T> StatField<T> {
    pub fn insufficient(sample_size: usize, minimum_required: usize, what: &str) -> Self {
        Self::Error {
            error: format!("insufficient sample size for {}", what),
            sample_size,
            minimum_required,
            recommendation: format!(
                "collect at least {} documents (have {}) before requesting {}",
                minimum_required, sample_size, what
            ),
        }
    }
}

/// One synthesis pipeline stage's output, including its own audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisStep {
    pub step_name: String,
    pub queries: Vec<String>,
    pub retrieval_hits: Vec<serde_json::Value>,
    pub output: String,
}

/// The terminal narrative artifact (I5: only emitted when every referenced
/// analysis has a successful attestation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub narrative: String,
    pub referenced_analysis_hashes: Vec<ArtifactId>,
    pub statistics_hash: ArtifactId,
    pub synthesis_step_hashes: Vec<ArtifactId>,
}

/// A time-ordered record of a pipeline decision, cost, or error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(kind: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            kind: kind.into(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let a = hash_bytes(b"hello");
        let b = hash_bytes(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_scores_in_range() {
        let mut scores = std::collections::BTreeMap::new();
        scores.insert(
            "populism".to_string(),
            DimensionScore {
                raw: 0.5,
                salience: 0.8,
                confidence: 0.9,
            },
        );
        let result = AnalysisResult {
            document_id: "doc1".into(),
            document_hash: "abc".into(),
            framework_hash: "def".into(),
            model: "claude".into(),
            scores,
            derived_metrics: Default::default(),
            evidence: Vec::new(),
            fallback_used: None,
        };
        assert!(result.scores_in_range());
    }

    #[test]
    fn test_dimensions_match_framework() {
        let framework = FrameworkSpec {
            name: "F".into(),
            version: "1".into(),
            dimensions: vec![Dimension {
                name: "populism".into(),
                description: "".into(),
                scale: "".into(),
            }],
        };
        let mut scores = std::collections::BTreeMap::new();
        scores.insert(
            "populism".to_string(),
            DimensionScore {
                raw: 0.1,
                salience: 0.1,
                confidence: 0.1,
            },
        );
        let result = AnalysisResult {
            document_id: "doc1".into(),
            document_hash: "abc".into(),
            framework_hash: "def".into(),
            model: "claude".into(),
            scores,
            derived_metrics: Default::default(),
            evidence: Vec::new(),
            fallback_used: None,
        };
        assert!(result.dimensions_match_framework(&framework));
    }
}
