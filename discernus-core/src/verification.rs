//! Verification Agent (§4.7).
//!
//! Adversarially re-executes a prior analysis using a model from a
//! *different* provider family than the one that produced it, then combines
//! two independent signals into one verdict: the verifier's own stated
//! success/failure, and a deterministic numeric-tolerance check (2%
//! relative or 0.01 absolute, whichever is looser) between the verifier's
//! re-derived metrics and the analysis's claimed ones. Both must agree for
//! the attestation to succeed — a verifier that says "looks right" while
//! its own numbers drift outside tolerance does not get the benefit of the
//! doubt.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::artifact::{AnalysisResult, ArtifactId, ArtifactType, Attestation, Work};
use crate::cas::ContentStore;
use crate::error::{Error, Result};
use crate::llm::gateway::LLMGateway;
use crate::llm::types::{ChatMessage, CompletionRequest};
use crate::provider_params::ProviderParameterManager;
use crate::prompt::{encode_document_payload, verification_prompt_template, PromptLibrary};
use crate::schemas::{tool_definition, validate_tool_arguments};

const TEMPLATE_NAME: &str = "verification";
const TOOL_NAME: &str = "record_attestation";

const RELATIVE_TOLERANCE: f64 = 0.02;
const ABSOLUTE_TOLERANCE: f64 = 0.01;

pub struct VerificationAgent {
    store: Arc<ContentStore>,
    gateway: Arc<LLMGateway>,
    prompts: PromptLibrary,
    providers: ProviderParameterManager,
}

impl VerificationAgent {
    pub fn new(store: Arc<ContentStore>, gateway: Arc<LLMGateway>) -> Result<Self> {
        let mut prompts = PromptLibrary::new();
        prompts.register(
            TEMPLATE_NAME,
            verification_prompt_template(),
            vec!["framework_name", "claimed_scores", "document_b64"],
        )?;
        Ok(Self {
            store,
            gateway,
            prompts,
            providers: ProviderParameterManager::new(),
        })
    }

    /// Re-execute and adjudicate one analysis. Returns the stored
    /// attestation's hash; callers decide whether to fail the run on a
    /// failed attestation (§4.7/§5: fail-fast).
    pub async fn verify_analysis(
        &self,
        analysis_hash: &ArtifactId,
        document_text: &str,
        framework_name: &str,
        verifier_model: &str,
    ) -> Result<ArtifactId> {
        let analysis: AnalysisResult = self.store.get(ArtifactType::AnalysisResult, analysis_hash)?;
        let work: Work = self.store.get(ArtifactType::Work, &self.work_hash_for(analysis_hash)?)?;

        if self.providers.provider_from_model(verifier_model)
            == self.providers.provider_from_model(&analysis.model)
        {
            warn!(
                analysis_model = %analysis.model,
                verifier_model,
                "verifier model is the same provider family as the analysis model"
            );
        }

        let claimed_scores = analysis
            .scores
            .iter()
            .map(|(name, s)| format!("{}: raw={:.3} salience={:.3} confidence={:.3}", name, s.raw, s.salience, s.confidence))
            .collect::<Vec<_>>()
            .join("\n");
        let claimed_work = format!("code:\n{}\n\nclaimed_output:\n{}", work.code, work.claimed_output);

        let mut ctx = HashMap::new();
        ctx.insert("framework_name".to_string(), framework_name.to_string());
        ctx.insert("claimed_scores".to_string(), claimed_scores);
        ctx.insert("claimed_work".to_string(), claimed_work);
        ctx.insert("document_b64".to_string(), encode_document_payload(document_text));

        let rendered = self.prompts.render(TEMPLATE_NAME, &ctx)?;

        let request = CompletionRequest::new()
            .with_model(verifier_model)
            .with_system("You are an adversarial auditor re-deriving another analyst's scores independently.")
            .with_message(ChatMessage::user(rendered))
            .with_temperature(0.0)
            .with_tool(tool_definition(TOOL_NAME).expect("tool schema registered"));

        let gateway_response = self.gateway.complete(request, None).await?;
        let response = gateway_response.response;

        let call = response
            .tool_calls
            .iter()
            .find(|c| c.name == TOOL_NAME)
            .ok_or_else(|| Error::parse_failure(verifier_model, "no record_attestation tool call returned"))?;
        validate_tool_arguments(TOOL_NAME, &call.arguments)?;

        let verifier_success = call
            .arguments
            .get("success")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| Error::parse_failure(verifier_model, "missing success field"))?;
        let reasoning = call
            .arguments
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let re_execution_output: Option<HashMap<String, f64>> = call
            .arguments
            .get("re_execution_output")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
                    .collect()
            });

        let numeric_check_passed = match &re_execution_output {
            Some(derived) => within_tolerance(derived, &analysis.derived_metrics),
            None => true,
        };

        let attestation = Attestation {
            target_analysis_hash: analysis_hash.clone(),
            target_work_hash: self.work_hash_for(analysis_hash)?,
            success: verifier_success && numeric_check_passed,
            verifier_model: verifier_model.to_string(),
            reasoning,
            re_execution_output,
            numeric_check_passed,
        };

        let attestation_hash = self.store.put(
            ArtifactType::Attestation,
            &attestation,
            vec![analysis_hash.clone(), attestation.target_work_hash.clone()],
        )?;

        Ok(attestation_hash)
    }

    fn work_hash_for(&self, analysis_hash: &ArtifactId) -> Result<ArtifactId> {
        let meta = self.store.metadata(ArtifactType::AnalysisResult, analysis_hash)?;
        meta.tags
            .get("work_hash")
            .cloned()
            .ok_or_else(|| Error::Internal("analysis missing work_hash tag".into()))
    }
}

/// Every re-derived metric must fall within 2% relative or 0.01 absolute
/// tolerance (whichever is looser) of the claimed value. A metric the
/// verifier didn't re-derive is not penalized.
fn within_tolerance(derived: &HashMap<String, f64>, claimed: &std::collections::BTreeMap<String, f64>) -> bool {
    for (key, derived_value) in derived {
        if let Some(claimed_value) = claimed.get(key) {
            let abs_diff = (derived_value - claimed_value).abs();
            let rel_tolerance = claimed_value.abs() * RELATIVE_TOLERANCE;
            let tolerance = rel_tolerance.max(ABSOLUTE_TOLERANCE);
            if abs_diff > tolerance {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_tolerance_accepts_small_drift() {
        let mut derived = HashMap::new();
        derived.insert("mean_raw".to_string(), 0.502);
        let mut claimed = std::collections::BTreeMap::new();
        claimed.insert("mean_raw".to_string(), 0.5);
        assert!(within_tolerance(&derived, &claimed));
    }

    #[test]
    fn test_within_tolerance_rejects_large_drift() {
        let mut derived = HashMap::new();
        derived.insert("mean_raw".to_string(), 0.65);
        let mut claimed = std::collections::BTreeMap::new();
        claimed.insert("mean_raw".to_string(), 0.5);
        assert!(!within_tolerance(&derived, &claimed));
    }

    #[test]
    fn test_within_tolerance_ignores_unmatched_keys() {
        let mut derived = HashMap::new();
        derived.insert("unrelated".to_string(), 99.0);
        let claimed = std::collections::BTreeMap::new();
        assert!(within_tolerance(&derived, &claimed));
    }
}
