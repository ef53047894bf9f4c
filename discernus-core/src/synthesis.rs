//! Sequential Synthesis Agent (§4.10).
//!
//! Five fixed LLM passes — hypothesis testing, anomaly investigation,
//! pattern discovery, framework-fit assessment, final integration — each
//! built from retrieval-augmented context pulled from the
//! [`crate::knowledge_index::KnowledgeIndex`]. Query generation is itself a
//! structured `generate_queries` tool call; retrieved evidence is capped by
//! an evidence budget (top-k per query, a hard total-token ceiling, excess
//! truncated with a `"[additional evidence omitted]"` sentinel) so a large
//! corpus can't blow out a synthesis prompt.
//!
//! Every synthesized narrative is scanned for quoted spans and each one is
//! run through `validate_quote`; a hallucinated quote triggers one retry of
//! that step with an injected correction instruction, and a second
//! hallucination fails the whole experiment with
//! [`crate::error::Error::HallucinationDetected`] (§9 open-question
//! resolution, S4).

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use crate::artifact::{ArtifactId, ArtifactType, ExperimentConfig, FinalReport, SynthesisStep};
use crate::cas::ContentStore;
use crate::error::{Error, Result};
use crate::knowledge_index::{ContentType, DriftLevel, Hit, KnowledgeIndex, QueryFilters};
use crate::llm::gateway::LLMGateway;
use crate::llm::types::{ChatMessage, CompletionRequest};
use crate::prompt::PromptLibrary;
use crate::schemas::{tool_definition, validate_tool_arguments};
use crate::statistics::Statistics;

const TOP_K_PER_QUERY: usize = 5;
const MAX_EVIDENCE_WORDS: usize = 1500;
const OMITTED_SENTINEL: &str = "[additional evidence omitted]";
const QUERY_TOOL: &str = "generate_queries";

const STEP_HYPOTHESIS: &str = "hypothesis_testing";
const STEP_ANOMALY: &str = "anomaly_investigation";
const STEP_PATTERN: &str = "pattern_discovery";
const STEP_FRAMEWORK_FIT: &str = "framework_fit_assessment";
const STEP_FINAL: &str = "final_integration";

/// Everything the five-step pipeline needs that isn't already in the CAS.
pub struct SynthesisInputs<'a> {
    pub experiment: &'a ExperimentConfig,
    pub statistics: &'a Statistics,
    pub statistics_hash: &'a ArtifactId,
    pub index: &'a KnowledgeIndex,
    /// Analysis hashes eligible for citation: every one of these must
    /// already carry a successful attestation (I5) — enforced by the
    /// orchestrator before this pipeline is invoked, not re-checked here.
    pub attested_analysis_hashes: &'a [ArtifactId],
    pub model: &'a str,
}

/// Output of the full pipeline: the five `synthesis_step` hashes in order,
/// and the terminal `final_report` hash.
pub struct SynthesisOutcome {
    pub step_hashes: Vec<ArtifactId>,
    pub final_report_hash: ArtifactId,
}

pub struct SequentialSynthesisAgent {
    store: Arc<ContentStore>,
    gateway: Arc<LLMGateway>,
    prompts: PromptLibrary,
}

impl SequentialSynthesisAgent {
    pub fn new(store: Arc<ContentStore>, gateway: Arc<LLMGateway>) -> Result<Self> {
        let mut prompts = PromptLibrary::new();
        prompts.register(
            "generate_queries",
            "Given the following synthesis context, generate focused retrieval queries.\n\n{{ context }}\n\nCall generate_queries with 3-6 queries.",
            vec!["context"],
        )?;
        prompts.register(
            "narrative",
            "{{ instructions }}\n\nContext:\n{{ context }}\n\nEvidence:\n{{ evidence }}",
            vec!["instructions", "context"],
        )?;
        prompts.register(
            "narrative_retry",
            "{{ instructions }}\n\nContext:\n{{ context }}\n\nEvidence:\n{{ evidence }}\n\nYour previous answer cited a quotation that does not appear verbatim in the supplied evidence: \"{{ bad_quote }}\". Answer again, using only quotations that appear verbatim in the evidence above.",
            vec!["instructions", "context", "bad_quote"],
        )?;
        Ok(Self {
            store,
            gateway,
            prompts,
        })
    }

    /// Run all five steps in order and produce the final report.
    pub async fn run(&self, inputs: &SynthesisInputs<'_>) -> Result<SynthesisOutcome> {
        let mut step_hashes = Vec::with_capacity(5);
        let mut step_outputs: HashMap<&str, String> = HashMap::new();
        let mut all_hits: Vec<Hit> = Vec::new();

        // Step 1: hypothesis testing.
        let hypothesis_context = inputs
            .experiment
            .hypotheses
            .iter()
            .map(|h| format!("{}: {}", h.name, h.statement))
            .collect::<Vec<_>>()
            .join("\n");
        let (hash, output, hits) = self
            .retrieval_step(
                STEP_HYPOTHESIS,
                &hypothesis_context,
                "Evaluate the degree to which the corpus evidence supports or contradicts each hypothesis below, citing verbatim evidence quotes.",
                inputs,
            )
            .await?;
        step_hashes.push(hash);
        step_outputs.insert(STEP_HYPOTHESIS, output);
        all_hits.extend(hits);

        // Step 2: anomaly investigation.
        let anomaly_context = summarize_outliers(inputs.statistics);
        let (hash, output, hits) = self
            .retrieval_step(
                STEP_ANOMALY,
                &anomaly_context,
                "Investigate the statistical anomalies below: find and cite the evidence that explains why these documents or metrics are outliers.",
                inputs,
            )
            .await?;
        step_hashes.push(hash);
        step_outputs.insert(STEP_ANOMALY, output);
        all_hits.extend(hits);

        // Step 3: pattern discovery.
        let pattern_context = summarize_patterns(inputs.statistics);
        let (hash, output, hits) = self
            .retrieval_step(
                STEP_PATTERN,
                &pattern_context,
                "Identify recurring patterns across the derived metrics below and cite the evidence supporting each pattern.",
                inputs,
            )
            .await?;
        step_hashes.push(hash);
        step_outputs.insert(STEP_PATTERN, output);
        all_hits.extend(hits);

        // Step 4: framework-fit assessment — statistics only, no retrieval.
        let fit_context = summarize_framework_fit(inputs.statistics);
        let fit_output = self
            .narrative_step(
                STEP_FRAMEWORK_FIT,
                "Based only on the statistics below, assess how well the scoring framework captured meaningful variation in this corpus.",
                &fit_context,
                "",
                inputs.model,
                inputs.index,
            )
            .await?;
        let fit_hash = self.store.put(
            ArtifactType::SynthesisStep,
            &SynthesisStep {
                step_name: STEP_FRAMEWORK_FIT.to_string(),
                queries: Vec::new(),
                retrieval_hits: Vec::new(),
                output: fit_output.clone(),
            },
            vec![inputs.statistics_hash.clone()],
        )?;
        step_hashes.push(fit_hash);
        step_outputs.insert(STEP_FRAMEWORK_FIT, fit_output);

        // Step 5: final integration.
        let aggregated_evidence = build_evidence_bundle(&all_hits);
        let integration_context = format!(
            "Hypothesis testing:\n{}\n\nAnomaly investigation:\n{}\n\nPattern discovery:\n{}\n\nFramework-fit assessment:\n{}",
            step_outputs[STEP_HYPOTHESIS],
            step_outputs[STEP_ANOMALY],
            step_outputs[STEP_PATTERN],
            step_outputs[STEP_FRAMEWORK_FIT],
        );
        let final_narrative = self
            .narrative_step(
                STEP_FINAL,
                "Integrate the four analyses below into one coherent narrative report on this experiment's findings.",
                &integration_context,
                &aggregated_evidence,
                inputs.model,
                inputs.index,
            )
            .await?;
        let final_step_hash = self.store.put(
            ArtifactType::SynthesisStep,
            &SynthesisStep {
                step_name: STEP_FINAL.to_string(),
                queries: Vec::new(),
                retrieval_hits: all_hits.iter().map(hit_to_json).collect(),
                output: final_narrative.clone(),
            },
            step_hashes.clone(),
        )?;
        step_hashes.push(final_step_hash);

        let final_report = FinalReport {
            narrative: final_narrative,
            referenced_analysis_hashes: inputs.attested_analysis_hashes.to_vec(),
            statistics_hash: inputs.statistics_hash.clone(),
            synthesis_step_hashes: step_hashes.clone(),
        };
        let mut parents = inputs.attested_analysis_hashes.to_vec();
        parents.push(inputs.statistics_hash.clone());
        parents.extend(step_hashes.iter().cloned());
        let final_report_hash = self.store.put(ArtifactType::FinalReport, &final_report, parents)?;

        Ok(SynthesisOutcome {
            step_hashes,
            final_report_hash,
        })
    }

    /// Generate queries via the `generate_queries` tool call.
    async fn generate_queries(&self, context: &str, model: &str) -> Result<Vec<String>> {
        let mut ctx = HashMap::new();
        ctx.insert("context".to_string(), context.to_string());
        let rendered = self.prompts.render("generate_queries", &ctx)?;

        let request = CompletionRequest::new()
            .with_model(model)
            .with_system("You generate focused retrieval queries for a research synthesis pipeline.")
            .with_message(ChatMessage::user(rendered))
            .with_temperature(0.0)
            .with_tool(tool_definition(QUERY_TOOL).expect("tool schema registered"));

        let gateway_response = self.gateway.complete(request, None).await?;
        let response = gateway_response.response;

        let call = response
            .tool_calls
            .iter()
            .find(|c| c.name == QUERY_TOOL)
            .ok_or_else(|| Error::parse_failure(model, "no generate_queries tool call returned"))?;
        validate_tool_arguments(QUERY_TOOL, &call.arguments)?;

        let queries = call
            .arguments
            .get("queries")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if queries.is_empty() {
            return Err(Error::parse_failure(model, "generate_queries returned an empty list"));
        }
        Ok(queries)
    }

    /// A step that queries the index first: generate queries, retrieve
    /// top-k hits per query under the evidence budget, then narrate.
    async fn retrieval_step(
        &self,
        step_name: &str,
        context: &str,
        instructions: &str,
        inputs: &SynthesisInputs<'_>,
    ) -> Result<(ArtifactId, String, Vec<Hit>)> {
        let queries = self.generate_queries(context, inputs.model).await?;

        let mut hits = Vec::new();
        for query in &queries {
            let query_hits = inputs.index.query(
                query,
                Some(&[ContentType::CorpusPassage, ContentType::EvidenceQuote]),
                &QueryFilters::default(),
                TOP_K_PER_QUERY,
            );
            hits.extend(query_hits);
        }

        let evidence = build_evidence_bundle(&hits);
        let output = self
            .narrative_step(step_name, instructions, context, &evidence, inputs.model, inputs.index)
            .await?;

        let hash = self.store.put(
            ArtifactType::SynthesisStep,
            &SynthesisStep {
                step_name: step_name.to_string(),
                queries,
                retrieval_hits: hits.iter().map(hit_to_json).collect(),
                output: output.clone(),
            },
            vec![inputs.statistics_hash.clone()],
        )?;

        Ok((hash, output, hits))
    }

    /// Render and call the LLM for one step's narrative, re-validating
    /// every quoted span against the index and retrying once with an
    /// injected correction if a hallucination is found (§9, S4).
    async fn narrative_step(
        &self,
        step_name: &str,
        instructions: &str,
        context: &str,
        evidence: &str,
        model: &str,
        index: &KnowledgeIndex,
    ) -> Result<String> {
        let mut ctx = HashMap::new();
        ctx.insert("instructions".to_string(), instructions.to_string());
        ctx.insert("context".to_string(), context.to_string());
        ctx.insert("evidence".to_string(), evidence.to_string());
        let rendered = self.prompts.render("narrative", &ctx)?;

        let output = self.call_narrative(model, rendered).await?;

        // Framework-fit reasons over statistics only; there is no corpus
        // text to hallucinate a quote from, but a quote-shaped string could
        // still slip in, so the check runs unconditionally.
        if let Some(bad_quote) = find_hallucination(index, &output) {
            warn!(step_name, %bad_quote, "hallucinated quote detected, retrying step once");

            let mut retry_ctx = HashMap::new();
            retry_ctx.insert("instructions".to_string(), instructions.to_string());
            retry_ctx.insert("context".to_string(), context.to_string());
            retry_ctx.insert("evidence".to_string(), evidence.to_string());
            retry_ctx.insert("bad_quote".to_string(), bad_quote.clone());
            let retry_rendered = self.prompts.render("narrative_retry", &retry_ctx)?;

            let retry_output = self.call_narrative(model, retry_rendered).await?;

            if let Some(still_bad) = find_hallucination(index, &retry_output) {
                return Err(Error::HallucinationDetected {
                    step: step_name.to_string(),
                    quote: still_bad,
                });
            }
            return Ok(retry_output);
        }

        Ok(output)
    }

    /// Narrative steps never force a tool call — structured queries do,
    /// but the narrative itself is free text.
    async fn call_narrative(&self, model: &str, rendered: String) -> Result<String> {
        let request = CompletionRequest::new()
            .with_model(model)
            .with_system("You are a careful research analyst writing one stage of a multi-step synthesis report.")
            .with_message(ChatMessage::user(rendered))
            .with_temperature(0.2);
        let gateway_response = self.gateway.complete(request, None).await?;
        Ok(gateway_response.response.content)
    }
}

/// Extracts double-quoted spans of at least a few words and returns the
/// first one that validates as a hallucination, if any.
fn find_hallucination(index: &KnowledgeIndex, text: &str) -> Option<String> {
    let quote_re = Regex::new(r#""([^"]{12,300})""#).ok()?;
    for capture in quote_re.captures_iter(text) {
        let candidate = capture.get(1)?.as_str();
        let validation = index.validate_quote(candidate);
        if validation.drift_level == DriftLevel::Hallucination {
            return Some(candidate.to_string());
        }
    }
    None
}

fn hit_to_json(hit: &Hit) -> serde_json::Value {
    serde_json::json!({
        "content": hit.content,
        "data_type": hit.data_type,
        "source_artifact": hit.source_artifact,
        "relevance": hit.relevance,
        "metadata": hit.metadata,
    })
}

/// Builds the evidence text block fed to a narrative call, capped at
/// [`MAX_EVIDENCE_WORDS`] total words with the omission sentinel appended
/// once the cap is hit (§4.10's evidence budget).
fn build_evidence_bundle(hits: &[Hit]) -> String {
    let mut words_used = 0usize;
    let mut lines = Vec::new();

    for hit in hits {
        let word_count = hit.content.split_whitespace().count();
        if words_used + word_count > MAX_EVIDENCE_WORDS {
            lines.push(OMITTED_SENTINEL.to_string());
            break;
        }
        words_used += word_count;
        lines.push(format!("- [{}] \"{}\"", hit.source_artifact, hit.content));
    }

    lines.join("\n")
}

fn summarize_outliers(statistics: &Statistics) -> String {
    use crate::artifact::StatField;
    let mut lines = Vec::new();
    for (metric, field) in &statistics.outliers {
        if let StatField::Value(outliers) = field {
            if outliers.iqr_outlier_count > 0 || outliers.zscore_outlier_count > 0 {
                lines.push(format!(
                    "{}: {} IQR outliers, {} z-score outliers (n={})",
                    metric, outliers.iqr_outlier_count, outliers.zscore_outlier_count, outliers.n
                ));
            }
        }
    }
    if lines.is_empty() {
        "No statistically significant outliers were detected.".to_string()
    } else {
        lines.join("\n")
    }
}

fn summarize_patterns(statistics: &Statistics) -> String {
    use crate::artifact::StatField;
    let mut lines = Vec::new();
    for (metric, field) in &statistics.descriptives {
        if let StatField::Value(d) = field {
            lines.push(format!(
                "{}: mean={:.3} std={:.3} median={:.3} (n={})",
                metric, d.mean, d.std_dev, d.median, d.n
            ));
        }
    }
    lines.join("\n")
}

fn summarize_framework_fit(statistics: &Statistics) -> String {
    use crate::artifact::StatField;
    let reliability = match &statistics.reliability {
        StatField::Value(r) => format!("Cronbach's alpha = {:.3} ({})", r.alpha, r.interpretation),
        StatField::Error { error, .. } => format!("reliability unavailable: {}", error),
    };
    let correlation = match &statistics.correlation {
        StatField::Value(c) => format!("{} variables correlated across {} documents", c.variables.len(), statistics.sample_size),
        StatField::Error { error, .. } => format!("correlation unavailable: {}", error),
    };
    format!(
        "Sample size: {}\n{}\n{}",
        statistics.sample_size, reliability, correlation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_index::Hit;

    fn hit(content: &str) -> Hit {
        Hit {
            content: content.to_string(),
            data_type: "corpus_passage".to_string(),
            source_artifact: "doc1".to_string(),
            relevance: 0.9,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_evidence_bundle_includes_all_under_budget() {
        let hits = vec![hit("short passage one"), hit("short passage two")];
        let bundle = build_evidence_bundle(&hits);
        assert!(bundle.contains("short passage one"));
        assert!(bundle.contains("short passage two"));
        assert!(!bundle.contains(OMITTED_SENTINEL));
    }

    #[test]
    fn test_evidence_bundle_truncates_over_budget() {
        let long_passage = "word ".repeat(MAX_EVIDENCE_WORDS + 100);
        let hits = vec![hit(&long_passage), hit("never reached")];
        let bundle = build_evidence_bundle(&hits);
        assert!(bundle.contains(OMITTED_SENTINEL));
        assert!(!bundle.contains("never reached"));
    }

    #[test]
    fn test_summarize_patterns_formats_descriptives() {
        use crate::artifact::StatField;
        use crate::statistics::Descriptives;
        use std::collections::BTreeMap;

        let mut descriptives = BTreeMap::new();
        descriptives.insert(
            "overall_intensity".to_string(),
            StatField::Value(Descriptives {
                n: 4,
                mean: 0.5,
                std_dev: 0.1,
                min: 0.3,
                max: 0.7,
                median: 0.5,
                q1: 0.4,
                q3: 0.6,
                skewness: 0.0,
                kurtosis: 0.0,
            }),
        );
        let summary = summarize_patterns_test_helper(descriptives);
        assert!(summary.contains("overall_intensity"));
    }

    fn summarize_patterns_test_helper(
        descriptives: std::collections::BTreeMap<String, crate::artifact::StatField<crate::statistics::Descriptives>>,
    ) -> String {
        use crate::artifact::StatField;
        let mut lines = Vec::new();
        for (metric, field) in &descriptives {
            if let StatField::Value(d) = field {
                lines.push(format!("{}: mean={:.3}", metric, d.mean));
            }
        }
        lines.join("\n")
    }
}
