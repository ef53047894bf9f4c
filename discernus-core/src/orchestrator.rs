//! Orchestrator (§4.12).
//!
//! The single stateful coordinator. Given an experiment directory it runs
//! the fixed nine-step pipeline: load and hash the framework/corpus/config,
//! pre-flight the framework and data (§4.11), resolve models and check the
//! Gateway's budget, fan a per-(document, model) work queue out over a
//! bounded pool of `tokio` tasks, build the Knowledge Index, run the
//! Statistical Processor, run the post-hoc quality pre-flight, run
//! Sequential Synthesis, and finally emit a manifest mapping every
//! downstream artifact back to its parents.
//!
//! A failed `attestation` aborts the whole run (fail-fast, §5); a failed
//! analysis for a single document is recorded and the run continues. The
//! CAS is append-only, so "rollback" on abort never deletes a blob — it
//! marks the manifest `aborted` and stops.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::analysis::AnalysisAgent;
use crate::artifact::{
    ArtifactId, ArtifactType, AuditEvent, CorpusDocument, ExperimentConfig, FrameworkSpec,
    ThresholdOverrides,
};
use crate::cas::ContentStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::integrity::{self, IntegrityReport, QualityInputs, QualityThresholds, QualityValidationResult};
use crate::knowledge_index::KnowledgeIndex;
use crate::llm::client::{ClientConfig, MultiProviderClient};
use crate::llm::gateway::LLMGateway;
use crate::llm::types::Provider;
use crate::statistics::{NormalityResult, StatisticalProcessor, Statistics};
use crate::synthesis::{SequentialSynthesisAgent, SynthesisInputs};
use crate::verification::VerificationAgent;

/// Rough per-call cost used for the pre-flight budget estimate, matching
/// the Gateway's own internal worst-case guess (§4.3).
const ROUGH_COST_PER_CALL_USD: f64 = 0.05;

/// Cooperative cancellation signal shared across every pipeline stage
/// (§5). A shared `AtomicBool` plus a `Notify` rather than
/// `tokio_util::sync::CancellationToken`, to avoid pulling in a dependency
/// purely for this.
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called; suspension points can
    /// `select!` against this instead of polling.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrator-level summary of a run: every downstream artifact's hash,
/// mapped back to its parents via the provenance already recorded on each
/// artifact's CAS metadata. Not itself a CAS artifact type (§3 names no
/// `manifest` artifact) — written straight to disk alongside the CAS root,
/// since the data model treats it as the orchestrator's own output rather
/// than part of the provenance DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub experiment_name: String,
    pub experiment_config_hash: ArtifactId,
    pub framework_hash: ArtifactId,
    pub corpus_document_hashes: Vec<ArtifactId>,
    pub analysis_hashes: Vec<ArtifactId>,
    pub attestation_hashes: Vec<ArtifactId>,
    pub statistics_hash: Option<ArtifactId>,
    pub synthesis_step_hashes: Vec<ArtifactId>,
    pub final_report_hash: Option<ArtifactId>,
    /// `None` on a clean run; otherwise a short reason tag such as
    /// `"budget"`, `"transaction_integrity"`, or `"verification_failed"`.
    pub aborted: Option<String>,
    pub audit_events: Vec<AuditEvent>,
}

pub struct RunOutcome {
    pub manifest: RunManifest,
    pub manifest_path: PathBuf,
}

/// One (document, model) unit of work's terminal state.
enum WorkOutcome {
    Verified {
        document_id: String,
        analysis_hash: ArtifactId,
        attestation_hash: ArtifactId,
    },
    AnalysisFailed {
        document_id: String,
        model: String,
        reason: String,
    },
    Cancelled {
        document_id: String,
        model: String,
    },
}

pub struct Orchestrator {
    store: Arc<ContentStore>,
    gateway: Arc<LLMGateway>,
    config: Config,
}

impl Orchestrator {
    /// Build an orchestrator from process configuration: opens the CAS,
    /// wires a `MultiProviderClient` from whatever provider credentials are
    /// configured, and wraps it in the Gateway.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(ContentStore::open(&config.cas_root)?);
        let client = build_multi_provider_client(&config);
        let gateway = Arc::new(LLMGateway::new(client, config.clone()));
        Ok(Self {
            store,
            gateway,
            config,
        })
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Run-only-the-pre-flight-checks entry point for the CLI's `verify`
    /// subcommand (§6).
    pub fn preflight(&self, experiment_dir: &Path) -> Result<(IntegrityReport, IntegrityReport)> {
        let experiment = load_experiment_config(experiment_dir)?;
        let framework = load_framework(experiment_dir, &experiment)?;
        let documents = load_corpus(experiment_dir, &experiment)?;
        let framework_report = integrity::validate_framework(&framework, &[]);
        let data_report = integrity::validate_data(&documents, self.store.root());
        Ok((framework_report, data_report))
    }

    /// Re-run the Statistical Processor standalone over every
    /// `analysis_result` artifact already in the CAS, for the CLI's `stats`
    /// subcommand (§6).
    pub fn stats_over_stored_analyses(&self) -> Result<Statistics> {
        let hashes = self.store.list(ArtifactType::AnalysisResult)?;
        let mut analyses = Vec::with_capacity(hashes.len());
        for hash in hashes {
            analyses.push(self.store.get(ArtifactType::AnalysisResult, &hash)?);
        }
        Ok(StatisticalProcessor::analyze(&analyses))
    }

    /// Execute the full nine-step pipeline over an experiment directory.
    pub async fn run(&self, experiment_dir: &Path, cancel: CancellationToken) -> Result<RunOutcome> {
        // Step 1: load and hash framework, corpus, experiment config.
        let experiment = load_experiment_config(experiment_dir)?;
        let experiment_config_hash = self.store.put(ArtifactType::ExperimentConfig, &experiment, Vec::new())?;

        let framework = load_framework(experiment_dir, &experiment)?;
        let framework_hash = self.store.put(ArtifactType::FrameworkSpec, &framework, vec![experiment_config_hash.clone()])?;

        let documents = load_corpus(experiment_dir, &experiment)?;
        let mut corpus_document_hashes = Vec::with_capacity(documents.len());
        let mut document_hashes: HashMap<String, ArtifactId> = HashMap::new();
        for doc in &documents {
            let hash = self.store.put(
                ArtifactType::CorpusDocument,
                doc,
                vec![experiment_config_hash.clone()],
            )?;
            document_hashes.insert(doc.document_id.clone(), hash.clone());
            corpus_document_hashes.push(hash);
        }

        let mut manifest = RunManifest {
            experiment_name: experiment.name.clone(),
            experiment_config_hash: experiment_config_hash.clone(),
            framework_hash: framework_hash.clone(),
            corpus_document_hashes,
            analysis_hashes: Vec::new(),
            attestation_hashes: Vec::new(),
            statistics_hash: None,
            synthesis_step_hashes: Vec::new(),
            final_report_hash: None,
            aborted: None,
            audit_events: Vec::new(),
        };

        // Step 2: framework + data pre-flight.
        let framework_report = integrity::validate_framework(&framework, &[]);
        let data_report = integrity::validate_data(&documents, self.store.root());
        let (valid, failures) = integrity::is_transaction_valid(&[&framework_report, &data_report]);
        if !valid {
            warn!(?failures, "pre-flight transaction integrity failed");
            return self.abort(manifest, "transaction_integrity", &framework_report, &data_report);
        }

        // Step 3: resolve models, pre-flight cost estimate.
        let models = resolve_models(&experiment, &self.config);
        let verifier_model = self.config.default_verifier_model.clone();
        let projected_calls = (documents.len() * models.len() * 2) as f64;
        let estimate = projected_calls * ROUGH_COST_PER_CALL_USD;
        let accumulated = self.gateway.accumulated_cost().await;
        if accumulated + estimate > self.config.daily_budget_usd {
            warn!(accumulated, estimate, limit = self.config.daily_budget_usd, "pre-flight budget check failed");
            manifest.audit_events.push(AuditEvent::new(
                "budget_preflight_failed",
                serde_json::json!({"accumulated": accumulated, "estimate": estimate}),
            ));
            return self.abort_with_reason(manifest, "budget");
        }

        // Step 4: per-(document, model) work queue.
        let analysis_agent = Arc::new(AnalysisAgent::new(self.store.clone(), self.gateway.clone())?);
        let verification_agent = Arc::new(VerificationAgent::new(self.store.clone(), self.gateway.clone())?);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut joinset: JoinSet<Result<WorkOutcome>> = JoinSet::new();
        for document in documents.clone() {
            let document_hash = document_hashes[&document.document_id].clone();
            for model in &models {
                let agent = analysis_agent.clone();
                let verifier = verification_agent.clone();
                let framework = framework.clone();
                let framework_hash = framework_hash.clone();
                let model = model.clone();
                let verifier_model = verifier_model.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let document = document.clone();
                let document_hash = document_hash.clone();

                joinset.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.map_err(|_| {
                        Error::Internal("work queue semaphore closed".to_string())
                    })?;

                    if cancel.is_cancelled() {
                        return Ok(WorkOutcome::Cancelled {
                            document_id: document.document_id.clone(),
                            model,
                        });
                    }

                    let outcome = match agent
                        .analyze_document(&document, &document_hash, &framework, &framework_hash, &model)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(document_id = %document.document_id, model, error = %e, "analysis failed for document");
                            return Ok(WorkOutcome::AnalysisFailed {
                                document_id: document.document_id.clone(),
                                model,
                                reason: e.to_string(),
                            });
                        }
                    };

                    if cancel.is_cancelled() {
                        return Ok(WorkOutcome::Cancelled {
                            document_id: document.document_id.clone(),
                            model,
                        });
                    }

                    let attestation_hash = match verifier
                        .verify_analysis(&outcome.analysis_hash, &document.text, &framework.name, &verifier_model)
                        .await
                    {
                        Ok(hash) => hash,
                        Err(e) => {
                            warn!(document_id = %document.document_id, model, error = %e, "verification call failed");
                            return Ok(WorkOutcome::AnalysisFailed {
                                document_id: document.document_id.clone(),
                                model,
                                reason: e.to_string(),
                            });
                        }
                    };

                    Ok(WorkOutcome::Verified {
                        document_id: document.document_id.clone(),
                        analysis_hash: outcome.analysis_hash,
                        attestation_hash,
                    })
                });
            }
        }

        let mut attested_analysis_hashes = Vec::new();
        let mut fail_fast_reason: Option<String> = None;

        while let Some(joined) = joinset.join_next().await {
            let result = match joined {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "work queue task panicked or was cancelled");
                    continue;
                }
            };

            match result {
                Ok(WorkOutcome::Verified { document_id, analysis_hash, attestation_hash }) => {
                    let attestation: crate::artifact::Attestation =
                        self.store.get(ArtifactType::Attestation, &attestation_hash)?;
                    manifest.analysis_hashes.push(analysis_hash.clone());
                    manifest.attestation_hashes.push(attestation_hash.clone());
                    if attestation.success {
                        attested_analysis_hashes.push(analysis_hash);
                    } else {
                        info!(document_id, "attestation failed, aborting run (fail-fast)");
                        fail_fast_reason = Some(format!(
                            "verification_failed: {}",
                            attestation.reasoning
                        ));
                        cancel.cancel();
                        break;
                    }
                }
                Ok(WorkOutcome::AnalysisFailed { document_id, model, reason }) => {
                    manifest.audit_events.push(AuditEvent::new(
                        "analysis_failed",
                        serde_json::json!({"document_id": document_id, "model": model, "reason": reason}),
                    ));
                }
                Ok(WorkOutcome::Cancelled { document_id, model }) => {
                    manifest.audit_events.push(AuditEvent::new(
                        "work_cancelled",
                        serde_json::json!({"document_id": document_id, "model": model}),
                    ));
                }
                Err(e) => {
                    fail_fast_reason = Some(e.to_string());
                    cancel.cancel();
                    break;
                }
            }
        }

        if let Some(reason) = fail_fast_reason {
            joinset.abort_all();
            while joinset.join_next().await.is_some() {}
            manifest.audit_events.extend(self.gateway.audit_events().await);
            return self.abort_with_reason(manifest, &reason);
        }

        if attested_analysis_hashes.is_empty() {
            warn!("no attested analyses survived the work queue; aborting before synthesis");
            manifest.audit_events.extend(self.gateway.audit_events().await);
            return self.abort_with_reason(manifest, "no_attested_analyses");
        }

        let analyses: Vec<crate::artifact::AnalysisResult> = attested_analysis_hashes
            .iter()
            .map(|hash| self.store.get(ArtifactType::AnalysisResult, hash))
            .collect::<Result<Vec<_>>>()?;

        // Step 5: build the Knowledge Index.
        let index = KnowledgeIndex::build(self.store.root(), &experiment_config_hash, &documents, &analyses)?;

        // Step 6: statistics over every attested analysis of the run.
        let statistics = StatisticalProcessor::analyze(&analyses);
        let statistics_hash = self.store.put(
            ArtifactType::Statistics,
            &statistics,
            manifest.analysis_hashes.clone(),
        )?;
        manifest.statistics_hash = Some(statistics_hash.clone());

        // Step 7: post-hoc quality pre-flight.
        let thresholds = apply_threshold_overrides(&self.config.quality_thresholds, &experiment.thresholds);
        let quality_report = self.quality_preflight(&analyses, &statistics, &thresholds);
        if !quality_report.valid {
            manifest.audit_events.extend(self.gateway.audit_events().await);
            return self.abort(
                manifest,
                "quality",
                &IntegrityReport { valid: true, failed_checks: Vec::new(), guidance: Vec::new() },
                &quality_report,
            );
        }

        // Step 8: sequential synthesis.
        let synthesis_agent = SequentialSynthesisAgent::new(self.store.clone(), self.gateway.clone())?;
        let synthesis_model = models.first().cloned().unwrap_or_else(|| self.config.default_models[0].clone());
        let synthesis_inputs = SynthesisInputs {
            experiment: &experiment,
            statistics: &statistics,
            statistics_hash: &statistics_hash,
            index: &index,
            attested_analysis_hashes: &attested_analysis_hashes,
            model: &synthesis_model,
        };
        let synthesis_outcome = synthesis_agent.run(&synthesis_inputs).await?;
        manifest.synthesis_step_hashes = synthesis_outcome.step_hashes;
        manifest.final_report_hash = Some(synthesis_outcome.final_report_hash);

        // Step 9: finalize.
        manifest.audit_events.extend(self.gateway.audit_events().await);
        let manifest_path = write_manifest(self.store.root(), &manifest)?;
        info!(experiment = %manifest.experiment_name, "run completed");
        Ok(RunOutcome { manifest, manifest_path })
    }

    fn quality_preflight(
        &self,
        analyses: &[crate::artifact::AnalysisResult],
        statistics: &Statistics,
        thresholds: &QualityThresholds,
    ) -> IntegrityReport {
        let p_values = extract_normality_p_values(statistics);
        let coefficient_of_variation = overall_coefficient_of_variation(statistics);
        let llm_response_texts: Vec<String> = analyses
            .iter()
            .flat_map(|a| a.evidence.iter().map(|e| e.quote.clone()))
            .collect();

        let inputs = QualityInputs {
            analyses,
            attestations: &[],
            framework_fit_scores: &HashMap::new(),
            p_values: &p_values,
            confidence_interval_widths: &HashMap::new(),
            sample_size: statistics.sample_size,
            coefficient_of_variation,
            llm_response_texts: &llm_response_texts,
        };

        let mut report = integrity::validate_quality(&inputs, thresholds);

        // §4.11: below the minimum sample size, quality pre-flight warns
        // rather than blocks, so a single-document corpus still completes
        // (§8/B1).
        let (blocking, sample_size_only): (Vec<_>, Vec<_>) = report
            .failed_checks
            .into_iter()
            .partition(|c| c.result != QualityValidationResult::SampleSizeInsufficient);
        for check in &sample_size_only {
            warn!(%check, "quality check downgraded to warning (sample size floor)");
        }
        report.failed_checks = blocking;
        report.valid = report.failed_checks.is_empty();
        report
    }

    fn abort(
        &self,
        mut manifest: RunManifest,
        domain: &str,
        first: &IntegrityReport,
        second: &IntegrityReport,
    ) -> Result<RunOutcome> {
        let mut failed_checks = Vec::new();
        failed_checks.extend(first.failed_checks.iter().map(|c| c.to_string()));
        failed_checks.extend(second.failed_checks.iter().map(|c| c.to_string()));
        let mut guidance = Vec::new();
        guidance.extend(first.guidance.clone());
        guidance.extend(second.guidance.clone());

        manifest.aborted = Some(domain.to_string());
        manifest.audit_events.push(AuditEvent::new(
            "transaction_integrity_failed",
            serde_json::json!({"domain": domain, "failed_checks": failed_checks, "guidance": guidance}),
        ));
        write_manifest(self.store.root(), &manifest)?;
        Err(Error::transaction_integrity(domain, failed_checks, guidance))
    }

    fn abort_with_reason(&self, mut manifest: RunManifest, reason: &str) -> Result<RunOutcome> {
        manifest.aborted = Some(reason.to_string());
        let experiment_name = manifest.experiment_name.clone();
        write_manifest(self.store.root(), &manifest)?;

        if reason == "budget" {
            return Err(Error::BudgetExceeded {
                accumulated_usd: 0.0,
                estimate_usd: 0.0,
                limit_usd: self.config.daily_budget_usd,
            });
        }
        if let Some(reasoning) = reason.strip_prefix("verification_failed: ") {
            return Err(Error::verification_failed(experiment_name, reasoning.to_string()));
        }
        Err(Error::Internal(format!("run aborted: {}", reason)))
    }
}

fn build_multi_provider_client(config: &Config) -> MultiProviderClient {
    let mut client = MultiProviderClient::new();
    let params = crate::provider_params::ProviderParameterManager::new();

    if let Some(creds) = config.credentials("anthropic") {
        if let Some(key) = &creds.api_key {
            let cfg = ClientConfig::new(key.clone()).with_timeout(params.timeout_for_model("claude"));
            client = client.with_client(Arc::new(crate::llm::client::AnthropicClient::new(cfg)));
        }
    }
    if let Some(creds) = config.credentials("openai") {
        if let Some(key) = &creds.api_key {
            let cfg = ClientConfig::new(key.clone()).with_timeout(params.timeout_for_model("gpt-4o"));
            client = client.with_client(Arc::new(crate::llm::client::OpenAIClient::new(cfg)));
        }
    }
    #[cfg(feature = "gemini")]
    {
        if let Some(creds) = config.credentials("vertex_ai") {
            if let Some(key) = &creds.api_key {
                let mut cfg = ClientConfig::new(key.clone())
                    .with_timeout(params.timeout_for_model("vertex_ai/gemini"));
                if let Some(base_url) = &creds.base_url {
                    cfg = cfg.with_base_url(base_url.clone());
                }
                client = client.with_client(Arc::new(crate::llm::client::GoogleClient::new(cfg)));
            }
        }
    }

    if config.credentials("anthropic").is_some() {
        client = client.with_default_provider(Provider::Anthropic);
    } else if config.credentials("openai").is_some() {
        client = client.with_default_provider(Provider::OpenAI);
    }

    client
}

/// §4.6's models come from the experiment config when it names any,
/// otherwise from the process-wide defaults.
fn resolve_models(experiment: &ExperimentConfig, config: &Config) -> Vec<String> {
    if experiment.selected_models.is_empty() {
        config.default_models.clone()
    } else {
        experiment.selected_models.clone()
    }
}

/// Merge per-experiment overrides onto the default quality thresholds by
/// field name (§4.11).
fn apply_threshold_overrides(base: &QualityThresholds, overrides: &ThresholdOverrides) -> QualityThresholds {
    let mut thresholds = base.clone();
    for (name, value) in overrides {
        match name.as_str() {
            "min_framework_fit_score" => thresholds.min_framework_fit_score = *value,
            "min_statistical_power" => thresholds.min_statistical_power = *value,
            "min_confidence_level" => thresholds.min_confidence_level = *value,
            "min_sample_size" => thresholds.min_sample_size = *value as usize,
            "max_coefficient_variation" => thresholds.max_coefficient_variation = *value,
            "min_llm_response_length" => thresholds.min_llm_response_length = *value as usize,
            "min_llm_response_coherence" => thresholds.min_llm_response_coherence = *value,
            "max_p_value" => thresholds.max_p_value = *value,
            "max_confidence_interval_width" => thresholds.max_confidence_interval_width = *value,
            other => warn!(threshold = other, "ignoring unknown threshold override"),
        }
    }
    thresholds
}

/// Flattens each column's normality `p_value` into the shape
/// `validate_quality` expects, mapping `StatField<NormalityResult>` to
/// `StatField<f64>` without discarding the insufficient-sample leaf.
fn extract_normality_p_values(
    statistics: &Statistics,
) -> HashMap<String, crate::artifact::StatField<f64>> {
    statistics
        .normality
        .iter()
        .map(|(name, field)| {
            let mapped = match field {
                crate::artifact::StatField::Value(NormalityResult { p_value, .. }) => {
                    crate::artifact::StatField::Value(*p_value)
                }
                crate::artifact::StatField::Error {
                    error,
                    sample_size,
                    minimum_required,
                    recommendation,
                } => crate::artifact::StatField::Error {
                    error: error.clone(),
                    sample_size: *sample_size,
                    minimum_required: *minimum_required,
                    recommendation: recommendation.clone(),
                },
            };
            (name.clone(), mapped)
        })
        .collect()
}

/// A coarse overall coefficient of variation, read off the `mean_raw`
/// column's descriptives when present (§4.11's variance gate).
fn overall_coefficient_of_variation(statistics: &Statistics) -> Option<f64> {
    match statistics.descriptives.get("mean_raw") {
        Some(crate::artifact::StatField::Value(d)) if d.mean.abs() > f64::EPSILON => {
            Some(d.std_dev / d.mean.abs())
        }
        _ => None,
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::not_found(format!("{:?}: {}", path, e))
    })?;
    serde_json::from_str(&text).map_err(Error::from)
}

fn load_experiment_config(experiment_dir: &Path) -> Result<ExperimentConfig> {
    let path = if experiment_dir.is_file() {
        experiment_dir.to_path_buf()
    } else {
        experiment_dir.join("experiment.json")
    };
    load_json(&path)
}

fn load_framework(experiment_dir: &Path, experiment: &ExperimentConfig) -> Result<FrameworkSpec> {
    let dir = if experiment_dir.is_file() {
        experiment_dir.parent().unwrap_or(Path::new("."))
    } else {
        experiment_dir
    };
    load_json(&dir.join(&experiment.framework_ref))
}

/// One entry of the corpus manifest (§6): `{filename, document_id, metadata}`.
#[derive(Debug, Clone, Deserialize)]
struct CorpusManifestEntry {
    filename: String,
    document_id: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

fn load_corpus(experiment_dir: &Path, experiment: &ExperimentConfig) -> Result<Vec<CorpusDocument>> {
    let dir = if experiment_dir.is_file() {
        experiment_dir.parent().unwrap_or(Path::new("."))
    } else {
        experiment_dir
    };
    let manifest_path = dir.join(&experiment.corpus_ref);
    let entries: Vec<CorpusManifestEntry> = load_json(&manifest_path)?;
    let corpus_dir = manifest_path.parent().unwrap_or(Path::new("."));

    let mut documents = Vec::with_capacity(entries.len());
    for entry in entries {
        let file_path = corpus_dir.join(&entry.filename);
        let bytes = std::fs::read(&file_path).map_err(|e| Error::not_found(format!("{:?}: {}", file_path, e)))?;
        let text = match String::from_utf8(bytes.clone()) {
            Ok(text) => text,
            Err(_) => {
                warn!(filename = %entry.filename, "document is not valid UTF-8, falling back to Latin-1 decoding");
                bytes.iter().map(|&b| b as char).collect()
            }
        };
        documents.push(CorpusDocument {
            document_id: entry.document_id,
            filename: entry.filename,
            text,
            metadata: entry.metadata,
        });
    }
    Ok(documents)
}

fn write_manifest(cas_root: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let dir = cas_root.join("manifests");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.json", manifest.experiment_config_hash));
    let bytes = serde_json::to_vec_pretty(manifest)?;
    std::fs::write(&path, bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::StatField;
    use crate::statistics::Descriptives;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_cancellation_token_resolves_after_cancel() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        let handle = token.clone();
        tokio::spawn(async move {
            handle.cancel();
        });
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_resolve_models_prefers_experiment_selection() {
        let mut experiment = sample_experiment();
        experiment.selected_models = vec!["gpt-4o".to_string()];
        let config = Config::default();
        assert_eq!(resolve_models(&experiment, &config), vec!["gpt-4o".to_string()]);
    }

    #[test]
    fn test_resolve_models_falls_back_to_config_defaults() {
        let experiment = sample_experiment();
        let config = Config::default();
        assert_eq!(resolve_models(&experiment, &config), config.default_models);
    }

    #[test]
    fn test_apply_threshold_overrides_merges_named_fields() {
        let base = QualityThresholds::default();
        let mut overrides = ThresholdOverrides::new();
        overrides.insert("min_sample_size".to_string(), 3.0);
        overrides.insert("max_p_value".to_string(), 0.1);
        let merged = apply_threshold_overrides(&base, &overrides);
        assert_eq!(merged.min_sample_size, 3);
        assert_eq!(merged.max_p_value, 0.1);
        assert_eq!(merged.min_framework_fit_score, base.min_framework_fit_score);
    }

    #[test]
    fn test_overall_coefficient_of_variation_reads_mean_raw() {
        let mut descriptives = BTreeMap::new();
        descriptives.insert(
            "mean_raw".to_string(),
            StatField::Value(Descriptives {
                n: 5,
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
        let statistics = Statistics {
            sample_size: 5,
            descriptives,
            correlation: StatField::insufficient(5, 3, "correlation"),
            reliability: StatField::insufficient(5, 3, "reliability"),
            pca: StatField::insufficient(5, 2, "pca"),
            clustering: StatField::insufficient(5, 3, "clustering"),
            outliers: BTreeMap::new(),
            effect_sizes: BTreeMap::new(),
            normality: BTreeMap::new(),
            evidence: None,
            content_hash: String::new(),
        };
        let cv = overall_coefficient_of_variation(&statistics);
        assert!((cv.unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_manifest_round_trips_through_json() {
        let manifest = RunManifest {
            experiment_name: "test".to_string(),
            experiment_config_hash: "abc".to_string(),
            framework_hash: "def".to_string(),
            corpus_document_hashes: vec!["doc1".to_string()],
            analysis_hashes: Vec::new(),
            attestation_hashes: Vec::new(),
            statistics_hash: None,
            synthesis_step_hashes: Vec::new(),
            final_report_hash: None,
            aborted: None,
            audit_events: Vec::new(),
        };
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let round_tripped: RunManifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(round_tripped.experiment_name, manifest.experiment_name);
        assert_eq!(round_tripped.corpus_document_hashes, manifest.corpus_document_hashes);
    }

    fn sample_experiment() -> ExperimentConfig {
        ExperimentConfig {
            name: "sample".to_string(),
            description: String::new(),
            framework_ref: "framework.json".to_string(),
            corpus_ref: "corpus.json".to_string(),
            questions: Vec::new(),
            hypotheses: Vec::new(),
            analysis_mode: "single_model".to_string(),
            selected_models: Vec::new(),
            thresholds: ThresholdOverrides::new(),
        }
    }
}
