//! Statistical Processor (§4.8).
//!
//! Runs a fixed battery of descriptive and inferential analyses over a set
//! of analysis results: per-column descriptives, pairwise Pearson
//! correlation, Cronbach's alpha reliability, PCA, k-means clustering,
//! IQR/Z-score outlier detection, Hedges' g effect sizes against the
//! theoretical midpoint of a bounded scale, and Shapiro-Wilk normality.
//!
//! Every sub-analysis is independent: a failure or an insufficient sample
//! size in one (say, PCA needing at least two variables) becomes an
//! `{error: ...}` leaf via [`StatField`] rather than aborting the whole
//! artifact (I4, P5). Grounded on the source's
//! `universal_statistics_processor.py`, whose per-analysis try/except
//! wrapping this mirrors directly.
//!
//! PCA's eigendecomposition and k-means are hand-rolled on top of `ndarray`
//! rather than reached for in `ndarray-stats`/`linfa-linalg`, since their
//! exact call shapes couldn't be verified against a compiler in this
//! pass — see DESIGN.md.

use std::collections::BTreeMap;

use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::artifact::{AnalysisResult, StatField};

const MIN_CORRELATION_N: usize = 3;
const MIN_RELIABILITY_N: usize = 3;
const MIN_RELIABILITY_VARS: usize = 2;
const MIN_PCA_VARS: usize = 2;
const MIN_CLUSTERING_N: usize = 3;
const MIN_OUTLIER_N: usize = 4;
const MIN_EFFECT_SIZE_N: usize = 2;
const MIN_NORMALITY_N: usize = 3;
const SIGNIFICANCE_P: f64 = 0.05;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptives {
    pub n: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub q1: f64,
    pub q3: f64,
    pub skewness: f64,
    pub kurtosis: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticalValidity {
    pub n: usize,
    pub recommended_minimum: usize,
    pub adequate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub variables: Vec<String>,
    pub matrix: Vec<Vec<f64>>,
    pub statistical_validity: StatisticalValidity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityResult {
    pub alpha: f64,
    pub interpretation: String,
    pub n_items: usize,
    pub n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadingEntry {
    pub variable: String,
    pub loading: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaResult {
    pub explained_variance_ratio: Vec<f64>,
    pub cumulative_variance: Vec<f64>,
    pub n_components_90_percent: usize,
    /// Top-3 absolute loadings for the first `min(3, n_components)` components.
    pub component_loadings: Vec<Vec<LoadingEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterK {
    pub k: usize,
    pub inertia: f64,
    pub cluster_sizes: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringResult {
    pub runs: Vec<ClusterK>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierResult {
    pub n: usize,
    pub iqr_outlier_count: usize,
    pub iqr_outlier_percentage: f64,
    pub zscore_outlier_count: usize,
    pub zscore_outlier_percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectSize {
    pub n: usize,
    pub cohens_d: f64,
    pub hedges_g: f64,
    pub interpretation: String,
    pub direction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalityResult {
    pub n: usize,
    pub statistic: f64,
    pub p_value: f64,
    pub is_normal: bool,
}

/// Evidence-level summary (§4.8): quote counts per dimension and per
/// document, plus quote-length descriptives. Present only when at least
/// one analysis carries evidence quotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceStatistics {
    pub total_quotes: usize,
    pub quotes_per_dimension: BTreeMap<String, usize>,
    pub quotes_per_document: BTreeMap<String, usize>,
    pub quote_length_chars: StatField<Descriptives>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub sample_size: usize,
    pub descriptives: BTreeMap<String, StatField<Descriptives>>,
    pub correlation: StatField<CorrelationMatrix>,
    pub reliability: StatField<ReliabilityResult>,
    pub pca: StatField<PcaResult>,
    pub clustering: StatField<ClusteringResult>,
    pub outliers: BTreeMap<String, StatField<OutlierResult>>,
    pub effect_sizes: BTreeMap<String, StatField<EffectSize>>,
    pub normality: BTreeMap<String, StatField<NormalityResult>>,
    #[serde(default)]
    pub evidence: Option<EvidenceStatistics>,
    pub content_hash: String,
}

/// Stateless entry point: every method is a pure function of its inputs.
pub struct StatisticalProcessor;

impl StatisticalProcessor {
    /// Run the full battery over a set of analyses. All analyses should
    /// share a framework; mixing frameworks produces a column union with
    /// gaps, which is allowed but not meaningful.
    pub fn analyze(analyses: &[AnalysisResult]) -> Statistics {
        let columns = build_columns(analyses);
        let n = analyses.len();

        let descriptives = columns
            .iter()
            .map(|(name, values)| (name.clone(), compute_descriptives(values)))
            .collect();

        let correlation = compute_correlation(&columns, n);
        let reliability = compute_reliability(analyses, n);
        let pca = compute_pca(&columns, n);
        let clustering = compute_clustering(&columns, n);

        let outliers = columns
            .iter()
            .map(|(name, values)| (name.clone(), compute_outliers(values)))
            .collect();

        let effect_sizes = columns
            .iter()
            .filter(|(_, values)| is_unit_bounded(values))
            .map(|(name, values)| (name.clone(), compute_effect_size(values)))
            .collect();

        let normality = columns
            .iter()
            .map(|(name, values)| (name.clone(), compute_normality(values)))
            .collect();

        let evidence = compute_evidence_statistics(analyses);

        let mut stats = Statistics {
            sample_size: n,
            descriptives,
            correlation,
            reliability,
            pca,
            clustering,
            outliers,
            effect_sizes,
            normality,
            evidence,
            content_hash: String::new(),
        };
        stats.content_hash = content_hash(&stats);
        stats
    }
}

/// Evidence-level section (§4.8): only emitted when at least one analysis
/// carries evidence quotes, per the source's `if evidence present` gate.
fn compute_evidence_statistics(analyses: &[AnalysisResult]) -> Option<EvidenceStatistics> {
    let total_quotes: usize = analyses.iter().map(|a| a.evidence.len()).sum();
    if total_quotes == 0 {
        return None;
    }

    let mut quotes_per_dimension: BTreeMap<String, usize> = BTreeMap::new();
    let mut quotes_per_document: BTreeMap<String, usize> = BTreeMap::new();
    let mut lengths: Vec<f64> = Vec::with_capacity(total_quotes);

    for analysis in analyses {
        for quote in &analysis.evidence {
            *quotes_per_dimension.entry(quote.dimension.clone()).or_insert(0) += 1;
            *quotes_per_document.entry(analysis.document_id.clone()).or_insert(0) += 1;
            lengths.push(quote.quote.chars().count() as f64);
        }
    }

    Some(EvidenceStatistics {
        total_quotes,
        quotes_per_dimension,
        quotes_per_document,
        quote_length_chars: compute_descriptives(&lengths),
    })
}

/// Flattens each analysis into a row of named numeric columns: the
/// document-level derived metrics, plus one `<dimension>_raw`,
/// `<dimension>_salience`, `<dimension>_confidence` triple per scored
/// dimension.
fn build_columns(analyses: &[AnalysisResult]) -> BTreeMap<String, Vec<f64>> {
    let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for analysis in analyses {
        for (metric, value) in &analysis.derived_metrics {
            columns.entry(metric.clone()).or_default().push(*value);
        }
        for (dimension, score) in &analysis.scores {
            columns
                .entry(format!("{}_raw", dimension))
                .or_default()
                .push(score.raw);
            columns
                .entry(format!("{}_salience", dimension))
                .or_default()
                .push(score.salience);
            columns
                .entry(format!("{}_confidence", dimension))
                .or_default()
                .push(score.confidence);
        }
    }

    columns
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64], ddof: usize) -> f64 {
    let m = mean(values);
    let denom = (values.len() - ddof).max(1) as f64;
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / denom
}

fn std_dev(values: &[f64], ddof: usize) -> f64 {
    variance(values, ddof).sqrt()
}

/// Population (biased) skewness, matching `scipy.stats.skew`'s default
/// `bias=True`: `m3 / m2^1.5` over central moments divided by `n`.
fn skewness(values: &[f64], m: f64) -> f64 {
    let n = values.len() as f64;
    let m2 = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    if m2 == 0.0 {
        return 0.0;
    }
    let m3 = values.iter().map(|v| (v - m).powi(3)).sum::<f64>() / n;
    m3 / m2.powf(1.5)
}

/// Excess (Fisher) kurtosis, matching `scipy.stats.kurtosis`'s default
/// `fisher=True, bias=True`: `m4 / m2^2 - 3`.
fn kurtosis(values: &[f64], m: f64) -> f64 {
    let n = values.len() as f64;
    let m2 = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    if m2 == 0.0 {
        return 0.0;
    }
    let m4 = values.iter().map(|v| (v - m).powi(4)).sum::<f64>() / n;
    m4 / m2.powi(2) - 3.0
}

fn compute_descriptives(values: &[f64]) -> StatField<Descriptives> {
    if values.is_empty() {
        return StatField::insufficient(0, 1, "descriptives");
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    };
    let m = mean(values);
    StatField::Value(Descriptives {
        n,
        mean: m,
        std_dev: std_dev(values, 1.max(1).min(n.saturating_sub(1)).max(0)),
        min: sorted[0],
        max: sorted[n - 1],
        median,
        q1: percentile(&sorted, 0.25),
        q3: percentile(&sorted, 0.75),
        skewness: skewness(values, m),
        kurtosis: kurtosis(values, m),
    })
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = mean(a);
    let mean_b = mean(b);
    let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - mean_a) * (y - mean_b)).sum();
    let var_a: f64 = a.iter().map(|x| (x - mean_a).powi(2)).sum();
    let var_b: f64 = b.iter().map(|y| (y - mean_b).powi(2)).sum();
    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 || n == 0.0 {
        0.0
    } else {
        (cov / denom).clamp(-1.0, 1.0)
    }
}

fn compute_correlation(columns: &BTreeMap<String, Vec<f64>>, n: usize) -> StatField<CorrelationMatrix> {
    if n < MIN_CORRELATION_N || columns.len() < 2 {
        return StatField::insufficient(n, MIN_CORRELATION_N, "correlation analysis");
    }

    let variables: Vec<String> = columns.keys().cloned().collect();
    let series: Vec<&Vec<f64>> = variables.iter().map(|v| &columns[v]).collect();

    let mut matrix = vec![vec![0.0; variables.len()]; variables.len()];
    for i in 0..variables.len() {
        for j in 0..variables.len() {
            matrix[i][j] = if i == j { 1.0 } else { pearson(series[i], series[j]) };
        }
    }

    StatField::Value(CorrelationMatrix {
        variables,
        matrix,
        statistical_validity: StatisticalValidity {
            n,
            recommended_minimum: 5,
            adequate: n >= 5,
        },
    })
}

fn interpret_alpha(alpha: f64) -> &'static str {
    if alpha >= 0.9 {
        "Excellent"
    } else if alpha >= 0.8 {
        "Good"
    } else if alpha >= 0.7 {
        "Acceptable"
    } else if alpha >= 0.6 {
        "Questionable"
    } else {
        "Poor"
    }
}

/// Cronbach's alpha over each dimension's raw score as an "item". Requires
/// at least two dimensions and three documents.
fn compute_reliability(analyses: &[AnalysisResult], n: usize) -> StatField<ReliabilityResult> {
    if n < MIN_RELIABILITY_N {
        return StatField::insufficient(n, MIN_RELIABILITY_N, "reliability analysis");
    }

    let mut items: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for analysis in analyses {
        for (dimension, score) in &analysis.scores {
            items.entry(dimension.clone()).or_default().push(score.raw);
        }
    }
    // Keep only dimensions scored on every document, so the item matrix is rectangular.
    items.retain(|_, v| v.len() == n);

    if items.len() < MIN_RELIABILITY_VARS {
        return StatField::insufficient(items.len(), MIN_RELIABILITY_VARS, "reliability analysis (dimensions)");
    }

    let k = items.len() as f64;
    let item_variances: f64 = items.values().map(|v| variance(v, 1)).sum();

    let mut totals = vec![0.0; n];
    for values in items.values() {
        for (i, v) in values.iter().enumerate() {
            totals[i] += v;
        }
    }
    let total_variance = variance(&totals, 1);

    if total_variance == 0.0 {
        return StatField::Error {
            error: "zero variance in total scores, cannot compute reliability".to_string(),
            sample_size: n,
            minimum_required: MIN_RELIABILITY_N,
            recommendation: "ensure documents are not scored identically across all dimensions".to_string(),
        };
    }

    let alpha = (k / (k - 1.0)) * (1.0 - item_variances / total_variance);

    StatField::Value(ReliabilityResult {
        alpha,
        interpretation: interpret_alpha(alpha).to_string(),
        n_items: items.len(),
        n,
    })
}

/// Zero-mean, unit-variance standardization using the population standard
/// deviation (ddof=0), matching sklearn's `StandardScaler` default.
fn standardize(values: &[f64]) -> Vec<f64> {
    let m = mean(values);
    let sd = std_dev(values, 0);
    if sd == 0.0 {
        vec![0.0; values.len()]
    } else {
        values.iter().map(|v| (v - m) / sd).collect()
    }
}

fn compute_pca(columns: &BTreeMap<String, Vec<f64>>, n: usize) -> StatField<PcaResult> {
    if columns.len() < MIN_PCA_VARS || n < 2 {
        return StatField::insufficient(columns.len(), MIN_PCA_VARS, "PCA (variables)");
    }

    let variables: Vec<String> = columns.keys().cloned().collect();
    let standardized: Vec<Vec<f64>> = variables.iter().map(|v| standardize(&columns[v])).collect();

    let p = variables.len();
    let mut cov = Array2::<f64>::zeros((p, p));
    for i in 0..p {
        for j in 0..p {
            let sum: f64 = (0..n).map(|row| standardized[i][row] * standardized[j][row]).sum();
            cov[[i, j]] = sum / (n.saturating_sub(1)).max(1) as f64;
        }
    }

    let (mut eigenvalues, eigenvectors) = jacobi_eigen(&cov);
    // Descending order.
    let mut order: Vec<usize> = (0..p).collect();
    order.sort_by(|&a, &b| eigenvalues[b].partial_cmp(&eigenvalues[a]).unwrap());
    eigenvalues = order.iter().map(|&i| eigenvalues[i].max(0.0)).collect();

    let total: f64 = eigenvalues.iter().sum();
    let explained_variance_ratio: Vec<f64> = if total > 0.0 {
        eigenvalues.iter().map(|e| e / total).collect()
    } else {
        vec![0.0; eigenvalues.len()]
    };

    let mut cumulative = Vec::with_capacity(explained_variance_ratio.len());
    let mut running = 0.0;
    for r in &explained_variance_ratio {
        running += r;
        cumulative.push(running);
    }
    let n_components_90_percent = cumulative
        .iter()
        .position(|c| *c >= 0.9)
        .map(|idx| idx + 1)
        .unwrap_or(cumulative.len());

    let n_loading_components = n_components_90_percent.min(3).max(1).min(p);
    let mut component_loadings = Vec::with_capacity(n_loading_components);
    for comp in 0..n_loading_components {
        let original_index = order[comp];
        let mut pairs: Vec<(String, f64)> = variables
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), eigenvectors[[i, original_index]]))
            .collect();
        pairs.sort_by(|a, b| b.1.abs().partial_cmp(&a.1.abs()).unwrap());
        pairs.truncate(3);
        component_loadings.push(
            pairs
                .into_iter()
                .map(|(variable, loading)| LoadingEntry { variable, loading })
                .collect(),
        );
    }

    StatField::Value(PcaResult {
        explained_variance_ratio,
        cumulative_variance: cumulative,
        n_components_90_percent,
        component_loadings,
    })
}

/// Classic cyclic Jacobi eigenvalue algorithm for a real symmetric matrix.
/// Returns `(eigenvalues, eigenvectors)` where column `i` of `eigenvectors`
/// is the eigenvector for `eigenvalues[i]`, unordered.
fn jacobi_eigen(matrix: &Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let n = matrix.nrows();
    let mut a = matrix.clone();
    let mut v = Array2::<f64>::eye(n);

    const MAX_SWEEPS: usize = 100;
    const EPSILON: f64 = 1e-12;

    for _ in 0..MAX_SWEEPS {
        let mut off_diag_sum = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off_diag_sum += a[[p, q]].powi(2);
            }
        }
        if off_diag_sum < EPSILON {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                if a[[p, q]].abs() < EPSILON {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * a[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                let app = a[[p, p]];
                let aqq = a[[q, q]];
                let apq = a[[p, q]];

                a[[p, p]] = c * c * app - 2.0 * s * c * apq + s * s * aqq;
                a[[q, q]] = s * s * app + 2.0 * s * c * apq + c * c * aqq;
                a[[p, q]] = 0.0;
                a[[q, p]] = 0.0;

                for i in 0..n {
                    if i != p && i != q {
                        let aip = a[[i, p]];
                        let aiq = a[[i, q]];
                        a[[i, p]] = c * aip - s * aiq;
                        a[[p, i]] = a[[i, p]];
                        a[[i, q]] = s * aip + c * aiq;
                        a[[q, i]] = a[[i, q]];
                    }
                }

                for i in 0..n {
                    let vip = v[[i, p]];
                    let viq = v[[i, q]];
                    v[[i, p]] = c * vip - s * viq;
                    v[[i, q]] = s * vip + c * viq;
                }
            }
        }
    }

    let eigenvalues = (0..n).map(|i| a[[i, i]]).collect();
    (eigenvalues, v)
}

fn compute_clustering(columns: &BTreeMap<String, Vec<f64>>, n: usize) -> StatField<ClusteringResult> {
    if n < MIN_CLUSTERING_N || columns.is_empty() {
        return StatField::insufficient(n, MIN_CLUSTERING_N, "clustering analysis");
    }

    let variables: Vec<String> = columns.keys().cloned().collect();
    let standardized: Vec<Vec<f64>> = variables.iter().map(|v| standardize(&columns[v])).collect();

    let rows: Vec<Vec<f64>> = (0..n)
        .map(|row| standardized.iter().map(|col| col[row]).collect())
        .collect();

    let max_clusters = (n - 1).min(5);
    if max_clusters < 2 {
        return StatField::insufficient(n, MIN_CLUSTERING_N, "clustering analysis (max_clusters < 2)");
    }

    let mut runs = Vec::new();
    for k in 2..=max_clusters {
        let (assignments, centroids) = kmeans(&rows, k, 42 + k as u64);
        let inertia: f64 = rows
            .iter()
            .zip(&assignments)
            .map(|(row, &cluster)| squared_distance(row, &centroids[cluster]))
            .sum();
        let mut sizes = vec![0usize; k];
        for &cluster in &assignments {
            sizes[cluster] += 1;
        }
        runs.push(ClusterK {
            k,
            inertia,
            cluster_sizes: sizes,
        });
    }

    StatField::Value(ClusteringResult { runs })
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Lloyd's-algorithm k-means with a fixed iteration cap, seeded
/// deterministically per call so results are reproducible for a given
/// input.
fn kmeans(rows: &[Vec<f64>], k: usize, seed: u64) -> (Vec<usize>, Vec<Vec<f64>>) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..rows.len()).collect();
    indices.shuffle(&mut rng);
    let mut centroids: Vec<Vec<f64>> = indices[..k].iter().map(|&i| rows[i].clone()).collect();

    let mut assignments = vec![0usize; rows.len()];
    const MAX_ITERS: usize = 100;

    for _ in 0..MAX_ITERS {
        let mut changed = false;
        for (i, row) in rows.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let dist = squared_distance(row, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            if assignments[i] != best {
                changed = true;
            }
            assignments[i] = best;
        }

        let dims = rows[0].len();
        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (row, &cluster) in rows.iter().zip(&assignments) {
            counts[cluster] += 1;
            for d in 0..dims {
                sums[cluster][d] += row[d];
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for d in 0..dims {
                    centroids[c][d] = sums[c][d] / counts[c] as f64;
                }
            }
        }

        if !changed {
            break;
        }
    }

    (assignments, centroids)
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = p * (sorted.len() as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

fn compute_outliers(values: &[f64]) -> StatField<OutlierResult> {
    if values.len() < MIN_OUTLIER_N {
        return StatField::insufficient(values.len(), MIN_OUTLIER_N, "outlier detection");
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let q1 = percentile(&sorted, 0.25);
    let q3 = percentile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lower_bound = q1 - 1.5 * iqr;
    let upper_bound = q3 + 1.5 * iqr;
    let iqr_outliers = values.iter().filter(|v| **v < lower_bound || **v > upper_bound).count();

    let m = mean(values);
    let sd = std_dev(values, 1);
    let zscore_outliers = if sd == 0.0 {
        0
    } else {
        values.iter().filter(|v| ((*v - m) / sd).abs() > 2.0).count()
    };

    let n = values.len();
    StatField::Value(OutlierResult {
        n,
        iqr_outlier_count: iqr_outliers,
        iqr_outlier_percentage: iqr_outliers as f64 / n as f64 * 100.0,
        zscore_outlier_count: zscore_outliers,
        zscore_outlier_percentage: zscore_outliers as f64 / n as f64 * 100.0,
    })
}

fn is_unit_bounded(values: &[f64]) -> bool {
    values.iter().all(|v| (0.0..=1.0).contains(v))
}

/// Hedges' g against the theoretical midpoint (0.5) of a `[0,1]`-bounded
/// scale, with the small-sample bias correction.
fn compute_effect_size(values: &[f64]) -> StatField<EffectSize> {
    if values.len() < MIN_EFFECT_SIZE_N {
        return StatField::insufficient(values.len(), MIN_EFFECT_SIZE_N, "effect size analysis");
    }
    let n = values.len();
    let m = mean(values);
    let sd = std_dev(values, 1);
    let cohens_d = if sd == 0.0 { 0.0 } else { (m - 0.5) / sd };

    let df = (n - 1) as f64;
    let correction_factor = if df > 1.0 { 1.0 - (3.0 / (4.0 * df - 1.0)) } else { 1.0 };
    let hedges_g = cohens_d * correction_factor;

    let magnitude = hedges_g.abs();
    let interpretation = if magnitude < 0.2 {
        "negligible"
    } else if magnitude < 0.5 {
        "small"
    } else if magnitude < 0.8 {
        "medium"
    } else {
        "large"
    };

    StatField::Value(EffectSize {
        n,
        cohens_d,
        hedges_g,
        interpretation: interpretation.to_string(),
        direction: if m >= 0.5 { "above_midpoint" } else { "below_midpoint" }.to_string(),
    })
}

/// Approximate Shapiro-Wilk normality test (Royston's 1995 approximation
/// for the W-to-normal-z transform). Exact small-sample tables are not
/// reproduced; this is adequate for flagging grossly non-normal columns.
fn compute_normality(values: &[f64]) -> StatField<NormalityResult> {
    let n = values.len();
    if n < MIN_NORMALITY_N {
        return StatField::insufficient(n, MIN_NORMALITY_N, "normality test");
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    if ss == 0.0 {
        return StatField::Error {
            error: "zero variance, normality test undefined".to_string(),
            sample_size: n,
            minimum_required: MIN_NORMALITY_N,
            recommendation: "inspect column for constant values".to_string(),
        };
    }

    // Blom's approximation to the expected normal order statistics, used
    // in place of the exact Shapiro-Wilk coefficient tables.
    let weights: Vec<f64> = (1..=n)
        .map(|i| blom_normal_quantile(i, n))
        .collect();
    let weight_norm: f64 = weights.iter().map(|w| w.powi(2)).sum::<f64>().sqrt();
    let normalized_weights: Vec<f64> = weights.iter().map(|w| w / weight_norm).collect();

    let numerator: f64 = sorted.iter().zip(&normalized_weights).map(|(x, w)| x * w).sum::<f64>().powi(2);
    let w_stat = (numerator / ss).clamp(0.0, 1.0);

    let p_value = royston_p_value(w_stat, n);
    StatField::Value(NormalityResult {
        n,
        statistic: w_stat,
        p_value,
        is_normal: p_value > SIGNIFICANCE_P,
    })
}

fn blom_normal_quantile(rank: usize, n: usize) -> f64 {
    let p = (rank as f64 - 0.375) / (n as f64 + 0.25);
    inverse_normal_cdf(p)
}

/// Acklam's rational approximation to the standard normal quantile function.
fn inverse_normal_cdf(p: f64) -> f64 {
    let p = p.clamp(1e-10, 1.0 - 1e-10);
    let a = [
        -3.969_683_028_665_376e+01,
        2.209_460_984_245_205e+02,
        -2.759_285_104_469_687e+02,
        1.383_577_518_672_690e+02,
        -3.066_479_806_614_716e+01,
        2.506_628_277_459_239e+00,
    ];
    let b = [
        -5.447_609_879_822_406e+01,
        1.615_858_368_580_409e+02,
        -1.556_989_798_598_866e+02,
        6.680_131_188_771_972e+01,
        -1.328_068_155_288_572e+01,
    ];
    let c = [
        -7.784_894_002_430_293e-03,
        -3.223_964_580_411_365e-01,
        -2.400_758_277_161_838e+00,
        -2.549_732_539_343_734e+00,
        4.374_664_141_464_968e+00,
        2.938_163_982_698_783e+00,
    ];
    let d = [
        7.784_695_709_041_462e-03,
        3.224_671_290_700_398e-01,
        2.445_134_137_142_996e+00,
        3.754_408_661_907_416e+00,
    ];

    let p_low = 0.02425;
    if p < p_low {
        let q = (-2.0 * p.ln()).sqrt();
        (((((c[0] * q + c[1]) * q + c[2]) * q + c[3]) * q + c[4]) * q + c[5])
            / ((((d[0] * q + d[1]) * q + d[2]) * q + d[3]) * q + 1.0)
    } else if p <= 1.0 - p_low {
        let q = p - 0.5;
        let r = q * q;
        (((((a[0] * r + a[1]) * r + a[2]) * r + a[3]) * r + a[4]) * r + a[5]) * q
            / (((((b[0] * r + b[1]) * r + b[2]) * r + b[3]) * r + b[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((c[0] * q + c[1]) * q + c[2]) * q + c[3]) * q + c[4]) * q + c[5])
            / ((((d[0] * q + d[1]) * q + d[2]) * q + d[3]) * q + 1.0)
    }
}

/// Royston's transform of the W statistic to an approximately standard
/// normal deviate, converted to a two-sided-style p-value via the normal CDF.
fn royston_p_value(w: f64, n: usize) -> f64 {
    use statrs::distribution::{ContinuousCDF, Normal};

    let nf = n as f64;
    let ln_n = nf.ln();
    let mu = -1.5861 - 0.31082 * ln_n - 0.083751 * ln_n.powi(2) + 0.0038915 * ln_n.powi(3);
    let sigma = (-0.4803 - 0.082676 * ln_n + 0.0030302 * ln_n.powi(2)).exp();
    let y = (1.0 - w).max(1e-12).ln();
    let z = (y - mu) / sigma;

    let normal = Normal::new(0.0, 1.0).unwrap_or_else(|_| Normal::standard());
    (1.0 - normal.cdf(z)).clamp(0.0, 1.0)
}

/// Stable content hash of the sorted-keys JSON representation, at the
/// crate's usual full-length hex digest (the source truncates to 12
/// characters; full length is kept here for consistency with the rest of
/// the provenance DAG's hashing convention).
fn content_hash(stats: &Statistics) -> String {
    let mut value = serde_json::to_value(stats).unwrap_or(serde_json::Value::Null);
    if let serde_json::Value::Object(map) = &mut value {
        map.remove("content_hash");
    }
    let bytes = serde_json::to_vec(&value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::DimensionScore;

    fn analysis(document_id: &str, raw: f64) -> AnalysisResult {
        let mut scores = BTreeMap::new();
        scores.insert(
            "populism".to_string(),
            DimensionScore {
                raw,
                salience: 0.5,
                confidence: 0.8,
            },
        );
        scores.insert(
            "care".to_string(),
            DimensionScore {
                raw: 1.0 - raw,
                salience: 0.5,
                confidence: 0.8,
            },
        );
        AnalysisResult {
            document_id: document_id.to_string(),
            document_hash: "dochash".to_string(),
            framework_hash: "fwhash".to_string(),
            model: "test-model".to_string(),
            scores,
            derived_metrics: BTreeMap::new(),
            evidence: Vec::new(),
            fallback_used: None,
        }
    }

    #[test]
    fn test_descriptives_insufficient_on_empty() {
        assert!(matches!(compute_descriptives(&[]), StatField::Error { .. }));
    }

    #[test]
    fn test_correlation_insufficient_below_threshold() {
        let analyses = vec![analysis("a", 0.3), analysis("b", 0.5)];
        let columns = build_columns(&analyses);
        let result = compute_correlation(&columns, analyses.len());
        assert!(matches!(result, StatField::Error { .. }));
    }

    #[test]
    fn test_correlation_runs_with_enough_samples() {
        let analyses = vec![
            analysis("a", 0.1),
            analysis("b", 0.5),
            analysis("c", 0.9),
        ];
        let columns = build_columns(&analyses);
        let result = compute_correlation(&columns, analyses.len());
        assert!(matches!(result, StatField::Value(_)));
    }

    #[test]
    fn test_reliability_requires_two_dimensions_and_three_docs() {
        let analyses = vec![analysis("a", 0.2), analysis("b", 0.5), analysis("c", 0.8)];
        let n = analyses.len();
        let result = compute_reliability(&analyses, n);
        assert!(matches!(result, StatField::Value(_)));
    }

    #[test]
    fn test_pca_requires_two_variables() {
        let analyses = vec![analysis("a", 0.2), analysis("b", 0.5), analysis("c", 0.8)];
        let columns = build_columns(&analyses);
        let result = compute_pca(&columns, analyses.len());
        assert!(matches!(result, StatField::Value(_)));
        if let StatField::Value(pca) = result {
            assert!(!pca.explained_variance_ratio.is_empty());
            assert!(pca.n_components_90_percent >= 1);
        }
    }

    #[test]
    fn test_outliers_flags_extreme_value() {
        let values = vec![0.1, 0.12, 0.11, 0.13, 0.95];
        let result = compute_outliers(&values);
        if let StatField::Value(outliers) = result {
            assert!(outliers.iqr_outlier_count >= 1);
        } else {
            panic!("expected a value");
        }
    }

    #[test]
    fn test_effect_size_direction_above_midpoint() {
        let values = vec![0.7, 0.8, 0.75, 0.9];
        let result = compute_effect_size(&values);
        if let StatField::Value(effect) = result {
            assert_eq!(effect.direction, "above_midpoint");
            assert!(effect.hedges_g > 0.0);
        } else {
            panic!("expected a value");
        }
    }

    #[test]
    fn test_jacobi_eigen_identity_matrix() {
        let identity = Array2::<f64>::eye(3);
        let (eigenvalues, _) = jacobi_eigen(&identity);
        for v in eigenvalues {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_content_hash_is_deterministic_and_full_length() {
        let analyses = vec![analysis("a", 0.2), analysis("b", 0.5), analysis("c", 0.8)];
        let stats = StatisticalProcessor::analyze(&analyses);
        assert_eq!(stats.content_hash.len(), 64);
    }

    #[test]
    fn test_descriptives_includes_quartiles_skew_kurtosis() {
        let values = vec![0.1, 0.2, 0.3, 0.4, 0.5];
        let result = compute_descriptives(&values);
        if let StatField::Value(d) = result {
            assert!((d.q1 - 0.2).abs() < 1e-9);
            assert!((d.q3 - 0.4).abs() < 1e-9);
            // symmetric about the mean: skew should be ~0
            assert!(d.skewness.abs() < 1e-9);
        } else {
            panic!("expected a value");
        }
    }

    #[test]
    fn test_skewness_detects_right_skew() {
        let values = vec![0.1, 0.1, 0.1, 0.2, 0.9];
        assert!(skewness(&values, mean(&values)) > 0.0);
    }

    #[test]
    fn test_evidence_statistics_absent_without_evidence() {
        let analyses = vec![analysis("a", 0.2), analysis("b", 0.5)];
        let stats = StatisticalProcessor::analyze(&analyses);
        assert!(stats.evidence.is_none());
    }

    #[test]
    fn test_evidence_statistics_counts_quotes() {
        use crate::artifact::EvidenceQuote;

        let mut a = analysis("a", 0.2);
        a.evidence = vec![
            EvidenceQuote {
                dimension: "populism".to_string(),
                quote: "the people versus the elites".to_string(),
                source: "a".to_string(),
                offset: None,
            },
            EvidenceQuote {
                dimension: "care".to_string(),
                quote: "short".to_string(),
                source: "a".to_string(),
                offset: None,
            },
        ];
        let b_quote = EvidenceQuote {
            dimension: "populism".to_string(),
            quote: "another populist quote".to_string(),
            source: "b".to_string(),
            offset: None,
        };
        let mut b = analysis("b", 0.5);
        b.evidence = vec![b_quote];

        let stats = StatisticalProcessor::analyze(&[a, b]);
        let evidence = stats.evidence.expect("evidence section present");
        assert_eq!(evidence.total_quotes, 3);
        assert_eq!(evidence.quotes_per_dimension["populism"], 2);
        assert_eq!(evidence.quotes_per_dimension["care"], 1);
        assert_eq!(evidence.quotes_per_document["a"], 2);
        assert_eq!(evidence.quotes_per_document["b"], 1);
        assert!(matches!(evidence.quote_length_chars, StatField::Value(_)));
    }
}
