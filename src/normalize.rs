//! Training-result normalization.
//!
//! The training backend answers with one of several shapes depending on the
//! model family: flat prefixed fields, nested per-split objects (recurrent
//! networks), an ensemble payload with blend weights, or a
//! category-partitioned payload wrapping any of those per category plus an
//! aggregated view. [`normalize`] folds all of them onto [`TrainingResult`]
//! or [`CategoryPartitionedResult`]. It never fails: missing fields degrade
//! to absent values and an unrecognizable payload yields an empty result
//! carrying a [`ShapeDiagnostic`].

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;

use crate::accuracy::{DisplaySite, SplitAccuracy};
use crate::ensemble::EnsembleWeights;
use crate::logging::log_shape_diagnostic;
use crate::metrics::{read_number, Metric, MetricRecord, Split, SplitMetrics};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Autoregressive,
    SeasonalAutoregressive,
    RecurrentNetwork,
    GradientBoostedTree,
    RandomForest,
    SupportVectorRegressor,
    ExponentialSmoothing,
    AdditiveDecomposition,
    Ensemble,
    Unknown(String),
}

impl ModelFamily {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "arima" | "ar" => ModelFamily::Autoregressive,
            "sarima" | "sarimax" => ModelFamily::SeasonalAutoregressive,
            "lstm" | "gru" | "rnn" => ModelFamily::RecurrentNetwork,
            "xgboost" | "lightgbm" | "gbm" => ModelFamily::GradientBoostedTree,
            "random_forest" | "randomforest" | "rf" => ModelFamily::RandomForest,
            "svr" => ModelFamily::SupportVectorRegressor,
            "ets" | "exponential_smoothing" => ModelFamily::ExponentialSmoothing,
            "prophet" => ModelFamily::AdditiveDecomposition,
            "ensemble" => ModelFamily::Ensemble,
            other => ModelFamily::Unknown(other.to_string()),
        }
    }

    pub fn is_tree_based(&self) -> bool {
        matches!(self, ModelFamily::GradientBoostedTree | ModelFamily::RandomForest)
    }
}

/// Which raw shape a result was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    Flat,
    Recurrent,
    Ensemble,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapeDiagnostic {
    pub reason: String,
    /// Top-level keys of the payload that could not be read.
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureImportance {
    entries: Vec<(String, f64)>,
}

impl FeatureImportance {
    pub fn from_object(obj: &Map<String, Value>) -> Self {
        let mut entries: Vec<(String, f64)> = obj
            .iter()
            .filter_map(|(k, v)| read_number(v).map(|n| (k.clone(), n)))
            .collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Self { entries }
    }

    /// Highest-importance features first.
    pub fn top(&self, n: usize) -> &[(String, f64)] {
        &self.entries[..n.min(self.entries.len())]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoldScore {
    pub fold: u32,
    pub scores: MetricRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossValidationSummary {
    pub mean: MetricRecord,
    pub std: MetricRecord,
    pub folds: Vec<FoldScore>,
}

impl CrossValidationSummary {
    /// `None` unless the backend marked the run successful.
    pub fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        if obj.get("success").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        let record = |key: &str| {
            obj.get(key)
                .and_then(Value::as_object)
                .map(MetricRecord::from_object)
                .unwrap_or_default()
        };
        let folds = obj
            .get("fold_scores")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .enumerate()
                    .filter_map(|(i, f)| {
                        let f = f.as_object()?;
                        let fold = f
                            .get("fold")
                            .and_then(Value::as_u64)
                            .map(|n| n as u32)
                            .unwrap_or(i as u32 + 1);
                        Some(FoldScore { fold, scores: MetricRecord::from_object(f) })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { mean: record("mean_scores"), std: record("std_scores"), folds })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakageIssue {
    pub message: String,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakageReport {
    pub has_leakage: bool,
    pub critical: Vec<LeakageIssue>,
    pub warnings: Vec<LeakageIssue>,
}

impl LeakageReport {
    pub fn from_object(obj: &Map<String, Value>) -> Self {
        let issues = |key: &str| -> Vec<LeakageIssue> {
            obj.get(key)
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|i| match i {
                            Value::String(s) => Some(LeakageIssue { message: s.clone(), fix: None }),
                            Value::Object(o) => Some(LeakageIssue {
                                message: o.get("message")?.as_str()?.to_string(),
                                fix: o.get("fix").and_then(Value::as_str).map(str::to_string),
                            }),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            has_leakage: obj.get("has_leakage").and_then(Value::as_bool).unwrap_or(false),
            critical: issues("critical_issues"),
            warnings: issues("warnings"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingHistory {
    pub loss: Vec<f64>,
    pub val_loss: Vec<f64>,
}

impl TrainingHistory {
    pub fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        let series = |key: &str| -> Vec<f64> {
            obj.get(key)
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(read_number).collect())
                .unwrap_or_default()
        };
        let loss = series("loss");
        if loss.is_empty() {
            return None;
        }
        Some(Self { loss, val_loss: series("val_loss") })
    }

    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    /// 1-based epoch with the lowest validation loss.
    pub fn best_epoch(&self) -> Option<usize> {
        self.val_loss
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingResult {
    pub family: ModelFamily,
    pub shape: ResultShape,
    pub metrics: SplitMetrics,
    pub ensemble_weights: Option<EnsembleWeights>,
    pub feature_importance: Option<FeatureImportance>,
    pub cross_validation: Option<CrossValidationSummary>,
    pub leakage: Option<LeakageReport>,
    pub history: Option<TrainingHistory>,
    pub model_filename: Option<String>,
    pub order: Option<Vec<i64>>,
    pub seasonal_order: Option<Vec<i64>>,
    /// Backend-computed overall accuracy (aggregated views only).
    pub overall_accuracy: Option<f64>,
    pub diagnostic: Option<ShapeDiagnostic>,
}

impl TrainingResult {
    pub fn empty(family: ModelFamily) -> Self {
        Self {
            family,
            shape: ResultShape::Empty,
            metrics: SplitMetrics::new(),
            ensemble_weights: None,
            feature_importance: None,
            cross_validation: None,
            leakage: None,
            history: None,
            model_filename: None,
            order: None,
            seasonal_order: None,
            overall_accuracy: None,
            diagnostic: None,
        }
    }

    pub fn display_site(&self) -> DisplaySite {
        match self.shape {
            ResultShape::Recurrent => DisplaySite::Recurrent,
            ResultShape::Ensemble => DisplaySite::Ensemble,
            ResultShape::Flat | ResultShape::Empty => DisplaySite::SingleModel,
        }
    }

    /// Accuracy per split as shown for a top-level result.
    pub fn accuracy(&self) -> SplitAccuracy {
        SplitAccuracy::derive(&self.metrics, self.display_site())
    }

    pub fn accuracy_at(&self, site: DisplaySite) -> SplitAccuracy {
        SplitAccuracy::derive(&self.metrics, site)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryOutcome {
    Trained(Box<TrainingResult>),
    Failed { error: String, rows: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryPartitionedResult {
    pub family: ModelFamily,
    pub category_column: Option<String>,
    pub categories: Vec<String>,
    outcomes: Vec<(String, CategoryOutcome)>,
    pub aggregated: Option<TrainingResult>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl CategoryPartitionedResult {
    pub fn outcome(&self, category: &str) -> Option<&CategoryOutcome> {
        self.outcomes.iter().find(|(c, _)| c == category).map(|(_, o)| o)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (&str, &CategoryOutcome)> {
        self.outcomes.iter().map(|(c, o)| (c.as_str(), o))
    }

    pub fn trained(&self) -> impl Iterator<Item = (&str, &TrainingResult)> {
        self.outcomes.iter().filter_map(|(c, o)| match o {
            CategoryOutcome::Trained(r) => Some((c.as_str(), r.as_ref())),
            CategoryOutcome::Failed { .. } => None,
        })
    }

    pub fn all_trained(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, o)| matches!(o, CategoryOutcome::Trained(_)))
    }

    /// Accuracy for one category's summary card.
    pub fn category_accuracy(&self, category: &str) -> Option<SplitAccuracy> {
        match self.outcome(category)? {
            CategoryOutcome::Trained(r) => {
                let site = if r.shape == ResultShape::Recurrent {
                    DisplaySite::CategoryRecurrent
                } else {
                    DisplaySite::Category
                };
                Some(r.accuracy_at(site))
            }
            CategoryOutcome::Failed { .. } => None,
        }
    }

    pub fn aggregated_accuracy(&self) -> Option<SplitAccuracy> {
        let agg = self.aggregated.as_ref()?;
        Some(agg.accuracy_at(DisplaySite::Aggregated).or_overall(agg.overall_accuracy))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedResult {
    Single(TrainingResult),
    Partitioned(CategoryPartitionedResult),
}

impl NormalizedResult {
    /// Set when the payload could not be read; the caller may show raw output.
    pub fn diagnostic(&self) -> Option<&ShapeDiagnostic> {
        match self {
            NormalizedResult::Single(r) => r.diagnostic.as_ref(),
            NormalizedResult::Partitioned(_) => None,
        }
    }

    pub fn family(&self) -> &ModelFamily {
        match self {
            NormalizedResult::Single(r) => &r.family,
            NormalizedResult::Partitioned(p) => &p.family,
        }
    }
}

/// Strip the `{status, data}` envelope if present.
fn payload_of(raw: &Value) -> &Value {
    match raw {
        Value::Object(obj) if obj.contains_key("status") => match obj.get("data") {
            Some(data @ Value::Object(_)) => data,
            _ => raw,
        },
        _ => raw,
    }
}

fn label_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn int_list(v: Option<&Value>) -> Option<Vec<i64>> {
    match v? {
        Value::Array(arr) => Some(arr.iter().filter_map(Value::as_i64).collect()),
        Value::Number(n) => n.as_i64().map(|i| vec![i]),
        _ => None,
    }
}

/// Bare `mae`/`r2`/`aic`... fields describe the training fit.
fn fold_bare_fields(metrics: &mut SplitMetrics, obj: &Map<String, Value>) {
    let mut bare = MetricRecord::default();
    for metric in Metric::ALL {
        bare.set(metric, obj.get(metric.key()).and_then(read_number));
    }
    if bare.is_empty() {
        return;
    }
    let mut train = metrics.get(Split::Train).copied().unwrap_or_default();
    train.fill_missing(&bare);
    metrics.insert(Split::Train, train);
}

/// Flat fields take precedence over nested objects, matching how the
/// backend fills both when it does.
fn read_split_metrics(obj: &Map<String, Value>) -> SplitMetrics {
    let mut metrics = SplitMetrics::from_flat(obj);
    metrics.fill_missing(&SplitMetrics::from_nested(obj));
    fold_bare_fields(&mut metrics, obj);
    metrics
}

fn top_keys(obj: &Map<String, Value>) -> Vec<String> {
    obj.keys().cloned().collect()
}

fn normalize_single(obj: &Map<String, Value>, inherited: Option<&ModelFamily>) -> TrainingResult {
    let family = obj
        .get("model_type")
        .and_then(Value::as_str)
        .map(ModelFamily::from_tag)
        .or_else(|| inherited.cloned())
        .unwrap_or_else(|| ModelFamily::Unknown(String::new()));

    let mut result = TrainingResult::empty(family.clone());

    match obj.get("metrics").and_then(Value::as_object) {
        Some(m) if SplitMetrics::has_nested_shape(m) => {
            result.shape = ResultShape::Recurrent;
            result.metrics = read_split_metrics(m);
        }
        Some(m) if family == ModelFamily::Ensemble => {
            result.shape = ResultShape::Ensemble;
            let mut metrics = read_split_metrics(m);
            metrics.remove(Split::Train);
            result.metrics = metrics;
        }
        Some(m) => {
            result.metrics = read_split_metrics(m);
            if result.metrics.is_empty() {
                result.diagnostic = Some(ShapeDiagnostic {
                    reason: "metrics object has no recognized fields".to_string(),
                    keys: top_keys(m),
                });
            } else {
                result.shape = ResultShape::Flat;
            }
        }
        None => {
            result.diagnostic = Some(ShapeDiagnostic {
                reason: "payload has no metrics".to_string(),
                keys: top_keys(obj),
            });
        }
    }

    if family == ModelFamily::Ensemble {
        if let Some(weights) = obj.get("weights").and_then(Value::as_object) {
            let models = obj.get("ensemble_models").and_then(Value::as_object);
            result.ensemble_weights = Some(EnsembleWeights::from_reported(weights, models));
        }
    }

    result.feature_importance = obj
        .get("feature_importance")
        .and_then(Value::as_object)
        .map(FeatureImportance::from_object)
        .filter(|f| !f.is_empty());
    result.cross_validation = obj
        .get("cross_validation")
        .and_then(Value::as_object)
        .and_then(CrossValidationSummary::from_object);
    result.leakage = obj
        .get("leakage_check")
        .and_then(Value::as_object)
        .map(LeakageReport::from_object);
    result.history = obj
        .get("training_history")
        .and_then(Value::as_object)
        .and_then(TrainingHistory::from_object);
    result.model_filename = obj
        .get("model_filename")
        .and_then(Value::as_str)
        .map(str::to_string);
    result.order = int_list(obj.get("order"));
    result.seasonal_order = int_list(obj.get("seasonal_order"));

    if let Some(diag) = &result.diagnostic {
        log_shape_diagnostic(&diag.reason, &diag.keys);
    }
    result
}

fn normalize_aggregated(agg: &Map<String, Value>, family: &ModelFamily) -> Option<TrainingResult> {
    if agg.is_empty() {
        return None;
    }
    let metrics = read_split_metrics(agg);
    let mut result = TrainingResult::empty(family.clone());
    result.shape = if SplitMetrics::has_nested_shape(agg) {
        ResultShape::Recurrent
    } else {
        ResultShape::Flat
    };
    result.metrics = metrics;
    result.overall_accuracy = agg.get("overall_accuracy").and_then(read_number);
    Some(result)
}

fn normalize_partitioned(
    obj: &Map<String, Value>,
    categories: &[Value],
    results: &Map<String, Value>,
) -> CategoryPartitionedResult {
    let family = obj
        .get("model_type")
        .and_then(Value::as_str)
        .map(ModelFamily::from_tag)
        .unwrap_or_else(|| ModelFamily::Unknown(String::new()));

    let labels: Vec<String> = categories.iter().map(label_of).collect();
    let outcomes: Vec<(String, CategoryOutcome)> = labels
        .iter()
        .map(|label| {
            let outcome = match results.get(label).and_then(Value::as_object) {
                Some(entry) if entry.contains_key("error") => CategoryOutcome::Failed {
                    error: entry.get("error").map(label_of).unwrap_or_default(),
                    rows: entry.get("rows").and_then(Value::as_u64),
                },
                Some(entry) => CategoryOutcome::Trained(Box::new(normalize_single(entry, Some(&family)))),
                None => CategoryOutcome::Failed {
                    error: "no result returned for category".to_string(),
                    rows: None,
                },
            };
            (label.clone(), outcome)
        })
        .collect();

    let successful_seen = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, CategoryOutcome::Trained(_)))
        .count();
    let count = |key: &str, fallback: usize| {
        obj.get(key)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(fallback)
    };

    CategoryPartitionedResult {
        category_column: obj
            .get("category_column")
            .and_then(Value::as_str)
            .map(str::to_string),
        aggregated: obj
            .get("aggregated_metrics")
            .and_then(Value::as_object)
            .and_then(|agg| normalize_aggregated(agg, &family)),
        total: count("total_categories", labels.len()),
        successful: count("successful_categories", successful_seen),
        failed: count("failed_categories", labels.len() - successful_seen),
        categories: labels,
        outcomes,
        family,
    }
}

/// Fold any supported training payload onto the canonical model.
pub fn normalize(raw: &Value) -> NormalizedResult {
    let payload = payload_of(raw);
    let obj = match payload.as_object() {
        Some(obj) => obj,
        None => {
            let mut empty = TrainingResult::empty(ModelFamily::Unknown(String::new()));
            empty.diagnostic = Some(ShapeDiagnostic {
                reason: "payload is not a JSON object".to_string(),
                keys: Vec::new(),
            });
            log_shape_diagnostic("payload is not a JSON object", &[]);
            return NormalizedResult::Single(empty);
        }
    };

    match (obj.get("categories"), obj.get("category_results")) {
        (Some(Value::Array(categories)), Some(Value::Object(results))) => {
            NormalizedResult::Partitioned(normalize_partitioned(obj, categories, results))
        }
        _ => NormalizedResult::Single(normalize_single(obj, None)),
    }
}

/// Read a saved training response from disk.
pub fn load_payload(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(value)
}
