//! Step kinds and their handlers.
//!
//! Every ledger step type maps to a default [`StepKind`]; `params.operation`
//! selects a different one. Handlers never mutate their input: transforms
//! build the successor version of the dataset.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::evaluator::QualityScore;
use crate::dataset::{Column, Dataset, Value};
use crate::error::{ConditionError, DatasetError};
use crate::ledger::{Metadata, StepType};
use crate::rules::{
    Condition, ExecutionSummary, RuleExecutor, RuleRepository, RuleStoreError, SelfCorrectionLoop,
};

/// Default z-score beyond which a value is flagged.
pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 3.0;

/// Default absolute correlation reported by `analyze`.
pub const DEFAULT_CORRELATION_THRESHOLD: f64 = 0.8;

/// Rows sent to the embedding provider unless `params.max_rows` says otherwise.
pub const DEFAULT_EMBEDDING_ROWS: usize = 1000;

const MAX_FLAGGED_ROWS: usize = 10;

/// The closed set of step implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Clean,
    Validate,
    Profile,
    Analyze,
    DetectAnomalies,
    GenerateEmbeddings,
    ComputeQualityScore,
    Enrich,
    BusinessRules,
    CustomTransform,
}

impl StepKind {
    pub const ALL: [StepKind; 10] = [
        StepKind::Clean,
        StepKind::Validate,
        StepKind::Profile,
        StepKind::Analyze,
        StepKind::DetectAnomalies,
        StepKind::GenerateEmbeddings,
        StepKind::ComputeQualityScore,
        StepKind::Enrich,
        StepKind::BusinessRules,
        StepKind::CustomTransform,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Clean => "clean",
            StepKind::Validate => "validate",
            StepKind::Profile => "profile",
            StepKind::Analyze => "analyze",
            StepKind::DetectAnomalies => "detect_anomalies",
            StepKind::GenerateEmbeddings => "generate_embeddings",
            StepKind::ComputeQualityScore => "compute_quality_score",
            StepKind::Enrich => "enrich",
            StepKind::BusinessRules => "business_rules",
            StepKind::CustomTransform => "custom_transform",
        }
    }

    /// Handler a ledger step runs when its params name no operation.
    pub fn for_step_type(step_type: StepType) -> StepKind {
        match step_type {
            StepType::Validate => StepKind::Validate,
            StepType::Transform => StepKind::Clean,
            StepType::Enrich => StepKind::Enrich,
            StepType::Load => StepKind::Profile,
            StepType::BusinessRules => StepKind::BusinessRules,
        }
    }

    /// Resolves the handler for a step from its type and `params.operation`.
    pub fn resolve(step_type: StepType, params: &Metadata) -> Result<StepKind, UnknownStep> {
        match params.get("operation").and_then(JsonValue::as_str) {
            Some(operation) => operation.parse(),
            None => Ok(StepKind::for_step_type(step_type)),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step name outside the closed set of step kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown step '{0}'")]
pub struct UnknownStep(pub String);

impl FromStr for StepKind {
    type Err = UnknownStep;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        StepKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| UnknownStep(s.to_string()))
    }
}

/// Errors raised inside a step handler.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Invalid step parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    RuleStore(#[from] RuleStoreError),

    #[error("{blocking} blocking rule(s) failed validation")]
    Blocked { blocking: usize, summary: ExecutionSummary },
}

impl StepError {
    /// Extra detail worth recording on the failed step.
    pub fn diagnostics(&self) -> Option<JsonValue> {
        match self {
            StepError::Blocked { summary, .. } => serde_json::to_value(summary).ok(),
            _ => None,
        }
    }
}

/// Failure reported by an embedding provider.
#[derive(Debug, Error)]
#[error("Embedding provider error: {0}")]
pub struct EmbeddingError(pub String);

/// Vector embedding service used by `generate_embeddings`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Shared collaborators of the step handlers.
#[derive(Clone)]
pub struct StepContext {
    pub repository: Arc<RuleRepository>,
    pub executor: RuleExecutor,
    pub correction: Arc<SelfCorrectionLoop>,
    pub embeddings: Option<Arc<dyn EmbeddingProvider>>,
    /// Engine for `business_rules` when `params.engine` is absent.
    pub default_engine: String,
}

impl StepContext {
    pub fn new(
        repository: Arc<RuleRepository>,
        executor: RuleExecutor,
        correction: Arc<SelfCorrectionLoop>,
        default_engine: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            executor,
            correction,
            embeddings: None,
            default_engine: default_engine.into(),
        }
    }

    pub fn with_embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }
}

/// What a handler produced.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// The input dataset for read-only steps, a new version for transforms.
    pub dataset: Arc<Dataset>,
    pub metadata: Metadata,
}

impl StepOutput {
    fn unchanged(dataset: Arc<Dataset>, metadata: JsonValue) -> Self {
        Self {
            dataset,
            metadata: into_metadata(metadata),
        }
    }
}

fn into_metadata(value: JsonValue) -> Metadata {
    match value {
        JsonValue::Object(map) => map,
        other => {
            let mut map = Metadata::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

/// Runs the handler for `kind`.
pub async fn run_handler(
    kind: StepKind,
    ctx: &StepContext,
    dataset: Arc<Dataset>,
    params: &Metadata,
) -> Result<StepOutput, StepError> {
    debug!(step = %kind, dataset_id = dataset.id(), version = dataset.version(), "Running step handler");
    match kind {
        StepKind::Clean => clean(dataset, params),
        StepKind::Validate => validate(ctx, dataset, params).await,
        StepKind::Profile => Ok(profile(dataset)),
        StepKind::Analyze => analyze(dataset, params),
        StepKind::DetectAnomalies => detect_anomalies(dataset, params),
        StepKind::GenerateEmbeddings => generate_embeddings(ctx, dataset, params).await,
        StepKind::ComputeQualityScore => Ok(quality_score(dataset)),
        StepKind::Enrich => enrich(dataset, params),
        StepKind::BusinessRules => business_rules(ctx, dataset, params).await,
        StepKind::CustomTransform => custom_transform(dataset, params),
    }
}

fn param_bool(params: &Metadata, key: &str, default: bool) -> bool {
    params.get(key).and_then(JsonValue::as_bool).unwrap_or(default)
}

fn param_f64(params: &Metadata, key: &str, default: f64) -> Result<f64, StepError> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .filter(|x| x.is_finite() && *x > 0.0)
            .ok_or_else(|| StepError::InvalidParams(format!("'{}' must be a positive number", key))),
    }
}

/// Trims text, turns blank strings into nulls, drops all-null rows and
/// (unless `params.dedupe` is false) exact duplicate rows.
fn clean(dataset: Arc<Dataset>, params: &Metadata) -> Result<StepOutput, StepError> {
    let dedupe = param_bool(params, "dedupe", true);
    let mut cells_trimmed = 0usize;
    let mut blanks_nulled = 0usize;

    let columns: Vec<Column> = dataset
        .columns()
        .iter()
        .map(|c| {
            let values = c
                .values
                .iter()
                .map(|v| match v {
                    Value::Str(s) => {
                        let trimmed = s.trim();
                        if trimmed.is_empty() {
                            blanks_nulled += 1;
                            Value::Null
                        } else if trimmed.len() != s.len() {
                            cells_trimmed += 1;
                            Value::Str(trimmed.to_string())
                        } else {
                            v.clone()
                        }
                    }
                    _ => v.clone(),
                })
                .collect();
            Column::new(c.name.clone(), values)
        })
        .collect();
    let normalized = dataset.next_version(columns)?;

    let mut seen = HashSet::new();
    let mut empty_rows = 0usize;
    let mut duplicates = 0usize;
    let mut keep = vec![true; normalized.row_count()];
    for (row, slot) in keep.iter_mut().enumerate() {
        let values = normalized.row(row);
        if values.iter().all(|v| v.is_null()) {
            empty_rows += 1;
            *slot = false;
            continue;
        }
        if dedupe {
            let key: Vec<String> = values.iter().map(|v| v.key()).collect();
            if !seen.insert(key.join("\u{1f}")) {
                duplicates += 1;
                *slot = false;
            }
        }
    }

    let kept: Vec<Column> = normalized
        .columns()
        .iter()
        .map(|c| {
            let values = c
                .values
                .iter()
                .zip(&keep)
                .filter(|(_, k)| **k)
                .map(|(v, _)| v.clone())
                .collect();
            Column::new(c.name.clone(), values)
        })
        .collect();
    let cleaned = dataset.next_version(kept)?;

    info!(
        dataset_id = dataset.id(),
        rows_before = dataset.row_count(),
        rows_after = cleaned.row_count(),
        "Dataset cleaned"
    );
    Ok(StepOutput {
        metadata: into_metadata(json!({
            "rows_before": dataset.row_count(),
            "rows_after": cleaned.row_count(),
            "empty_rows_removed": empty_rows,
            "duplicates_removed": duplicates,
            "cells_trimmed": cells_trimmed,
            "blanks_nulled": blanks_nulled,
            "version": cleaned.version(),
        })),
        dataset: Arc::new(cleaned),
    })
}

/// Runs the dataset's active rules. Fails when a high severity rule fails,
/// unless `params.fail_on_blocking` is false.
async fn validate(ctx: &StepContext, dataset: Arc<Dataset>, params: &Metadata) -> Result<StepOutput, StepError> {
    let rules = ctx.repository.list_for_dataset(dataset.id(), true).await?;
    let results = ctx.executor.execute_all(&rules, Arc::clone(&dataset)).await;
    let summary = ExecutionSummary::from_results(&rules, &results);

    if summary.is_blocked() && param_bool(params, "fail_on_blocking", true) {
        warn!(
            dataset_id = dataset.id(),
            blocking = summary.blocking_failures,
            "Validation blocked by high severity rules"
        );
        return Err(StepError::Blocked {
            blocking: summary.blocking_failures,
            summary,
        });
    }

    let failures: Vec<JsonValue> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| {
            json!({
                "rule_id": r.rule_id,
                "message": r.message,
                "affected_row_count": r.affected_row_count,
                "sample_violations": r.sample_violations,
            })
        })
        .collect();

    Ok(StepOutput::unchanged(
        dataset,
        json!({
            "validation": summary,
            "failures": failures,
        }),
    ))
}

fn profile(dataset: Arc<Dataset>) -> StepOutput {
    let profile = serde_json::to_value(dataset.summary()).unwrap_or(JsonValue::Null);
    StepOutput::unchanged(dataset, json!({ "profile": profile }))
}

fn pearson(xs: &[Value], ys: &[Value]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys)
        .filter_map(|(x, y)| Some((x.as_f64()?, y.as_f64()?)))
        .collect();
    if pairs.len() < 3 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

/// Column-level findings: strong correlations, constant, sparse and
/// identifier-like columns.
fn analyze(dataset: Arc<Dataset>, params: &Metadata) -> Result<StepOutput, StepError> {
    let threshold = param_f64(params, "correlation_threshold", DEFAULT_CORRELATION_THRESHOLD)?;

    let numeric: Vec<&Column> = dataset.columns().iter().filter(|c| c.dtype.is_numeric()).collect();
    let mut correlations = Vec::new();
    for (i, a) in numeric.iter().enumerate() {
        for b in &numeric[i + 1..] {
            if let Some(r) = pearson(&a.values, &b.values) {
                if r.abs() >= threshold {
                    correlations.push(json!({
                        "columns": [a.name, b.name],
                        "r": (r * 1000.0).round() / 1000.0,
                    }));
                }
            }
        }
    }

    let stats = dataset.stats();
    let constant: Vec<&str> = stats
        .iter()
        .filter(|s| s.unique_count == 1)
        .map(|s| s.name.as_str())
        .collect();
    let sparse: Vec<&str> = stats
        .iter()
        .filter(|s| s.completeness() < 0.8)
        .map(|s| s.name.as_str())
        .collect();
    let identifiers: Vec<&str> = stats
        .iter()
        .filter(|s| s.is_unique() && s.null_count == 0 && s.row_count > 1)
        .map(|s| s.name.as_str())
        .collect();

    let findings = json!({
        "analysis": {
            "correlations": correlations,
            "constant_columns": constant,
            "sparse_columns": sparse,
            "identifier_columns": identifiers,
        }
    });
    Ok(StepOutput::unchanged(dataset, findings))
}

/// Flags numeric values whose z-score exceeds `params.threshold`.
fn detect_anomalies(dataset: Arc<Dataset>, params: &Metadata) -> Result<StepOutput, StepError> {
    let threshold = param_f64(params, "threshold", DEFAULT_ANOMALY_THRESHOLD)?;
    let mut anomalies = serde_json::Map::new();
    let mut total = 0usize;

    for (column, stats) in dataset.columns().iter().zip(dataset.stats()) {
        let (Some(mean), Some(std)) = (stats.mean, stats.std) else {
            continue;
        };
        if std <= 0.0 {
            continue;
        }
        let flagged: Vec<usize> = column
            .values
            .iter()
            .enumerate()
            .filter_map(|(row, v)| v.as_f64().map(|x| (row, x)))
            .filter(|(_, x)| ((x - mean) / std).abs() > threshold)
            .map(|(row, _)| row)
            .collect();
        if flagged.is_empty() {
            continue;
        }
        total += flagged.len();
        anomalies.insert(
            column.name.clone(),
            json!({
                "count": flagged.len(),
                "rows": flagged.iter().take(MAX_FLAGGED_ROWS).collect::<Vec<_>>(),
                "mean": mean,
                "std": std,
            }),
        );
    }

    Ok(StepOutput::unchanged(
        dataset,
        json!({
            "anomalies": anomalies,
            "threshold": threshold,
            "total_flagged": total,
        }),
    ))
}

/// Renders one row as `column: value` pairs for embedding.
fn row_text(dataset: &Dataset, row: usize) -> String {
    dataset
        .columns()
        .iter()
        .map(|c| format!("{}: {}", c.name, c.values[row]))
        .collect::<Vec<_>>()
        .join("; ")
}

async fn generate_embeddings(
    ctx: &StepContext,
    dataset: Arc<Dataset>,
    params: &Metadata,
) -> Result<StepOutput, StepError> {
    let Some(provider) = &ctx.embeddings else {
        return Ok(StepOutput::unchanged(
            dataset,
            json!({ "embeddings": { "error": "embedding provider not configured" } }),
        ));
    };

    let max_rows = params
        .get("max_rows")
        .and_then(JsonValue::as_u64)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_EMBEDDING_ROWS);
    let texts: Vec<String> = (0..dataset.row_count().min(max_rows))
        .map(|r| row_text(&dataset, r))
        .collect();

    let metadata = match provider.embed(&texts).await {
        Ok(vectors) => json!({
            "embeddings": {
                "count": vectors.len(),
                "dimensions": vectors.first().map(Vec::len).unwrap_or(0),
            }
        }),
        Err(e) => {
            warn!(dataset_id = dataset.id(), error = %e, "Embedding provider unavailable");
            json!({ "embeddings": { "error": e.to_string() } })
        }
    };
    Ok(StepOutput::unchanged(dataset, metadata))
}

fn quality_score(dataset: Arc<Dataset>) -> StepOutput {
    let score = QualityScore::compute(&dataset);
    StepOutput::unchanged(dataset, json!({ "quality_score": score }))
}

/// Evaluates `expr` for every row into a new column.
fn derive_column(dataset: &Dataset, name: &str, expr: &str) -> Result<Column, StepError> {
    let condition = Condition::parse(expr)?;
    let compiled = condition.bind(dataset)?;
    let values = (0..dataset.row_count())
        .map(|row| compiled.eval_row(row))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Column::new(name, values))
}

fn replace_or_push(columns: &mut Vec<Column>, column: Column) {
    match columns.iter_mut().find(|c| c.name == column.name) {
        Some(existing) => *existing = column,
        None => columns.push(column),
    }
}

/// Reads `params.derive` as `{name: expr}` or `[{name, expr}]`.
fn derive_specs(params: &Metadata) -> Result<Vec<(String, String)>, StepError> {
    match params.get("derive") {
        None => Ok(Vec::new()),
        Some(JsonValue::Object(map)) => map
            .iter()
            .map(|(name, expr)| {
                expr.as_str()
                    .map(|e| (name.clone(), e.to_string()))
                    .ok_or_else(|| StepError::InvalidParams(format!("derive '{}' must be a string", name)))
            })
            .collect(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| {
                let name = item.get("name").and_then(JsonValue::as_str);
                let expr = item.get("expr").and_then(JsonValue::as_str);
                match (name, expr) {
                    (Some(n), Some(e)) => Ok((n.to_string(), e.to_string())),
                    _ => Err(StepError::InvalidParams(
                        "derive entries need 'name' and 'expr'".to_string(),
                    )),
                }
            })
            .collect(),
        Some(_) => Err(StepError::InvalidParams(
            "'derive' must be an object or an array".to_string(),
        )),
    }
}

/// Adds `<col>_year` for date columns and any `params.derive` columns.
fn enrich(dataset: Arc<Dataset>, params: &Metadata) -> Result<StepOutput, StepError> {
    let mut columns = dataset.columns().to_vec();
    let mut added = Vec::new();

    for column in dataset.columns().iter().filter(|c| c.dtype.is_temporal()) {
        let name = format!("{}_year", column.name);
        if dataset.column(&name).is_some() {
            continue;
        }
        let values = column
            .values
            .iter()
            .map(|v| match v.as_date() {
                Some(d) => Value::Int(i64::from(d.year())),
                None => Value::Null,
            })
            .collect();
        columns.push(Column::new(name.clone(), values));
        added.push(name);
    }

    // Derivations see the year columns added above.
    let mut working = dataset.next_version(columns)?;
    for (name, expr) in derive_specs(params)? {
        let column = derive_column(&working, &name, &expr)?;
        let mut columns = working.columns().to_vec();
        replace_or_push(&mut columns, column);
        working = dataset.next_version(columns)?;
        added.push(name);
    }

    Ok(StepOutput {
        metadata: into_metadata(json!({
            "added_columns": added,
            "version": working.version(),
        })),
        dataset: Arc::new(working),
    })
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum TransformOp {
    Filter { condition: String },
    Derive { name: String, expr: String },
    Drop { columns: Vec<String> },
    Rename { from: String, to: String },
}

/// Applies `params.operations` in order; the result is a single new version.
fn custom_transform(dataset: Arc<Dataset>, params: &Metadata) -> Result<StepOutput, StepError> {
    let ops: Vec<TransformOp> = match params.get("operations") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| StepError::InvalidParams(format!("operations: {}", e)))?,
        None => {
            return Err(StepError::InvalidParams(
                "custom_transform requires 'operations'".to_string(),
            ))
        }
    };

    let mut working: Dataset = (*dataset).clone();
    let mut applied = Vec::with_capacity(ops.len());
    for op in &ops {
        working = match op {
            TransformOp::Filter { condition } => {
                let condition = Condition::parse(condition)?;
                let compiled = condition.bind(&working)?;
                let mut keep = Vec::with_capacity(working.row_count());
                for row in 0..working.row_count() {
                    keep.push(compiled.eval_row(row)?.as_bool() == Some(true));
                }
                applied.push(json!({"op": "filter", "rows_kept": keep.iter().filter(|k| **k).count()}));
                working.filter_rows(|r| keep[r])?
            }
            TransformOp::Derive { name, expr } => {
                let column = derive_column(&working, name, expr)?;
                let mut columns = working.columns().to_vec();
                replace_or_push(&mut columns, column);
                applied.push(json!({"op": "derive", "column": name}));
                working.next_version(columns)?
            }
            TransformOp::Drop { columns: names } => {
                if let Some(missing) = names.iter().find(|n| working.column(n).is_none()) {
                    return Err(DatasetError::ColumnNotFound(missing.clone()).into());
                }
                let columns = working
                    .columns()
                    .iter()
                    .filter(|c| !names.contains(&c.name))
                    .cloned()
                    .collect();
                applied.push(json!({"op": "drop", "columns": names}));
                working.next_version(columns)?
            }
            TransformOp::Rename { from, to } => {
                if working.column(from).is_none() {
                    return Err(DatasetError::ColumnNotFound(from.clone()).into());
                }
                if from != to && working.column(to).is_some() {
                    return Err(StepError::InvalidParams(format!("column '{}' already exists", to)));
                }
                let columns = working
                    .columns()
                    .iter()
                    .map(|c| {
                        let mut c = c.clone();
                        if &c.name == from {
                            c.name = to.clone();
                        }
                        c
                    })
                    .collect();
                applied.push(json!({"op": "rename", "from": from, "to": to}));
                working.next_version(columns)?
            }
        };
    }

    let result = dataset.next_version(working.columns().to_vec())?;
    Ok(StepOutput {
        metadata: into_metadata(json!({
            "operations": applied,
            "rows_before": dataset.row_count(),
            "rows_after": result.row_count(),
            "version": result.version(),
        })),
        dataset: Arc::new(result),
    })
}

/// Generates, tests and repairs rules, then persists the accepted ones
/// unless `params.persist` is false.
async fn business_rules(
    ctx: &StepContext,
    dataset: Arc<Dataset>,
    params: &Metadata,
) -> Result<StepOutput, StepError> {
    let engine = params
        .get("engine")
        .and_then(JsonValue::as_str)
        .unwrap_or(&ctx.default_engine)
        .to_string();
    let batch = ctx.correction.run(Arc::clone(&dataset), &engine).await;

    let accepted = if param_bool(params, "persist", true) {
        ctx.repository.accept_batch(&batch).await?
    } else {
        Vec::new()
    };

    let failed: Vec<JsonValue> = batch
        .failed_rules
        .iter()
        .map(|f| {
            json!({
                "name": f.rule.name,
                "condition": f.rule.condition,
                "error": f.error,
                "attempted_correction": f.attempted_correction,
                "correction_error": f.correction_error,
            })
        })
        .collect();
    let by_source: HashMap<&str, usize> = batch.rules.iter().fold(HashMap::new(), |mut acc, r| {
        *acc.entry(r.source.as_str()).or_default() += 1;
        acc
    });

    Ok(StepOutput::unchanged(
        dataset,
        json!({
            "engine_used": batch.engine_used,
            "initial_rules_count": batch.initial_rules_count,
            "failed_rules_count": batch.failed_rules_count,
            "corrected_rules_count": batch.corrected_rules_count,
            "accepted_rule_ids": accepted,
            "rules_by_source": by_source,
            "failed_rules": failed,
            "execution_time_ms": batch.execution_time_ms,
        }),
    ))
}
