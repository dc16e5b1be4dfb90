use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which strategy produced a column match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Alias,
    Fuzzy,
}

/// One canonical field's mapping outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMatch {
    pub canonical: String,
    /// Source column name, or None when nothing acceptable was found.
    pub source: Option<String>,
    /// Diagnostic confidence in [0,1]; never used for gating.
    pub confidence: f64,
    pub strategy: Option<MatchStrategy>,
}

/// Output of the Column Mapper, consumed by the Feature Validator.
/// Ephemeral; lives only for one processing attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMappingReport {
    /// One entry per canonical field, in schema order.
    pub mapping: Vec<ColumnMatch>,
    /// Mandatory canonical fields with no acceptable source column.
    pub unmapped_required: Vec<String>,
    pub success: bool,
}

impl ColumnMappingReport {
    pub fn source_for(&self, canonical: &str) -> Option<&str> {
        self.mapping
            .iter()
            .find(|m| m.canonical == canonical)
            .and_then(|m| m.source.as_deref())
    }
}

/// Summary of coercion work done by the Feature Validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_rows: usize,
    pub kept_rows: usize,
    pub dropped_rows: usize,
    /// Optional-field cells that could not be coerced and were imputed.
    pub imputed_cells: usize,
    /// kept_rows / total_rows, in [0,1].
    pub quality_score: f64,
}

/// Per-row model output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowPrediction {
    pub row: usize,
    /// Identifier value from the source dataset for this row.
    pub customer_id: String,
    pub score: f64,
    pub churn: bool,
}

/// Dataset-level roll-up of model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSummary {
    pub model_version: String,
    pub rows: usize,
    pub predicted_churn: usize,
    pub mean_score: f64,
}

/// The result artifact persisted to object storage on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionArtifact {
    pub job_id: Uuid,
    pub summary: PredictionSummary,
    pub validation: ValidationReport,
    pub predictions: Vec<RowPrediction>,
}
