use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::report::{PredictionSummary, RowPrediction};
use crate::services::feature_check::CleanDataset;

/// Trained logistic model artifact, loaded once per worker process.
///
/// Inference is a deterministic pure function of the artifact and the
/// cleaned dataset; training and versioning of the artifact live elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnModel {
    pub model_version: String,
    pub bias: f64,
    /// Per-feature weight, keyed by canonical field name.
    pub weights: HashMap<String, f64>,
    /// Per-level weights for categorical features, keyed by field name then
    /// level index rendered as a string.
    #[serde(default)]
    pub level_weights: HashMap<String, HashMap<String, f64>>,
    /// Score at or above which a row is labeled churn.
    pub threshold: f64,
}

impl ChurnModel {
    pub fn from_json(raw: &str) -> Result<Self, PredictError> {
        let model: ChurnModel = serde_json::from_str(raw).map_err(PredictError::Artifact)?;
        if !(0.0..=1.0).contains(&model.threshold) {
            return Err(PredictError::BadThreshold(model.threshold));
        }
        Ok(model)
    }

    pub fn load(path: &str) -> Result<Self, PredictError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PredictError::Io(path.to_string(), e))?;
        Self::from_json(&raw)
    }

    /// Score every row of the dataset.
    ///
    /// A mapped feature the artifact carries no weight for is a shape
    /// mismatch between model and schema, terminal by contract.
    pub fn predict(
        &self,
        dataset: &CleanDataset,
    ) -> Result<(Vec<RowPrediction>, PredictionSummary), PredictError> {
        let mut weights = Vec::with_capacity(dataset.fields.len());
        for field in &dataset.fields {
            let levels = self.level_weights.get(field);
            let weight = self.weights.get(field).copied();
            if weight.is_none() && levels.is_none() {
                return Err(PredictError::ShapeMismatch {
                    field: field.clone(),
                });
            }
            weights.push((weight.unwrap_or(0.0), levels));
        }

        let mut predictions = Vec::with_capacity(dataset.rows.len());
        let mut score_sum = 0.0;
        let mut predicted_churn = 0usize;

        for (row_idx, row) in dataset.rows.iter().enumerate() {
            let mut z = self.bias;
            for (value, (weight, levels)) in row.iter().zip(&weights) {
                match levels {
                    Some(levels) => {
                        let key = (*value as i64).to_string();
                        z += levels.get(&key).copied().unwrap_or(0.0);
                    }
                    None => z += weight * value,
                }
            }
            let score = sigmoid(z);
            let churn = score >= self.threshold;

            score_sum += score;
            if churn {
                predicted_churn += 1;
            }
            predictions.push(RowPrediction {
                row: row_idx,
                customer_id: dataset.ids[row_idx].clone(),
                score,
                churn,
            });
        }

        let summary = PredictionSummary {
            model_version: self.model_version.clone(),
            rows: predictions.len(),
            predicted_churn,
            mean_score: if predictions.is_empty() {
                0.0
            } else {
                score_sum / predictions.len() as f64
            },
        };

        Ok((predictions, summary))
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("failed to read model artifact {0}: {1}")]
    Io(String, std::io::Error),

    #[error("invalid model artifact: {0}")]
    Artifact(#[source] serde_json::Error),

    #[error("model threshold {0} outside [0,1]")]
    BadThreshold(f64),

    #[error("model carries no weight for mapped feature '{field}'")]
    ShapeMismatch { field: String },
}
