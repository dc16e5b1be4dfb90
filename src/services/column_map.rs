use serde::{Deserialize, Serialize};
use strsim::{jaro_winkler, levenshtein};

use crate::models::report::{ColumnMappingReport, ColumnMatch, MatchStrategy};

/// Maximum edit distance a fuzzy match may have on normalized names.
const FUZZY_MAX_DISTANCE: usize = 2;

/// How a canonical field's values are interpreted downstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Opaque row identifier, kept as a string.
    Identifier,
    Numeric,
    /// Numeric with currency decoration ("$1,234.50") tolerated.
    Currency,
    /// Duration expressed in days, converted to months downstream.
    DurationDays,
    Categorical { levels: Vec<String> },
}

/// One feature the model requires, with its curated synonyms in priority
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalField {
    pub name: String,
    pub required: bool,
    pub kind: FieldKind,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// The fixed feature schema the Prediction Engine expects, independent of
/// how any source dataset named its columns. JSON-loadable so deployments
/// can extend the alias table without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalSchema {
    pub fields: Vec<CanonicalField>,
}

impl CanonicalSchema {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn load(path: &str) -> Result<Self, SchemaError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SchemaError::Io(path.to_string(), e))?;
        Ok(Self::from_json(&raw)?)
    }

    pub fn field(&self, name: &str) -> Option<&CanonicalField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Built-in churn feature schema.
    pub fn churn_default() -> Self {
        fn field(
            name: &str,
            required: bool,
            kind: FieldKind,
            aliases: &[&str],
        ) -> CanonicalField {
            CanonicalField {
                name: name.to_string(),
                required,
                kind,
                aliases: aliases.iter().map(|s| s.to_string()).collect(),
            }
        }

        CanonicalSchema {
            fields: vec![
                field(
                    "customer_id",
                    true,
                    FieldKind::Identifier,
                    &["acct_id", "account_id", "cust_id", "customer", "user_id"],
                ),
                field(
                    "monthly_charge",
                    true,
                    FieldKind::Currency,
                    &["mrr", "monthly_revenue", "monthly_fee", "monthly_cost"],
                ),
                field(
                    "contract_type",
                    true,
                    FieldKind::Categorical {
                        levels: vec![
                            "month_to_month".to_string(),
                            "one_year".to_string(),
                            "two_year".to_string(),
                        ],
                    },
                    &["plan_type", "contract", "plan", "subscription_type"],
                ),
                field(
                    "tenure_days",
                    false,
                    FieldKind::DurationDays,
                    &["days_active", "customer_age_days", "tenure"],
                ),
                field(
                    "total_charges",
                    false,
                    FieldKind::Currency,
                    &["lifetime_value", "total_revenue"],
                ),
                field(
                    "support_tickets",
                    false,
                    FieldKind::Numeric,
                    &["tickets", "support_calls", "num_tickets"],
                ),
            ],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to read schema file {0}: {1}")]
    Io(String, std::io::Error),

    #[error("invalid schema JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Casefold and strip whitespace/hyphen/underscore so "Monthly-Charge",
/// "monthly charge" and "monthly_charge" all compare equal.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Map raw dataset columns onto the canonical schema.
///
/// Per field: exact case-insensitive match, then alias lookup, then a
/// normalized fuzzy match. Each raw column is consumed by at most one field;
/// fields are resolved in schema order. Fuzzy ties break by lowest edit
/// distance, then alias priority, then original column order, so the result
/// is a pure function of its inputs.
pub fn map_columns(raw_columns: &[String], schema: &CanonicalSchema) -> ColumnMappingReport {
    let mut consumed = vec![false; raw_columns.len()];
    let mut mapping = Vec::with_capacity(schema.fields.len());
    let mut unmapped_required = Vec::new();

    for field in &schema.fields {
        let found = match_field(field, raw_columns, &consumed);

        match found {
            Some((idx, confidence, strategy)) => {
                consumed[idx] = true;
                mapping.push(ColumnMatch {
                    canonical: field.name.clone(),
                    source: Some(raw_columns[idx].clone()),
                    confidence,
                    strategy: Some(strategy),
                });
            }
            None => {
                if field.required {
                    unmapped_required.push(field.name.clone());
                }
                mapping.push(ColumnMatch {
                    canonical: field.name.clone(),
                    source: None,
                    confidence: 0.0,
                    strategy: None,
                });
            }
        }
    }

    ColumnMappingReport {
        success: unmapped_required.is_empty(),
        mapping,
        unmapped_required,
    }
}

fn match_field(
    field: &CanonicalField,
    raw_columns: &[String],
    consumed: &[bool],
) -> Option<(usize, f64, MatchStrategy)> {
    let free = |idx: &usize| !consumed[*idx];

    // (a) exact, case-insensitive, first column wins
    let target = field.name.to_lowercase();
    if let Some(idx) = (0..raw_columns.len())
        .filter(free)
        .find(|&i| raw_columns[i].to_lowercase() == target)
    {
        return Some((idx, 1.0, MatchStrategy::Exact));
    }

    // (b) alias table, priority order, normalized equality
    for alias in &field.aliases {
        let alias_norm = normalize(alias);
        if let Some(idx) = (0..raw_columns.len())
            .filter(free)
            .find(|&i| normalize(&raw_columns[i]) == alias_norm)
        {
            return Some((idx, 1.0, MatchStrategy::Alias));
        }
    }

    // (c) fuzzy over canonical name and aliases; ties break by distance,
    // then target priority (name before aliases), then column order
    let mut targets = vec![normalize(&field.name)];
    targets.extend(field.aliases.iter().map(|a| normalize(a)));

    let mut best: Option<(usize, usize, usize, f64)> = None; // (dist, target, col, confidence)
    for (target_priority, target) in targets.iter().enumerate() {
        for idx in (0..raw_columns.len()).filter(free) {
            let candidate = normalize(&raw_columns[idx]);
            let dist = levenshtein(&candidate, target);
            if dist > FUZZY_MAX_DISTANCE || dist * 2 > target.len() {
                continue;
            }
            let key = (dist, target_priority, idx);
            if best.map_or(true, |(d, t, c, _)| key < (d, t, c)) {
                best = Some((dist, target_priority, idx, jaro_winkler(&candidate, target)));
            }
        }
    }

    best.map(|(_, _, idx, confidence)| (idx, confidence, MatchStrategy::Fuzzy))
}
