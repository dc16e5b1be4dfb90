use crate::models::report::{ColumnMappingReport, ValidationReport};
use crate::services::column_map::{CanonicalSchema, FieldKind};
use crate::services::dataset::RawTable;

/// Average Gregorian month length, used for day -> month conversion.
const DAYS_PER_MONTH: f64 = 30.44;

/// Dataset after coercion, ready for inference. Feature values are column
/// vectors per row in canonical field order; the identifier column is kept
/// aside as strings.
#[derive(Debug, Clone)]
pub struct CleanDataset {
    /// Canonical names of the feature columns, identifier excluded.
    pub fields: Vec<String>,
    pub ids: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

/// Terminal validation failure; redelivering the same input cannot fix it.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("mandatory columns unmapped: {0}")]
    UnmappedRequired(String),

    #[error("mandatory column '{column}' could not be coerced in any row")]
    UncoercibleColumn { column: String },

    #[error("data quality {score:.3} below configured floor {floor:.3}")]
    QualityBelowFloor { score: f64, floor: f64 },

    #[error("no rows survived validation")]
    NoUsableRows,
}

/// Validate and coerce the mapped dataset.
///
/// Rows with an uncoercible mandatory cell are dropped and counted against
/// the quality score; uncoercible optional cells are imputed to zero. Fails
/// terminally when required columns are unmapped, a mandatory column never
/// coerces, or the quality score falls below `quality_floor`.
pub fn validate_features(
    table: &RawTable,
    report: &ColumnMappingReport,
    schema: &CanonicalSchema,
    quality_floor: f64,
) -> Result<(CleanDataset, ValidationReport), ValidationError> {
    if !report.success {
        return Err(ValidationError::UnmappedRequired(
            report.unmapped_required.join(", "),
        ));
    }

    let index = table.column_index();

    // (canonical field, source column position), identifier separated out
    let mut id_source: Option<usize> = None;
    let mut feature_sources: Vec<(&crate::services::column_map::CanonicalField, usize)> =
        Vec::new();
    for field in &schema.fields {
        let Some(source) = report.source_for(&field.name) else {
            continue; // optional, unmapped
        };
        let Some(&pos) = index.get(source) else {
            continue;
        };
        if matches!(field.kind, FieldKind::Identifier) {
            id_source = Some(pos);
        } else {
            feature_sources.push((field, pos));
        }
    }

    let total_rows = table.rows.len();
    let mut ids = Vec::new();
    let mut rows = Vec::new();
    let mut imputed_cells = 0usize;
    let mut column_ever_coerced = vec![false; feature_sources.len()];

    'rows: for raw_row in &table.rows {
        let id = match id_source {
            Some(pos) => {
                let value = raw_row[pos].trim();
                if value.is_empty() {
                    continue 'rows; // mandatory identifier missing
                }
                value.to_string()
            }
            None => format!("row-{}", rows.len() + 1),
        };

        let mut row = Vec::with_capacity(feature_sources.len());
        for (col, (field, pos)) in feature_sources.iter().enumerate() {
            match coerce(&raw_row[*pos], &field.kind) {
                Some(v) => {
                    column_ever_coerced[col] = true;
                    row.push(v);
                }
                None if field.required => continue 'rows,
                None => {
                    imputed_cells += 1;
                    row.push(0.0);
                }
            }
        }

        ids.push(id);
        rows.push(row);
    }

    for (col, (field, _)) in feature_sources.iter().enumerate() {
        if field.required && !column_ever_coerced[col] {
            return Err(ValidationError::UncoercibleColumn {
                column: field.name.clone(),
            });
        }
    }

    if rows.is_empty() {
        return Err(ValidationError::NoUsableRows);
    }

    let quality_score = rows.len() as f64 / total_rows as f64;
    if quality_score < quality_floor {
        return Err(ValidationError::QualityBelowFloor {
            score: quality_score,
            floor: quality_floor,
        });
    }

    let validation = ValidationReport {
        total_rows,
        kept_rows: rows.len(),
        dropped_rows: total_rows - rows.len(),
        imputed_cells,
        quality_score,
    };

    let clean = CleanDataset {
        fields: feature_sources
            .iter()
            .map(|(f, _)| f.name.clone())
            .collect(),
        ids,
        rows,
    };

    Ok((clean, validation))
}

/// Coerce one cell according to its canonical kind. None means the cell is
/// unusable under that kind.
fn coerce(raw: &str, kind: &FieldKind) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    match kind {
        FieldKind::Identifier => None, // handled separately
        FieldKind::Numeric => raw.parse::<f64>().ok().filter(|v| v.is_finite()),
        FieldKind::Currency => {
            let cleaned: String = raw
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | '%') && !c.is_whitespace())
                .collect();
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        FieldKind::DurationDays => {
            let days = raw.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)?;
            Some(days / DAYS_PER_MONTH)
        }
        FieldKind::Categorical { levels } => {
            let folded = raw.to_lowercase().replace([' ', '-'], "_");
            levels
                .iter()
                .position(|l| l.to_lowercase() == folded)
                .map(|i| i as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::column_map::map_columns;

    fn setup(csv: &[u8]) -> (RawTable, ColumnMappingReport, CanonicalSchema) {
        let schema = CanonicalSchema::churn_default();
        let table = RawTable::from_csv(csv).unwrap();
        let report = map_columns(&table.columns, &schema);
        (table, report, schema)
    }

    #[test]
    fn coerces_currency_strings() {
        let (table, report, schema) =
            setup(b"acct_id,mrr,plan_type\nc1,\"$1,234.50\",one_year\n");
        let (clean, validation) = validate_features(&table, &report, &schema, 0.7).unwrap();

        assert_eq!(validation.kept_rows, 1);
        let charge_col = clean
            .fields
            .iter()
            .position(|f| f == "monthly_charge")
            .unwrap();
        assert!((clean.rows[0][charge_col] - 1234.50).abs() < 1e-9);
    }

    #[test]
    fn converts_duration_days_to_months() {
        let (table, report, schema) =
            setup(b"acct_id,mrr,plan_type,tenure_days\nc1,10,one_year,365\n");
        let (clean, _) = validate_features(&table, &report, &schema, 0.7).unwrap();

        let tenure_col = clean
            .fields
            .iter()
            .position(|f| f == "tenure_days")
            .unwrap();
        assert!((clean.rows[0][tenure_col] - 365.0 / 30.44).abs() < 1e-9);
    }

    #[test]
    fn categorical_levels_fold_case_and_separators() {
        let (table, report, schema) =
            setup(b"acct_id,mrr,plan_type\nc1,10,Month-to-Month\nc2,20,ONE_YEAR\n");
        let (clean, _) = validate_features(&table, &report, &schema, 0.7).unwrap();

        let contract_col = clean
            .fields
            .iter()
            .position(|f| f == "contract_type")
            .unwrap();
        assert_eq!(clean.rows[0][contract_col], 0.0);
        assert_eq!(clean.rows[1][contract_col], 1.0);
    }

    #[test]
    fn rows_with_bad_mandatory_cells_are_dropped() {
        let (table, report, schema) = setup(
            b"acct_id,mrr,plan_type\nc1,10,one_year\nc2,not_a_number,one_year\nc3,30,two_year\n",
        );
        let (clean, validation) = validate_features(&table, &report, &schema, 0.5).unwrap();

        assert_eq!(validation.total_rows, 3);
        assert_eq!(validation.kept_rows, 2);
        assert_eq!(validation.dropped_rows, 1);
        assert_eq!(clean.ids, vec!["c1", "c3"]);
        assert!((validation.quality_score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn quality_below_floor_is_terminal() {
        let (table, report, schema) = setup(
            b"acct_id,mrr,plan_type\nc1,10,one_year\nc2,bad,one_year\nc3,bad,one_year\n",
        );
        let err = validate_features(&table, &report, &schema, 0.7).unwrap_err();
        assert!(matches!(err, ValidationError::QualityBelowFloor { .. }));
    }

    #[test]
    fn unmapped_required_is_terminal() {
        let schema = CanonicalSchema::churn_default();
        let table = RawTable::from_csv(b"acct_id,unrelated\nc1,x\n").unwrap();
        let report = map_columns(&table.columns, &schema);
        let err = validate_features(&table, &report, &schema, 0.7).unwrap_err();
        assert!(matches!(err, ValidationError::UnmappedRequired(_)));
    }

    #[test]
    fn optional_cells_are_imputed_not_dropped() {
        let (table, report, schema) =
            setup(b"acct_id,mrr,plan_type,support_tickets\nc1,10,one_year,oops\n");
        let (clean, validation) = validate_features(&table, &report, &schema, 0.7).unwrap();

        assert_eq!(validation.kept_rows, 1);
        assert_eq!(validation.imputed_cells, 1);
        let tickets_col = clean
            .fields
            .iter()
            .position(|f| f == "support_tickets")
            .unwrap();
        assert_eq!(clean.rows[0][tickets_col], 0.0);
    }

    #[test]
    fn fully_uncoercible_mandatory_column_is_terminal() {
        let (table, report, schema) =
            setup(b"acct_id,mrr,plan_type\nc1,bad,one_year\nc2,worse,two_year\n");
        let err = validate_features(&table, &report, &schema, 0.0).unwrap_err();
        assert!(matches!(err, ValidationError::UncoercibleColumn { .. }));
    }
}
