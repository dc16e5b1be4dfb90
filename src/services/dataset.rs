use std::collections::HashMap;

/// An uploaded dataset parsed into memory: a header and string cells.
/// Interpretation of the cells belongs to the Feature Validator.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    /// Parse CSV bytes. Ragged rows are rejected up front so downstream
    /// stages can index cells by column position.
    pub fn from_csv(data: &[u8]) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(data);

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| DatasetError::Parse(e.to_string()))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        if columns.is_empty() {
            return Err(DatasetError::Empty);
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| DatasetError::Parse(e.to_string()))?;
            if record.len() != columns.len() {
                return Err(DatasetError::Ragged {
                    row: rows.len() + 1,
                    expected: columns.len(),
                    found: record.len(),
                });
            }
            rows.push(record.iter().map(|c| c.to_string()).collect());
        }

        if rows.is_empty() {
            return Err(DatasetError::Empty);
        }

        Ok(Self { columns, rows })
    }

    /// Column name -> position lookup for the validator.
    pub fn column_index(&self) -> HashMap<&str, usize> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to parse CSV: {0}")]
    Parse(String),

    #[error("dataset has no data rows")]
    Empty,

    #[error("row {row} has {found} cells, expected {expected}")]
    Ragged {
        row: usize,
        expected: usize,
        found: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_rows() {
        let table =
            RawTable::from_csv(b"acct_id,mrr,plan_type\nc1,42.0,one_year\nc2,13.5,two_year\n")
                .unwrap();
        assert_eq!(table.columns, vec!["acct_id", "mrr", "plan_type"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1][0], "c2");
    }

    #[test]
    fn trims_cell_whitespace() {
        let table = RawTable::from_csv(b"a,b\n 1 , x \n").unwrap();
        assert_eq!(table.rows[0], vec!["1", "x"]);
    }

    #[test]
    fn empty_dataset_is_rejected() {
        assert!(matches!(
            RawTable::from_csv(b"a,b\n"),
            Err(DatasetError::Empty)
        ));
    }
}
