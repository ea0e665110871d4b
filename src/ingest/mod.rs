/// Input side of the pipeline.
///
/// Submodules:
/// - `normalize`: raw rows to canonical `TemporalRecord`s.
/// - `csv_rows`:  raw rows from a CSV export.
/// - `database`:  raw rows from a caller-connected PostgreSQL client.
///
/// Both sources share a `ColumnMap` naming which source column feeds which
/// `RawRow` field.

pub mod csv_rows;
pub mod database;
pub mod normalize;

use serde::{Deserialize, Serialize};

/// Source column names for each `RawRow` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub id_column: String,
    pub timestamp_column: String,
    pub branch_column: String,
    pub description_column: String,
    pub status_column: String,
    /// Numeric duration columns. For CSV input an empty list means "every
    /// column not named above".
    pub duration_columns: Vec<String>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            id_column: "id".to_string(),
            timestamp_column: "timestamp".to_string(),
            branch_column: "branch".to_string(),
            description_column: "description".to_string(),
            status_column: "status".to_string(),
            duration_columns: Vec::new(),
        }
    }
}

impl ColumnMap {
    fn is_named(&self, column: &str) -> bool {
        [
            &self.id_column,
            &self.timestamp_column,
            &self.branch_column,
            &self.description_column,
            &self.status_column,
        ]
        .iter()
        .any(|c| c.as_str() == column)
    }
}
