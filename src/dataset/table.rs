//! Columnar, read-only tabular view.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Serialize;

use super::stats::ColumnStats;
use super::value::{infer_column_type, ColumnType, Value};
use super::DatasetId;
use crate::error::DatasetError;

/// A named, typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub dtype: ColumnType,
    pub values: Vec<Value>,
}

impl Column {
    /// Creates a column, inferring its type from the values.
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        let dtype = infer_column_type(&values);
        Self {
            name: name.into(),
            dtype,
            values,
        }
    }
}

/// Lightweight description of a dataset, safe to serialize into metadata.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub dataset_id: DatasetId,
    pub version: u32,
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<ColumnStats>,
}

/// An immutable table of rows × named columns plus precomputed statistics.
///
/// Transformations never mutate a dataset; they build a successor through
/// [`Dataset::next_version`].
#[derive(Debug, Clone)]
pub struct Dataset {
    id: DatasetId,
    version: u32,
    row_count: usize,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    stats: Vec<ColumnStats>,
}

impl Dataset {
    /// Builds a dataset from columns of equal length.
    pub fn new(id: DatasetId, columns: Vec<Column>) -> Result<Self, DatasetError> {
        Self::with_version(id, 1, columns)
    }

    fn with_version(id: DatasetId, version: u32, columns: Vec<Column>) -> Result<Self, DatasetError> {
        let row_count = columns.first().map(|c| c.values.len()).unwrap_or(0);
        let mut index = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            if column.values.len() != row_count {
                return Err(DatasetError::InvalidPayload(format!(
                    "column '{}' has {} values, expected {}",
                    column.name,
                    column.values.len(),
                    row_count
                )));
            }
            if index.insert(column.name.clone(), i).is_some() {
                return Err(DatasetError::InvalidPayload(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
        }
        let stats = columns
            .iter()
            .map(|c| ColumnStats::compute(&c.name, c.dtype, &c.values))
            .collect();

        Ok(Self {
            id,
            version,
            row_count,
            columns,
            index,
            stats,
        })
    }

    /// Builds a dataset from row-major values.
    pub fn from_rows(
        id: DatasetId,
        names: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Result<Self, DatasetError> {
        let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); names.len()];
        for (row_idx, row) in rows.into_iter().enumerate() {
            if row.len() != names.len() {
                return Err(DatasetError::RaggedRow {
                    row: row_idx,
                    expected: names.len(),
                    actual: row.len(),
                });
            }
            for (col, value) in columns.iter_mut().zip(row) {
                col.push(value);
            }
        }
        let columns = names
            .iter()
            .zip(columns)
            .map(|(name, values)| Column::new(*name, values))
            .collect();
        Self::new(id, columns)
    }

    /// Builds a dataset from a JSON array of objects.
    ///
    /// Columns are the union of keys in first-seen order; missing keys are null.
    pub fn from_json_records(id: DatasetId, records: &serde_json::Value) -> Result<Self, DatasetError> {
        let rows = records.as_array().ok_or_else(|| {
            DatasetError::InvalidPayload("expected a JSON array of objects".to_string())
        })?;

        let mut names: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for (i, row) in rows.iter().enumerate() {
            let obj = row.as_object().ok_or_else(|| {
                DatasetError::InvalidPayload(format!("record {} is not an object", i))
            })?;
            for key in obj.keys() {
                if seen.insert(key.clone()) {
                    names.push(key.clone());
                }
            }
        }

        let columns = names
            .iter()
            .map(|name| {
                let values = rows
                    .iter()
                    .map(|row| row.get(name).map(Value::from_json).unwrap_or(Value::Null))
                    .collect();
                Column::new(name.clone(), values)
            })
            .collect();
        Self::new(id, columns)
    }

    /// Reads a JSON records file from disk.
    pub fn load_json_file(id: DatasetId, path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let content = std::fs::read_to_string(path)?;
        let records: serde_json::Value = serde_json::from_str(&content)?;
        Self::from_json_records(id, &records)
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|&i| &self.columns[i])
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn column_at(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn stats(&self) -> &[ColumnStats] {
        &self.stats
    }

    pub fn stats_for(&self, name: &str) -> Option<&ColumnStats> {
        self.index.get(name).map(|&i| &self.stats[i])
    }

    /// Values of one row, in column order.
    pub fn row(&self, row: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c.values[row]).collect()
    }

    /// The first `n` rows as a sample with the same id and version.
    pub fn head(&self, n: usize) -> Dataset {
        if n >= self.row_count {
            return self.clone();
        }
        let columns = self
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                dtype: c.dtype,
                values: c.values[..n].to_vec(),
            })
            .collect();
        // Column lengths are equal by construction.
        Self::with_version(self.id, self.version, columns).unwrap_or_else(|_| self.clone())
    }

    /// Builds the successor version of this dataset from new columns.
    pub fn next_version(&self, columns: Vec<Column>) -> Result<Dataset, DatasetError> {
        Self::with_version(self.id, self.version + 1, columns)
    }

    /// Keeps only the rows whose index satisfies `keep`, as a new version.
    pub fn filter_rows(&self, keep: impl Fn(usize) -> bool) -> Result<Dataset, DatasetError> {
        let selected: Vec<usize> = (0..self.row_count).filter(|&r| keep(r)).collect();
        let columns = self
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                dtype: c.dtype,
                values: selected.iter().map(|&r| c.values[r].clone()).collect(),
            })
            .collect();
        self.next_version(columns)
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            dataset_id: self.id,
            version: self.version,
            row_count: self.row_count,
            column_count: self.columns.len(),
            columns: self.stats.clone(),
        }
    }

    /// Rows rendered as JSON objects, for sample payloads.
    pub fn to_json_records(&self, limit: usize) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = (0..self.row_count.min(limit))
            .map(|r| {
                let obj: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.values[r].to_json()))
                    .collect();
                serde_json::Value::Object(obj)
            })
            .collect();
        serde_json::Value::Array(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> Dataset {
        Dataset::from_rows(
            7,
            &["name", "age"],
            vec![
                vec![Value::Str("ann".into()), Value::Int(31)],
                vec![Value::Str("bob".into()), Value::Null],
                vec![Value::Str("cy".into()), Value::Int(52)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_from_rows_and_stats() {
        let ds = people();
        assert_eq!(ds.row_count(), 3);
        assert_eq!(ds.column("age").unwrap().dtype, ColumnType::Integer);
        assert_eq!(ds.stats_for("age").unwrap().null_count, 1);
        assert_eq!(ds.version(), 1);
    }

    #[test]
    fn test_ragged_row_rejected() {
        let err = Dataset::from_rows(1, &["a", "b"], vec![vec![Value::Int(1)]]).unwrap_err();
        assert!(matches!(err, DatasetError::RaggedRow { row: 0, .. }));
    }

    #[test]
    fn test_from_json_records_unions_keys() {
        let records = serde_json::json!([
            {"id": 1, "email": "a@x.io"},
            {"id": 2, "joined": "2024-01-02"}
        ]);
        let ds = Dataset::from_json_records(3, &records).unwrap();
        assert_eq!(ds.column_names(), vec!["id", "email", "joined"]);
        assert_eq!(ds.column("joined").unwrap().dtype, ColumnType::Date);
        assert!(ds.column("email").unwrap().values[1].is_null());
    }

    #[test]
    fn test_head_and_filter_do_not_mutate() {
        let ds = people();
        let head = ds.head(2);
        assert_eq!(head.row_count(), 2);
        assert_eq!(head.version(), ds.version());

        let filtered = ds.filter_rows(|r| r != 1).unwrap();
        assert_eq!(filtered.row_count(), 2);
        assert_eq!(filtered.version(), 2);
        assert_eq!(ds.row_count(), 3);
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"[{"x": 1.5}, {"x": 2}]"#).unwrap();
        let ds = Dataset::load_json_file(9, &path).unwrap();
        assert_eq!(ds.column("x").unwrap().dtype, ColumnType::Float);
    }
}
