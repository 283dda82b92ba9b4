//! Per-column statistics.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::value::{ColumnType, Value};

/// Maximum number of category values retained per column.
pub const MAX_CATEGORIES: usize = 20;

/// A category value and how often it occurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub value: String,
    pub count: usize,
}

/// Summary statistics for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub name: String,
    pub dtype: ColumnType,
    /// Number of rows, nulls included.
    pub row_count: usize,
    pub null_count: usize,
    pub unique_count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
    /// Most frequent values, highest count first; at most [`MAX_CATEGORIES`].
    pub categories: Vec<CategoryCount>,
}

impl ColumnStats {
    /// Computes statistics over a column's values.
    pub fn compute(name: &str, dtype: ColumnType, values: &[Value]) -> Self {
        let row_count = values.len();
        let non_null: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
        let null_count = row_count - non_null.len();

        let mut frequencies: HashMap<String, (String, usize)> = HashMap::new();
        for v in &non_null {
            frequencies
                .entry(v.key())
                .or_insert_with(|| (v.to_string(), 0))
                .1 += 1;
        }
        let unique_count = frequencies.len();

        let numbers: Vec<f64> = non_null.iter().filter_map(|v| v.as_f64()).collect();
        let (min, max, mean, std) = if dtype.is_numeric() && !numbers.is_empty() {
            let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
            let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            (Some(min), Some(max), Some(mean), sample_std(&numbers, mean))
        } else {
            (None, None, None, None)
        };

        // Measured on the rendered value, as `len()` in conditions is.
        let lengths: Vec<usize> = non_null
            .iter()
            .map(|v| v.to_string().chars().count())
            .collect();
        let (min_length, max_length) = if dtype == ColumnType::Text && !lengths.is_empty() {
            (lengths.iter().min().copied(), lengths.iter().max().copied())
        } else {
            (None, None)
        };

        let dates: Vec<NaiveDate> = if dtype.is_temporal() {
            non_null.iter().filter_map(|v| v.as_date()).collect()
        } else {
            Vec::new()
        };

        let mut categories: Vec<CategoryCount> = frequencies
            .into_values()
            .map(|(value, count)| CategoryCount { value, count })
            .collect();
        categories.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        categories.truncate(MAX_CATEGORIES);

        Self {
            name: name.to_string(),
            dtype,
            row_count,
            null_count,
            unique_count,
            min,
            max,
            mean,
            std,
            min_length,
            max_length,
            min_date: dates.iter().min().copied(),
            max_date: dates.iter().max().copied(),
            categories,
        }
    }

    /// Fraction of non-null rows in [0, 1]. An empty column is fully complete.
    pub fn completeness(&self) -> f64 {
        if self.row_count == 0 {
            return 1.0;
        }
        (self.row_count - self.null_count) as f64 / self.row_count as f64
    }

    /// Whether every non-null value is distinct.
    pub fn is_unique(&self) -> bool {
        self.unique_count > 0 && self.unique_count == self.row_count - self.null_count
    }

    /// One-line description used in prompts and classifier inputs.
    pub fn describe(&self) -> String {
        let mut parts = vec![
            format!("type={}", self.dtype),
            format!("nulls={}/{}", self.null_count, self.row_count),
            format!("unique={}", self.unique_count),
        ];
        if let (Some(min), Some(max)) = (self.min, self.max) {
            parts.push(format!("min={}", format_number(min)));
            parts.push(format!("max={}", format_number(max)));
        }
        if let Some(mean) = self.mean {
            parts.push(format!("mean={:.4}", mean));
        }
        if let (Some(lo), Some(hi)) = (self.min_length, self.max_length) {
            parts.push(format!("length={}..{}", lo, hi));
        }
        if let (Some(lo), Some(hi)) = (self.min_date, self.max_date) {
            parts.push(format!("dates={}..{}", lo, hi));
        }
        if !self.categories.is_empty() && self.unique_count <= MAX_CATEGORIES {
            let values: Vec<&str> = self.categories.iter().map(|c| c.value.as_str()).collect();
            parts.push(format!("values=[{}]", values.join(", ")));
        }
        format!("{}: {}", self.name, parts.join(", "))
    }
}

fn sample_std(numbers: &[f64], mean: f64) -> Option<f64> {
    if numbers.len() < 2 {
        return None;
    }
    let variance =
        numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (numbers.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Formats a number without a trailing `.0` when it is integral.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_stats() {
        let values = vec![Value::Int(-5), Value::Int(90), Value::Int(40)];
        let stats = ColumnStats::compute("age", ColumnType::Integer, &values);
        assert_eq!(stats.min, Some(-5.0));
        assert_eq!(stats.max, Some(90.0));
        assert_eq!(stats.null_count, 0);
        assert_eq!(stats.unique_count, 3);
        assert!((stats.mean.unwrap() - 125.0 / 3.0).abs() < 1e-9);
        assert!(stats.std.is_some());
    }

    #[test]
    fn test_text_stats_and_categories() {
        let values = vec![
            Value::Str("a".into()),
            Value::Str("bbb".into()),
            Value::Str("a".into()),
            Value::Null,
        ];
        let stats = ColumnStats::compute("code", ColumnType::Text, &values);
        assert_eq!(stats.min_length, Some(1));
        assert_eq!(stats.max_length, Some(3));
        assert_eq!(stats.null_count, 1);
        assert_eq!(stats.categories[0].value, "a");
        assert_eq!(stats.categories[0].count, 2);
        assert!((stats.completeness() - 0.75).abs() < 1e-9);
        assert!(!stats.is_unique());
    }

    #[test]
    fn test_mixed_text_lengths_use_rendered_values() {
        let values = vec![Value::Str("ab".into()), Value::Int(1234567)];
        let stats = ColumnStats::compute("code", ColumnType::Text, &values);
        assert_eq!(stats.min_length, Some(2));
        assert_eq!(stats.max_length, Some(7));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(-5.0), "-5");
        assert_eq!(format_number(2.5), "2.5");
    }
}
