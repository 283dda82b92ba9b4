//! Typed cell values for the tabular view.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};

/// Logical type of a column, inferred from its non-null values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
    Date,
    DateTime,
    /// Every value in the column is null.
    Empty,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::DateTime)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
            ColumnType::Empty => "empty",
        }
    }

    /// Widens two observed types into one column type.
    fn unify(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Empty, b) => b,
            (a, Empty) => a,
            (Integer, Float) | (Float, Integer) => Float,
            (Date, DateTime) | (DateTime, Date) => DateTime,
            _ => Text,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Empty,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Int(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Float,
            Value::Str(_) => ColumnType::Text,
            Value::Date(_) => ColumnType::Date,
            Value::DateTime(_) => ColumnType::DateTime,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if !f.is_nan() => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Interprets the value as a calendar date, parsing strings when possible.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::DateTime(dt) => Some(dt.date_naive()),
            Value::Str(s) => parse_date(s).map(|dt| dt.date_naive()),
            _ => None,
        }
    }

    /// Interprets the value as an instant, parsing strings when possible.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => d.and_hms_opt(0, 0, 0).map(|n| n.and_utc()),
            Value::DateTime(dt) => Some(*dt),
            Value::Str(s) => parse_date(s),
            _ => None,
        }
    }

    /// Stable key for distinct-value counting.
    pub fn key(&self) -> String {
        match self {
            Value::Null => "\u{0}null".to_string(),
            Value::Bool(b) => format!("b:{}", b),
            Value::Int(i) => format!("n:{}", *i as f64),
            Value::Float(f) => format!("n:{}", f),
            Value::Str(s) => format!("s:{}", s),
            Value::Date(d) => format!("d:{}", d),
            Value::DateTime(dt) => format!("t:{}", dt.to_rfc3339()),
        }
    }

    /// Orders two values of compatible types; `None` when incomparable or null.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (a, b) if a.column_type().is_numeric() && b.column_type().is_numeric() => {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
            // A date covers its whole day.
            (Value::Date(a), b) => Some(a.cmp(&b.as_date()?)),
            (a, Value::Date(b)) => Some(a.as_date()?.cmp(b)),
            (a, b) if a.column_type().is_temporal() || b.column_type().is_temporal() => {
                a.as_datetime()?.partial_cmp(&b.as_datetime()?)
            }
            _ => None,
        }
    }

    /// Converts a JSON scalar into a cell, detecting ISO dates in strings.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => {
                if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                    Value::Date(d)
                } else if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    Value::DateTime(dt.with_timezone(&Utc))
                } else {
                    Value::Str(s.clone())
                }
            }
            other => Value::Str(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}

/// Parses `YYYY-MM-DD` or RFC 3339 text.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Infers the narrowest column type covering every value.
pub fn infer_column_type(values: &[Value]) -> ColumnType {
    values
        .iter()
        .filter(|v| !v.is_null())
        .fold(ColumnType::Empty, |acc, v| acc.unify(v.column_type()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_detects_dates() {
        let v = Value::from_json(&serde_json::json!("2024-03-01"));
        assert_eq!(v, Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));

        let v = Value::from_json(&serde_json::json!("hello"));
        assert_eq!(v, Value::Str("hello".into()));
    }

    #[test]
    fn test_compare_mixed_numeric() {
        assert_eq!(
            Value::Int(3).compare(&Value::Float(2.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Null.compare(&Value::Int(1)), None);
        assert_eq!(Value::Str("a".into()).compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_compare_date_with_string() {
        let d = Value::Date(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        assert_eq!(
            d.compare(&Value::Str("2024-01-05".into())),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_compare_large_integers_exactly() {
        let big = 1i64 << 53;
        assert_eq!(Value::Int(big + 1).compare(&Value::Int(big)), Some(Ordering::Greater));
        assert_eq!(Value::Int(i64::MAX).compare(&Value::Int(i64::MAX - 1)), Some(Ordering::Greater));
    }

    #[test]
    fn test_compare_datetime_with_date_by_day() {
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let afternoon = Value::DateTime(day.and_hms_opt(15, 30, 0).unwrap().and_utc());
        assert_eq!(afternoon.compare(&Value::Date(day)), Some(Ordering::Equal));
        assert_eq!(
            Value::Date(day.succ_opt().unwrap()).compare(&afternoon),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_infer_column_type() {
        assert_eq!(
            infer_column_type(&[Value::Int(1), Value::Null, Value::Float(2.0)]),
            ColumnType::Float
        );
        assert_eq!(
            infer_column_type(&[Value::Int(1), Value::Str("x".into())]),
            ColumnType::Text
        );
        assert_eq!(infer_column_type(&[Value::Null]), ColumnType::Empty);
    }

    #[test]
    fn test_nan_is_null() {
        assert!(Value::Float(f64::NAN).is_null());
        assert_eq!(Value::Float(f64::NAN).as_f64(), None);
    }
}
