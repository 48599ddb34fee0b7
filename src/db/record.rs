use chrono::{DateTime, NaiveDate, Utc};
use duckdb::types::{TimeUnit, Value as DuckValue};
use indexmap::IndexMap;
use serde::Serialize;
use std::time::Duration;

/// A single result cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact decimal, kept as text to avoid rounding.
    Decimal(String),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Plain-text rendering for CSV output.
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Decimal(d) | Value::Text(d) => d.clone(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339(),
            Value::Bytes(b) => b.iter().map(|byte| format!("{:02x}", byte)).collect(),
        }
    }
}

fn micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

impl From<DuckValue> for Value {
    fn from(value: DuckValue) -> Self {
        match value {
            DuckValue::Null => Value::Null,
            DuckValue::Boolean(b) => Value::Bool(b),
            DuckValue::TinyInt(i) => Value::Int(i.into()),
            DuckValue::SmallInt(i) => Value::Int(i.into()),
            DuckValue::Int(i) => Value::Int(i.into()),
            DuckValue::BigInt(i) => Value::Int(i),
            DuckValue::HugeInt(i) => i64::try_from(i)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Decimal(i.to_string())),
            DuckValue::UTinyInt(i) => Value::Int(i.into()),
            DuckValue::USmallInt(i) => Value::Int(i.into()),
            DuckValue::UInt(i) => Value::Int(i.into()),
            DuckValue::UBigInt(i) => i64::try_from(i)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Decimal(i.to_string())),
            DuckValue::Float(f) => Value::Float(f.into()),
            DuckValue::Double(f) => Value::Float(f),
            DuckValue::Decimal(d) => Value::Decimal(d.to_string()),
            DuckValue::Text(s) => Value::Text(s),
            DuckValue::Enum(s) => Value::Text(s),
            DuckValue::Blob(b) => Value::Bytes(b),
            DuckValue::Date32(days) => DateTime::from_timestamp(i64::from(days) * 86_400, 0)
                .map(|dt| Value::Date(dt.date_naive()))
                .unwrap_or(Value::Null),
            DuckValue::Timestamp(unit, value) => {
                let us = micros(unit, value);
                DateTime::from_timestamp(us.div_euclid(1_000_000), (us.rem_euclid(1_000_000) * 1_000) as u32)
                    .map(Value::Timestamp)
                    .unwrap_or(Value::Null)
            }
            DuckValue::Time64(unit, value) => {
                let us = micros(unit, value);
                let secs = us / 1_000_000;
                Value::Text(format!(
                    "{:02}:{:02}:{:02}.{:06}",
                    secs / 3600,
                    (secs / 60) % 60,
                    secs % 60,
                    us % 1_000_000
                ))
            }
            other => Value::Text(format!("{:?}", other)),
        }
    }
}

/// One result row: column name to value, in result column order.
pub type Record = IndexMap<String, Value>;

#[derive(Debug, Clone, Serialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub records: Vec<Record>,
    pub row_count: usize,
    /// More rows matched than the configured maximum; only the first
    /// `row_count` are kept.
    pub truncated: bool,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_duck_values() {
        assert_eq!(Value::from(DuckValue::Int(7)), Value::Int(7));
        assert_eq!(Value::from(DuckValue::Null), Value::Null);
        assert_eq!(
            Value::from(DuckValue::Text("Placed".into())),
            Value::Text("Placed".into())
        );
        assert_eq!(
            Value::from(DuckValue::Date32(19_723)),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"))
        );
        assert_eq!(
            Value::from(DuckValue::UBigInt(u64::MAX)),
            Value::Decimal(u64::MAX.to_string())
        );
    }

    #[test]
    fn timestamps_serialize_as_iso8601() {
        let value = Value::from(DuckValue::Timestamp(TimeUnit::Second, 1_704_067_200));
        let json = serde_json::to_string(&value).expect("json");
        assert_eq!(json, "\"2024-01-01T00:00:00Z\"");
        assert_eq!(value.to_plain_string(), "2024-01-01T00:00:00+00:00");
    }
}
