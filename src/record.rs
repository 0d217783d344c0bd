//! Records flowing through the topology

use crate::value::Value;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A decoded record as delivered to processing stages.
///
/// Carries its position in the upstream log (topic, partition, offset) and
/// the event timestamp assigned by the producer. `key` and `value` are the
/// codec outputs; with the pass-through codec they hold raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Topic this record was consumed from (Arc<str> for O(1) clone).
    pub topic: Arc<str>,
    pub partition: i32,
    pub offset: i64,
    /// Event time (defaults to current server time if not provided).
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub key: Option<Value>,
    pub value: Value,
}

impl Record {
    pub fn new(topic: impl Into<Arc<str>>, value: Value) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            timestamp: Utc::now(),
            key: None,
            value,
        }
    }

    pub fn with_key(mut self, key: Value) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn with_position(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    /// Insert a field into a `Map` value, converting the value to a map first
    /// if it is not one already.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !matches!(self.value, Value::Map(_)) {
            self.value = Value::Map(IndexMap::new());
        }
        if let Value::Map(m) = &mut self.value {
            m.insert(key.into(), value.into());
        }
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.value.get(field)
    }

    pub fn get_float(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_float)
    }

    pub fn get_int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_int)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_builder() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let rec = Record::new("orders", Value::Null)
            .with_field("user", "A")
            .with_field("amount", 10i64)
            .with_key(Value::Str("A".into()))
            .with_timestamp(ts)
            .with_position(2, 41);

        assert_eq!(&*rec.topic, "orders");
        assert_eq!(rec.partition, 2);
        assert_eq!(rec.offset, 41);
        assert_eq!(rec.timestamp, ts);
        assert_eq!(rec.key, Some(Value::Str("A".into())));
        assert_eq!(rec.get_str("user"), Some("A"));
        assert_eq!(rec.get_int("amount"), Some(10));
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let rec = Record::new("orders", Value::Null)
            .with_field("amount", 10i64)
            .with_key(Value::Str("A".into()))
            .with_timestamp(ts)
            .with_position(1, 9);

        let json = serde_json::to_string(&rec).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(&*back.topic, "orders");
        assert_eq!(back.partition, 1);
        assert_eq!(back.offset, 9);
        assert_eq!(back.timestamp, ts);
        assert_eq!(back.key, Some(Value::Str("A".into())));
        assert_eq!(back.get_int("amount"), Some(10));
    }

    #[test]
    fn test_field_accessors_on_non_map() {
        let rec = Record::new("raw", Value::Bytes(vec![1, 2]));
        assert_eq!(rec.get("anything"), None);
        assert_eq!(rec.get_float("anything"), None);
    }

    #[test]
    fn test_with_field_overwrites() {
        let rec = Record::new("t", Value::Null)
            .with_field("k", "first")
            .with_field("k", "second");
        assert_eq!(rec.get_str("k"), Some("second"));
    }
}
