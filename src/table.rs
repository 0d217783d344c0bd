//! Windowed keyed tables
//!
//! A [`Table`] folds an upstream record stream into keyed, windowed
//! accumulators and answers point lookups by key. All expiry decisions are
//! driven by the maximum event time the table has observed, never the wall
//! clock, so replay and backfill produce the same state as live consumption.
//!
//! Each fold also emits the key's merged aggregate as a change record, which
//! makes a table usable as an upstream for further stages (joins in
//! particular).

use crate::record::Record;
use crate::service::{Lifecycle, Service};
use crate::source::{channel_subscriber, RecordSink, Streamable};
use crate::value::Value;
use async_trait::async_trait;
use chrono::Duration;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Time window specification. Buckets are aligned to multiples of `step`
/// and cover `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    size: Duration,
    step: Duration,
}

impl WindowSpec {
    /// Non-overlapping consecutive buckets of `size`.
    pub fn tumbling(size: Duration) -> Self {
        Self { size, step: size }
    }

    /// Overlapping buckets of `size`, opening every `step`. One record may
    /// fall into several buckets.
    pub fn sliding(size: Duration, step: Duration) -> Self {
        Self { size, step }
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn is_tumbling(&self) -> bool {
        self.size == self.step
    }

    /// A window is usable when both durations are positive and sliding steps
    /// do not leave gaps between buckets.
    pub fn is_valid(&self) -> bool {
        self.size > Duration::zero() && self.step > Duration::zero() && self.step <= self.size
    }

    /// Start times (ms since epoch) of every bucket containing `ts_ms`.
    /// Exactly one for tumbling windows.
    pub fn bucket_starts(&self, ts_ms: i64) -> Vec<i64> {
        let size = self.size.num_milliseconds();
        let step = self.step.num_milliseconds();
        // Greatest k with k*step <= ts, least k with k*step + size > ts.
        let last = ts_ms.div_euclid(step);
        let first = (ts_ms - size).div_euclid(step) + 1;
        (first..=last).map(|k| k * step).collect()
    }
}

/// Reduction of records into per-bucket accumulators.
///
/// `fold` incorporates one record into a bucket's accumulator. `merge`
/// combines two bucket accumulators and **must be associative and
/// commutative**: lookups over sliding windows (and any window spanning
/// several live buckets) merge accumulators in arbitrary order. This is a
/// contract on the implementation, not something the table verifies.
pub trait Reducer: Send + Sync {
    fn fold(&self, acc: Option<Value>, record: &Record) -> Value;

    fn merge(&self, a: Value, b: Value) -> Value;
}

/// Counts records per key.
pub struct Count;

impl Reducer for Count {
    fn fold(&self, acc: Option<Value>, _record: &Record) -> Value {
        Value::Int(acc.as_ref().and_then(Value::as_int).unwrap_or(0) + 1)
    }

    fn merge(&self, a: Value, b: Value) -> Value {
        Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
    }
}

/// Sums a numeric field per key. Records without the field contribute 0.
pub struct Sum {
    field: String,
}

impl Sum {
    pub fn of(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl Reducer for Sum {
    fn fold(&self, acc: Option<Value>, record: &Record) -> Value {
        let current = acc.as_ref().and_then(Value::as_float).unwrap_or(0.0);
        Value::Float(current + record.get_float(&self.field).unwrap_or(0.0))
    }

    fn merge(&self, a: Value, b: Value) -> Value {
        Value::Float(a.as_float().unwrap_or(0.0) + b.as_float().unwrap_or(0.0))
    }
}

/// Minimum of a numeric field per key.
pub struct Min {
    field: String,
}

impl Min {
    pub fn of(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl Reducer for Min {
    fn fold(&self, acc: Option<Value>, record: &Record) -> Value {
        let observed = record.get_float(&self.field);
        match (acc.as_ref().and_then(Value::as_float), observed) {
            (Some(a), Some(v)) => Value::Float(a.min(v)),
            (Some(a), None) => Value::Float(a),
            (None, Some(v)) => Value::Float(v),
            (None, None) => Value::Null,
        }
    }

    fn merge(&self, a: Value, b: Value) -> Value {
        match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => Value::Float(x.min(y)),
            (Some(x), None) => Value::Float(x),
            (None, Some(y)) => Value::Float(y),
            (None, None) => Value::Null,
        }
    }
}

/// Maximum of a numeric field per key.
pub struct Max {
    field: String,
}

impl Max {
    pub fn of(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl Reducer for Max {
    fn fold(&self, acc: Option<Value>, record: &Record) -> Value {
        let observed = record.get_float(&self.field);
        match (acc.as_ref().and_then(Value::as_float), observed) {
            (Some(a), Some(v)) => Value::Float(a.max(v)),
            (Some(a), None) => Value::Float(a),
            (None, Some(v)) => Value::Float(v),
            (None, None) => Value::Null,
        }
    }

    fn merge(&self, a: Value, b: Value) -> Value {
        match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => Value::Float(x.max(y)),
            (Some(x), None) => Value::Float(x),
            (None, Some(y)) => Value::Float(y),
            (None, None) => Value::Null,
        }
    }
}

/// Closure-backed reducer for one-off aggregations.
pub struct FnReducer<F, M> {
    fold_fn: F,
    merge_fn: M,
}

impl<F, M> FnReducer<F, M>
where
    F: Fn(Option<Value>, &Record) -> Value + Send + Sync,
    M: Fn(Value, Value) -> Value + Send + Sync,
{
    pub fn new(fold_fn: F, merge_fn: M) -> Self {
        Self { fold_fn, merge_fn }
    }
}

impl<F, M> Reducer for FnReducer<F, M>
where
    F: Fn(Option<Value>, &Record) -> Value + Send + Sync,
    M: Fn(Value, Value) -> Value + Send + Sync,
{
    fn fold(&self, acc: Option<Value>, record: &Record) -> Value {
        (self.fold_fn)(acc, record)
    }

    fn merge(&self, a: Value, b: Value) -> Value {
        (self.merge_fn)(a, b)
    }
}

/// Key extraction from an upstream record.
pub type KeyExtractor = Box<dyn Fn(&Record) -> Option<Value> + Send + Sync>;

/// Extract the record key itself.
pub fn record_key() -> KeyExtractor {
    Box::new(|record| record.key.clone())
}

/// Extract a named field of a map-shaped value.
pub fn field_key(field: &str) -> KeyExtractor {
    let field = field.to_string();
    Box::new(move |record| record.get(&field).cloned())
}

/// Table configuration: the window and how long buckets outlive it.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub window: WindowSpec,
    /// A bucket is evicted once the max observed event time reaches
    /// `bucket_start + window_size × retention_multiplier`. With multiplier 1
    /// and tumbling windows only the live bucket survives.
    pub retention_multiplier: i64,
}

impl TableSpec {
    pub fn new(window: WindowSpec) -> Self {
        Self {
            window,
            retention_multiplier: 2,
        }
    }

    pub fn with_retention_multiplier(mut self, multiplier: i64) -> Self {
        self.retention_multiplier = multiplier;
        self
    }
}

struct TableState {
    /// key → (bucket start ms → accumulator), ordered by bucket start.
    buckets: FxHashMap<String, BTreeMap<i64, Value>>,
    /// Max event time observed, ms. Drives eviction.
    max_event_ms: Option<i64>,
}

pub(crate) struct TableInner {
    name: String,
    key_fn: KeyExtractor,
    reducer: Box<dyn Reducer>,
    spec: TableSpec,
    state: StdMutex<TableState>,
    sinks: StdMutex<Vec<Arc<dyn RecordSink>>>,
    lifecycle: Lifecycle,
}

/// Keyed windowed aggregation derived from an upstream stage. Cheap to
/// clone; clones share state.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.inner.name)
            .field("spec", &self.inner.spec)
            .field("state", &self.inner.lifecycle.state().as_str())
            .finish_non_exhaustive()
    }
}

impl Table {
    pub(crate) fn new(
        name: String,
        key_fn: KeyExtractor,
        reducer: Box<dyn Reducer>,
        spec: TableSpec,
    ) -> Self {
        Self {
            inner: Arc::new(TableInner {
                name,
                key_fn,
                reducer,
                spec,
                state: StdMutex::new(TableState {
                    buckets: FxHashMap::default(),
                    max_event_ms: None,
                }),
                sinks: StdMutex::new(Vec::new()),
                lifecycle: Lifecycle::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn spec(&self) -> &TableSpec {
        &self.inner.spec
    }

    /// Sink handle for attaching this table to an upstream delivery path.
    pub(crate) fn sink(&self) -> Arc<dyn RecordSink> {
        Arc::clone(&self.inner) as Arc<dyn RecordSink>
    }

    /// Point lookup: the aggregate over all non-expired buckets for `key`,
    /// merged with the reducer, or `None` when nothing live remains.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.inner.lookup(&key.to_string())
    }

    /// Number of keys with at least one bucket (expired or not yet evicted
    /// buckets included; eviction is lazy).
    pub fn key_count(&self) -> usize {
        self.inner.state.lock().expect("table state poisoned").buckets.len()
    }

    #[cfg(test)]
    pub(crate) fn apply(&self, record: &Record) {
        self.inner.deliver(record);
    }
}

impl TableInner {
    fn retention_ms(&self) -> i64 {
        self.spec.window.size().num_milliseconds() * self.spec.retention_multiplier
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock().expect("table state poisoned");
        let max_ms = state.max_event_ms?;
        let horizon = self.retention_ms();

        let per_key = state.buckets.get_mut(key)?;
        per_key.retain(|start, _| start + horizon > max_ms);
        if per_key.is_empty() {
            state.buckets.remove(key);
            return None;
        }

        per_key
            .values()
            .cloned()
            .reduce(|a, b| self.reducer.merge(a, b))
    }
}

impl RecordSink for TableInner {
    fn deliver(&self, record: &Record) {
        let Some(key_value) = (self.key_fn)(record) else {
            trace!(table = %self.name, "record without key, skipped");
            return;
        };
        let key = key_value.to_string();
        let ts_ms = record.timestamp.timestamp_millis();
        let horizon = self.retention_ms();

        let aggregate = {
            let mut state = self.state.lock().expect("table state poisoned");
            let max_ms = match state.max_event_ms {
                Some(max) if max >= ts_ms => max,
                _ => {
                    state.max_event_ms = Some(ts_ms);
                    ts_ms
                }
            };

            let per_key = state.buckets.entry(key.clone()).or_default();
            for start in self.spec.window.bucket_starts(ts_ms) {
                // A very late record may target an already-expired bucket;
                // folding it would resurrect evicted state.
                if start + horizon <= max_ms {
                    continue;
                }
                let acc = per_key.remove(&start);
                let next = self.reducer.fold(acc, record);
                per_key.insert(start, next);
            }

            per_key.retain(|start, _| start + horizon > max_ms);
            if per_key.is_empty() {
                state.buckets.remove(&key);
                None
            } else {
                per_key
                    .values()
                    .cloned()
                    .reduce(|a, b| self.reducer.merge(a, b))
            }
        };

        if let Some(aggregate) = aggregate {
            let change = Record {
                topic: Arc::from(self.name.as_str()),
                partition: record.partition,
                offset: record.offset,
                timestamp: record.timestamp,
                key: Some(key_value),
                value: aggregate,
            };
            let sinks = self.sinks.lock().expect("sink list poisoned").clone();
            for sink in &sinks {
                sink.deliver(&change);
            }
        }
    }
}

impl Streamable for Table {
    fn stream_name(&self) -> &str {
        &self.inner.name
    }

    fn add_sink(&self, sink: Arc<dyn RecordSink>) {
        self.inner
            .sinks
            .lock()
            .expect("sink list poisoned")
            .push(sink);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Record> {
        channel_subscriber(&self.inner.sinks)
    }
}

#[async_trait]
impl Service for Table {
    fn service_name(&self) -> &str {
        &self.inner.name
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn order(user: &str, amount: i64, secs: i64) -> Record {
        Record::new("orders", Value::Null)
            .with_field("user", user)
            .with_field("amount", amount)
            .with_timestamp(at(secs))
    }

    fn sum_table(spec: TableSpec) -> Table {
        Table::new(
            "table0000000001".to_string(),
            field_key("user"),
            Box::new(Sum::of("amount")),
            spec,
        )
    }

    #[test]
    fn test_tumbling_bucket_starts() {
        let w = WindowSpec::tumbling(Duration::seconds(2));
        assert_eq!(w.bucket_starts(0), vec![0]);
        assert_eq!(w.bucket_starts(1_999), vec![0]);
        assert_eq!(w.bucket_starts(2_000), vec![2_000]);
        assert_eq!(w.bucket_starts(3_000), vec![2_000]);
    }

    #[test]
    fn test_sliding_bucket_starts() {
        let w = WindowSpec::sliding(Duration::seconds(4), Duration::seconds(2));
        // t=5s falls into buckets [2s,6s) and [4s,8s).
        assert_eq!(w.bucket_starts(5_000), vec![2_000, 4_000]);
        // t=0 only falls into the bucket starting at 0 (and earlier
        // negative-start buckets).
        assert!(w.bucket_starts(0).contains(&0));
    }

    #[test]
    fn test_window_validity() {
        assert!(WindowSpec::tumbling(Duration::seconds(1)).is_valid());
        assert!(!WindowSpec::tumbling(Duration::zero()).is_valid());
        assert!(!WindowSpec::sliding(Duration::seconds(1), Duration::seconds(2)).is_valid());
    }

    #[test]
    fn test_windowed_sum_with_eviction() {
        // 2-second tumbling window, retention multiplier 1: only the live
        // bucket survives.
        let table = sum_table(
            TableSpec::new(WindowSpec::tumbling(Duration::seconds(2)))
                .with_retention_multiplier(1),
        );

        table.apply(&order("A", 10, 0));
        table.apply(&order("A", 5, 1));
        assert_eq!(
            table.get(&Value::Str("A".into())).and_then(|v| v.as_float()),
            Some(15.0)
        );

        // t=3 opens a new bucket; the bucket that started at t=0 expires.
        table.apply(&order("A", 7, 3));
        assert_eq!(
            table.get(&Value::Str("A".into())).and_then(|v| v.as_float()),
            Some(7.0)
        );
    }

    #[test]
    fn test_retention_multiplier_keeps_old_buckets() {
        let table = sum_table(
            TableSpec::new(WindowSpec::tumbling(Duration::seconds(2)))
                .with_retention_multiplier(2),
        );

        table.apply(&order("A", 10, 0));
        table.apply(&order("A", 7, 3));
        // Bucket [0,2) survives until max event time reaches 0 + 2×2 = 4s.
        assert_eq!(
            table.get(&Value::Str("A".into())).and_then(|v| v.as_float()),
            Some(17.0)
        );

        table.apply(&order("B", 1, 4));
        assert_eq!(
            table.get(&Value::Str("A".into())).and_then(|v| v.as_float()),
            Some(7.0)
        );
    }

    #[test]
    fn test_lookup_is_event_time_driven() {
        // No wall-clock involvement: state built from old timestamps stays
        // queryable as long as no newer event time is observed.
        let table = sum_table(
            TableSpec::new(WindowSpec::tumbling(Duration::seconds(2)))
                .with_retention_multiplier(1),
        );
        table.apply(&order("A", 10, 0));
        assert!(table.get(&Value::Str("A".into())).is_some());
    }

    #[test]
    fn test_sliding_window_merges_buckets() {
        let table = sum_table(
            TableSpec::new(WindowSpec::sliding(Duration::seconds(4), Duration::seconds(2)))
                .with_retention_multiplier(1),
        );

        // t=5s lands in buckets starting 2s and 4s; a record belonging to
        // two sliding buckets contributes to both, so the merged lookup
        // sums it twice.
        table.apply(&order("A", 10, 5));
        assert_eq!(
            table.get(&Value::Str("A".into())).and_then(|v| v.as_float()),
            Some(20.0)
        );
    }

    #[test]
    fn test_unknown_key_not_found() {
        let table = sum_table(TableSpec::new(WindowSpec::tumbling(Duration::seconds(2))));
        table.apply(&order("A", 10, 0));
        assert_eq!(table.get(&Value::Str("missing".into())), None);
    }

    #[test]
    fn test_very_late_record_does_not_resurrect_bucket() {
        let table = sum_table(
            TableSpec::new(WindowSpec::tumbling(Duration::seconds(2)))
                .with_retention_multiplier(1),
        );
        table.apply(&order("A", 7, 10));
        // A record far in the past targets a long-expired bucket.
        table.apply(&order("A", 100, 0));
        assert_eq!(
            table.get(&Value::Str("A".into())).and_then(|v| v.as_float()),
            Some(7.0)
        );
    }

    #[tokio::test]
    async fn test_change_stream_emits_merged_aggregate() {
        let table = sum_table(
            TableSpec::new(WindowSpec::tumbling(Duration::seconds(2)))
                .with_retention_multiplier(1),
        );
        let mut rx = table.subscribe();

        table.apply(&order("A", 10, 0));
        table.apply(&order("A", 5, 1));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, Some(Value::Str("A".into())));
        assert_eq!(first.value.as_float(), Some(10.0));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.value.as_float(), Some(15.0));
        assert_eq!(&*second.topic, "table0000000001");
    }
}
