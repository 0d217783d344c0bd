//! Windowed stream joins
//!
//! A [`Join`] correlates two upstream streams by key within an event-time
//! window. Each side keeps at most one pending record per key (a newer
//! arrival replaces the older one); when the opposite side holds a record
//! with the same key whose timestamp is within the window, exactly one
//! joined record is emitted. Pending entries expire lazily against the
//! window whenever their key is touched.

use crate::record::Record;
use crate::service::{Lifecycle, Service};
use crate::source::{channel_subscriber, RecordSink, Streamable};
use crate::table::KeyExtractor;
use crate::value::Value;
use async_trait::async_trait;
use chrono::Duration;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

impl JoinSide {
    fn index(self) -> usize {
        match self {
            JoinSide::Left => 0,
            JoinSide::Right => 1,
        }
    }

    fn other(self) -> JoinSide {
        match self {
            JoinSide::Left => JoinSide::Right,
            JoinSide::Right => JoinSide::Left,
        }
    }
}

/// Join configuration.
pub struct JoinSpec {
    /// Maximum event-time distance between the two sides of a pair.
    pub window: Duration,
    /// When set, a matched record stays pending and can pair again with
    /// later arrivals on the opposite side.
    pub many_to_many: bool,
    /// Optional gate applied to the joined output record; pairs failing it
    /// are dropped (the pending-state bookkeeping still happens).
    pub predicate: Option<Box<dyn Fn(&Record) -> bool + Send + Sync>>,
}

impl JoinSpec {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            many_to_many: false,
            predicate: None,
        }
    }

    pub fn many_to_many(mut self) -> Self {
        self.many_to_many = true;
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }
}

struct JoinState {
    /// Pending records awaiting a partner, one per key per side.
    pending: [FxHashMap<String, Record>; 2],
    /// Most recent joined output per key, for point lookups.
    matched: FxHashMap<String, Record>,
}

pub(crate) struct JoinInner {
    name: String,
    spec: JoinSpec,
    key_fns: [KeyExtractor; 2],
    state: StdMutex<JoinState>,
    sinks: StdMutex<Vec<Arc<dyn RecordSink>>>,
    lifecycle: Lifecycle,
}

/// Windowed two-stream join stage. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Join {
    inner: Arc<JoinInner>,
}

impl fmt::Debug for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Join")
            .field("name", &self.inner.name)
            .field("window", &self.inner.spec.window)
            .field("many_to_many", &self.inner.spec.many_to_many)
            .field("state", &self.inner.lifecycle.state().as_str())
            .finish_non_exhaustive()
    }
}

impl Join {
    pub(crate) fn new(
        name: String,
        left_key: KeyExtractor,
        right_key: KeyExtractor,
        spec: JoinSpec,
    ) -> Self {
        Self {
            inner: Arc::new(JoinInner {
                name,
                spec,
                key_fns: [left_key, right_key],
                state: StdMutex::new(JoinState {
                    pending: [FxHashMap::default(), FxHashMap::default()],
                    matched: FxHashMap::default(),
                }),
                sinks: StdMutex::new(Vec::new()),
                lifecycle: Lifecycle::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Sink handle for one side, for attaching to that side's upstream.
    pub(crate) fn side_sink(&self, side: JoinSide) -> Arc<dyn RecordSink> {
        Arc::new(JoinSideSink {
            side,
            inner: Arc::clone(&self.inner),
        })
    }

    /// The most recent joined record emitted for `key`, if any.
    pub fn get(&self, key: &Value) -> Option<Record> {
        self.inner
            .state
            .lock()
            .expect("join state poisoned")
            .matched
            .get(&key.to_string())
            .cloned()
    }

    /// Pending records currently waiting on `side`.
    pub fn pending_count(&self, side: JoinSide) -> usize {
        self.inner
            .state
            .lock()
            .expect("join state poisoned")
            .pending[side.index()]
            .len()
    }

    #[cfg(test)]
    pub(crate) fn observe(&self, side: JoinSide, record: &Record) {
        self.inner.observe(side, record);
    }
}

/// Per-side delivery adapter: routes an upstream record into the shared
/// join state under its side tag.
struct JoinSideSink {
    side: JoinSide,
    inner: Arc<JoinInner>,
}

impl RecordSink for JoinSideSink {
    fn deliver(&self, record: &Record) {
        self.inner.observe(self.side, record);
    }
}

impl JoinInner {
    fn observe(&self, side: JoinSide, record: &Record) {
        let Some(key_value) = (self.key_fns[side.index()])(record) else {
            trace!(join = %self.name, side = ?side, "record without key, skipped");
            return;
        };
        let key = key_value.to_string();
        let ts_ms = record.timestamp.timestamp_millis();
        let window_ms = self.spec.window.num_milliseconds();

        let output = {
            let mut state = self.state.lock().expect("join state poisoned");

            // Lazy expiry on touch: anything for this key older than the
            // window relative to the arriving record cannot pair anymore.
            for pending in state.pending.iter_mut() {
                if let Some(stale) = pending.get(&key) {
                    if (ts_ms - stale.timestamp.timestamp_millis()).abs() > window_ms {
                        pending.remove(&key);
                    }
                }
            }

            let partner = state.pending[side.other().index()].get(&key).cloned();
            match partner {
                Some(partner) => {
                    if !self.spec.many_to_many {
                        state.pending[side.other().index()].remove(&key);
                    }
                    let (left, right) = match side {
                        JoinSide::Left => (record.clone(), partner),
                        JoinSide::Right => (partner, record.clone()),
                    };
                    let joined = joined_record(&self.name, &key_value, left, right);
                    let keep = match &self.spec.predicate {
                        Some(predicate) => predicate(&joined),
                        None => true,
                    };
                    if keep {
                        state.matched.insert(key, joined.clone());
                        Some(joined)
                    } else {
                        None
                    }
                }
                None => {
                    // Newest wins: a later record on the same side replaces
                    // the one still waiting.
                    state.pending[side.index()].insert(key, record.clone());
                    None
                }
            }
        };

        if let Some(joined) = output {
            let sinks = self.sinks.lock().expect("sink list poisoned").clone();
            for sink in &sinks {
                sink.deliver(&joined);
            }
        }
    }
}

/// Build the output record for one matched pair. The value is a map with
/// `left` and `right` entries; the timestamp is the later of the two.
fn joined_record(name: &str, key: &Value, left: Record, right: Record) -> Record {
    let timestamp = left.timestamp.max(right.timestamp);
    let mut value = IndexMap::new();
    value.insert("left".to_string(), left.value);
    value.insert("right".to_string(), right.value);
    Record {
        topic: Arc::from(name),
        partition: 0,
        offset: 0,
        timestamp,
        key: Some(key.clone()),
        value: Value::Map(value),
    }
}

impl Streamable for Join {
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
impl Service for Join {
    fn service_name(&self) -> &str {
        &self.inner.name
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }
}
