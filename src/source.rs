//! Topic sources
//!
//! A [`Source`] is a named processing stage bound to a topic selector. Its
//! consume loop fetches batches from the broker client, decodes keys and
//! values through the configured codecs, runs every record through the
//! transformation pipeline and fans the survivors out to downstream sinks
//! (tables, join sides, channel subscribers). Records from one partition are
//! delivered in fetch order; one record is processed to completion before
//! the next is taken up.

use crate::broker::{BrokerClient, BrokerConsumer, BrokerError, BrokerRecord, TopicSelector};
use crate::codec::{RawCodec, SharedCodec};
use crate::record::Record;
use crate::service::{Lifecycle, Service, ServiceError};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Downstream delivery seam. Tables and join sides implement this to receive
/// records synchronously on the delivery path.
pub trait RecordSink: Send + Sync {
    fn deliver(&self, record: &Record);
}

/// Anything that produces a record stream other stages can attach to:
/// sources, tables (their change stream) and joins (their match stream).
pub trait Streamable: Send + Sync {
    fn stream_name(&self) -> &str;

    fn add_sink(&self, sink: Arc<dyn RecordSink>);

    /// Channel-based consumption of this stage's output.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Record>;
}

/// Sink that forwards records into a channel subscriber.
pub(crate) struct ChannelSink {
    tx: mpsc::UnboundedSender<Record>,
}

impl RecordSink for ChannelSink {
    fn deliver(&self, record: &Record) {
        // A dropped receiver just means the subscriber went away.
        let _ = self.tx.send(record.clone());
    }
}

/// Attach a channel subscriber to a sink list. Shared by every streamable
/// stage.
pub(crate) fn channel_subscriber(
    sinks: &StdMutex<Vec<Arc<dyn RecordSink>>>,
) -> mpsc::UnboundedReceiver<Record> {
    let (tx, rx) = mpsc::unbounded_channel();
    sinks
        .lock()
        .expect("sink list poisoned")
        .push(Arc::new(ChannelSink { tx }));
    rx
}

/// Stages of the per-record transformation pipeline, applied in registration
/// order.
enum Transform {
    Filter(Box<dyn Fn(&Record) -> bool + Send + Sync>),
    Map(Box<dyn Fn(Record) -> Record + Send + Sync>),
    FlatMap(Box<dyn Fn(Record) -> Vec<Record> + Send + Sync>),
}

/// Codec configuration for a source. Absent codecs default to pass-through.
#[derive(Default)]
pub struct SourceOptions {
    pub key_codec: Option<SharedCodec>,
    pub value_codec: Option<SharedCodec>,
}

impl SourceOptions {
    pub fn with_key_codec(mut self, codec: SharedCodec) -> Self {
        self.key_codec = Some(codec);
        self
    }

    pub fn with_value_codec(mut self, codec: SharedCodec) -> Self {
        self.value_codec = Some(codec);
        self
    }
}

pub(crate) struct SourceInner {
    name: String,
    selector: TopicSelector,
    key_codec: SharedCodec,
    value_codec: SharedCodec,
    transforms: StdMutex<Vec<Transform>>,
    sinks: StdMutex<Vec<Arc<dyn RecordSink>>>,
    client: StdMutex<Option<Arc<dyn BrokerClient>>>,
    running: AtomicBool,
    task: StdMutex<Option<JoinHandle<()>>>,
    lifecycle: Lifecycle,
}

/// A named stage consuming one topic set or pattern. Cheap to clone; clones
/// share state.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.inner.name)
            .field("selector", &self.inner.selector)
            .field("state", &self.inner.lifecycle.state().as_str())
            .finish_non_exhaustive()
    }
}

impl Source {
    pub(crate) fn new(name: String, selector: TopicSelector, options: SourceOptions) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                name,
                selector,
                key_codec: options.key_codec.unwrap_or_else(|| Arc::new(RawCodec)),
                value_codec: options.value_codec.unwrap_or_else(|| Arc::new(RawCodec)),
                transforms: StdMutex::new(Vec::new()),
                sinks: StdMutex::new(Vec::new()),
                client: StdMutex::new(None),
                running: AtomicBool::new(false),
                task: StdMutex::new(None),
                lifecycle: Lifecycle::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn selector(&self) -> &TopicSelector {
        &self.inner.selector
    }

    /// Append a filter stage: records failing the predicate are dropped.
    pub fn filter<F>(&self, predicate: F) -> &Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.push_transform(Transform::Filter(Box::new(predicate)))
    }

    /// Append a map stage: each record is replaced by the function's output.
    pub fn map<F>(&self, f: F) -> &Self
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        self.push_transform(Transform::Map(Box::new(f)))
    }

    /// Append a flat-map stage: each record expands to zero or more records.
    pub fn flat_map<F>(&self, f: F) -> &Self
    where
        F: Fn(Record) -> Vec<Record> + Send + Sync + 'static,
    {
        self.push_transform(Transform::FlatMap(Box::new(f)))
    }

    fn push_transform(&self, transform: Transform) -> &Self {
        self.inner
            .transforms
            .lock()
            .expect("transform list poisoned")
            .push(transform);
        self
    }

    pub(crate) fn bind_client(&self, client: Arc<dyn BrokerClient>) {
        *self.inner.client.lock().expect("client slot poisoned") = Some(client);
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, raw: BrokerRecord) {
        self.inner.deliver(raw);
    }
}

impl Streamable for Source {
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

impl SourceInner {
    /// Decode, transform and fan out one raw record. Decode failures are
    /// logged and the message skipped; the stream continues.
    fn deliver(&self, raw: BrokerRecord) {
        let key = match &raw.key {
            Some(bytes) => match self.key_codec.decode(bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(
                        source = %self.name,
                        topic = %raw.topic,
                        partition = raw.partition,
                        offset = raw.offset,
                        "key decode failed, message skipped: {e}"
                    );
                    return;
                }
            },
            None => None,
        };
        let value = match self.value_codec.decode(&raw.value) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    source = %self.name,
                    topic = %raw.topic,
                    partition = raw.partition,
                    offset = raw.offset,
                    "value decode failed, message skipped: {e}"
                );
                return;
            }
        };

        let record = Record {
            topic: raw.topic.into(),
            partition: raw.partition,
            offset: raw.offset,
            timestamp: raw.timestamp,
            key,
            value,
        };

        let mut current = vec![record];
        {
            let transforms = self.transforms.lock().expect("transform list poisoned");
            for transform in transforms.iter() {
                match transform {
                    Transform::Filter(predicate) => current.retain(|r| predicate(r)),
                    Transform::Map(f) => {
                        current = std::mem::take(&mut current).into_iter().map(f).collect()
                    }
                    Transform::FlatMap(f) => {
                        current = std::mem::take(&mut current).into_iter().flat_map(f).collect()
                    }
                }
                if current.is_empty() {
                    return;
                }
            }
        }

        let sinks = self.sinks.lock().expect("sink list poisoned").clone();
        for record in &current {
            for sink in &sinks {
                sink.deliver(record);
            }
        }
    }
}

/// How long one fetch may block before the running flag is re-checked.
const FETCH_POLL: Duration = Duration::from_millis(100);

async fn consume_loop(inner: Arc<SourceInner>, mut consumer: Box<dyn BrokerConsumer>) {
    let mut consecutive_errors: u32 = 0;

    while inner.running.load(Ordering::SeqCst) {
        match tokio::time::timeout(FETCH_POLL, consumer.fetch()).await {
            Ok(Ok(batch)) => {
                consecutive_errors = 0;

                let mut latest: FxHashMap<(String, i32), i64> = FxHashMap::default();
                for raw in batch {
                    let position = (raw.topic.clone(), raw.partition);
                    let offset = raw.offset;
                    inner.deliver(raw);
                    let slot = latest.entry(position).or_insert(offset);
                    if offset > *slot {
                        *slot = offset;
                    }
                }

                // Commit only after the whole batch has been delivered
                // downstream: at-least-once, replay-safe.
                for ((topic, partition), offset) in latest {
                    if let Err(e) = consumer.commit(&topic, partition, offset).await {
                        warn!(source = %inner.name, %topic, partition, "offset commit failed: {e}");
                    }
                }
            }
            Ok(Err(BrokerError::Closed)) => {
                debug!(source = %inner.name, "subscription closed, consume loop ending");
                break;
            }
            Ok(Err(e)) => {
                consecutive_errors += 1;
                let backoff = Duration::from_millis(100 * 2u64.pow(consecutive_errors.min(7)));
                warn!(source = %inner.name, "fetch failed (backoff {backoff:?}): {e}");
                tokio::time::sleep(backoff).await;
            }
            // Poll timeout: re-check the running flag.
            Err(_) => {}
        }
    }

    debug!(source = %inner.name, "consume loop stopped");
}

#[async_trait]
impl Service for Source {
    fn service_name(&self) -> &str {
        &self.inner.name
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    async fn on_start(&self) -> Result<(), ServiceError> {
        let client = self
            .inner
            .client
            .lock()
            .expect("client slot poisoned")
            .clone()
            .ok_or_else(|| {
                ServiceError::Other(format!(
                    "source '{}' has no broker client bound",
                    self.inner.name
                ))
            })?;

        let consumer = client.subscribe(&self.inner.selector).await?;
        self.inner.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(consume_loop(Arc::clone(&self.inner), consumer));
        *self.inner.task.lock().expect("task slot poisoned") = Some(handle);
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), ServiceError> {
        self.inner.running.store(false, Ordering::SeqCst);
        let handle = self.inner.task.lock().expect("task slot poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(source = %self.inner.name, "consume loop join failed: {e}");
            }
        }
        Ok(())
    }
}
