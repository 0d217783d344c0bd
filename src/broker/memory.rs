//! In-process broker for tests and demos
//!
//! Keeps one unbounded queue per subscription and assigns offsets per
//! (topic, partition). Committed offsets are inspectable, which the
//! integration tests use to verify at-least-once commit behavior.

use super::{BrokerClient, BrokerConsumer, BrokerError, BrokerRecord, TopicSelector};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct MemoryInner {
    subscriptions: Mutex<Vec<Subscription>>,
    /// Next offset to assign per (topic, partition).
    next_offsets: Mutex<FxHashMap<(String, i32), i64>>,
    /// Highest committed offset per (topic, partition), across consumers.
    committed: Mutex<FxHashMap<(String, i32), i64>>,
}

struct Subscription {
    selector: TopicSelector,
    tx: mpsc::UnboundedSender<BrokerRecord>,
}

/// An in-memory broker. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a record with the current time as event time.
    pub fn produce(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> i64 {
        self.produce_at(topic, 0, key, value, Utc::now())
    }

    /// Publish a record to a specific partition with an explicit event time.
    /// Returns the assigned offset.
    pub fn produce_at(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
        timestamp: DateTime<Utc>,
    ) -> i64 {
        let offset = {
            let mut offsets = self
                .inner
                .next_offsets
                .lock()
                .expect("offset map poisoned");
            let slot = offsets.entry((topic.to_string(), partition)).or_insert(0);
            let assigned = *slot;
            *slot += 1;
            assigned
        };

        let record = BrokerRecord {
            topic: topic.to_string(),
            partition,
            offset,
            timestamp,
            key: key.map(<[u8]>::to_vec),
            value: value.to_vec(),
        };

        let mut subs = self
            .inner
            .subscriptions
            .lock()
            .expect("subscription list poisoned");
        // Drop subscriptions whose consumer has gone away.
        subs.retain(|sub| {
            if sub.selector.matches(topic) {
                sub.tx.send(record.clone()).is_ok()
            } else {
                true
            }
        });

        offset
    }

    /// Highest committed offset for a topic partition, if any.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .committed
            .lock()
            .expect("committed map poisoned")
            .get(&(topic.to_string(), partition))
            .copied()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn subscribe(
        &self,
        selector: &TopicSelector,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        if selector.is_empty() {
            return Err(BrokerError::SubscribeFailed(
                "subscription covers no topics".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscriptions
            .lock()
            .expect("subscription list poisoned")
            .push(Subscription {
                selector: selector.clone(),
                tx,
            });

        Ok(Box::new(MemoryConsumer {
            rx,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryConsumer {
    rx: mpsc::UnboundedReceiver<BrokerRecord>,
    inner: Arc<MemoryInner>,
}

/// Cap on records drained into one fetched batch.
const MAX_BATCH: usize = 64;

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn fetch(&mut self) -> Result<Vec<BrokerRecord>, BrokerError> {
        // Wait for the first record, then drain whatever else is queued.
        let first = self.rx.recv().await.ok_or(BrokerError::Closed)?;
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn commit(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), BrokerError> {
        let mut committed = self
            .inner
            .committed
            .lock()
            .expect("committed map poisoned");
        let slot = committed
            .entry((topic.to_string(), partition))
            .or_insert(offset);
        if offset > *slot {
            *slot = offset;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_produce_fetch_commit() {
        let broker = MemoryBroker::new();
        let mut consumer = broker
            .subscribe(&TopicSelector::topics(["orders"]))
            .await
            .unwrap();

        broker.produce("orders", Some(b"k1"), b"v1");
        broker.produce("orders", None, b"v2");
        broker.produce("payments", None, b"ignored");

        let batch = consumer.fetch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].offset, 0);
        assert_eq!(batch[1].offset, 1);
        assert_eq!(batch[0].key.as_deref(), Some(&b"k1"[..]));
        assert_eq!(batch[1].value, b"v2");

        consumer.commit("orders", 0, 1).await.unwrap();
        assert_eq!(broker.committed("orders", 0), Some(1));
        assert_eq!(broker.committed("payments", 0), None);
    }

    #[tokio::test]
    async fn test_pattern_subscription() {
        let broker = MemoryBroker::new();
        let mut consumer = broker
            .subscribe(&TopicSelector::pattern(r"withdrawal\..*").unwrap())
            .await
            .unwrap();

        broker.produce("withdrawal.us", None, b"a");
        broker.produce("deposit.us", None, b"b");
        broker.produce("withdrawal.eu", None, b"c");

        let batch = consumer.fetch().await.unwrap();
        let topics: Vec<&str> = batch.iter().map(|r| r.topic.as_str()).collect();
        assert_eq!(topics, vec!["withdrawal.us", "withdrawal.eu"]);
    }

    #[tokio::test]
    async fn test_empty_selector_rejected() {
        let broker = MemoryBroker::new();
        match broker
            .subscribe(&TopicSelector::topics(Vec::<String>::new()))
            .await
        {
            Err(BrokerError::SubscribeFailed(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("empty selector must not hand out a consumer"),
        }
    }

    #[tokio::test]
    async fn test_offsets_per_partition() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.produce_at("t", 0, None, b"a", Utc::now()), 0);
        assert_eq!(broker.produce_at("t", 1, None, b"b", Utc::now()), 0);
        assert_eq!(broker.produce_at("t", 0, None, b"c", Utc::now()), 1);
    }
}
