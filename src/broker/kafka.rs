//! Kafka-backed broker client
//!
//! The full implementation requires the `kafka` feature (rdkafka). Without
//! it this module compiles to a stub whose `subscribe` fails with
//! [`BrokerError::NotAvailable`], so a worker configured for Kafka fails its
//! startup cleanly instead of silently consuming nothing.

use super::{BrokerClient, BrokerConsumer, BrokerError, TopicSelector};
use async_trait::async_trait;
use indexmap::IndexMap;

/// Connection parameters for the Kafka client.
#[derive(Debug, Clone)]
pub struct KafkaBrokerConfig {
    pub servers: Vec<String>,
    /// Consumer group id. Defaults to `tributary-worker` so offsets survive
    /// process restarts.
    pub group_id: Option<String>,
    /// Extra librdkafka properties, applied last.
    pub properties: IndexMap<String, String>,
}

impl KafkaBrokerConfig {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            group_id: None,
            properties: IndexMap::new(),
        }
    }

    pub fn with_group_id(mut self, group_id: &str) -> Self {
        self.group_id = Some(group_id.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

/// Kafka broker client.
pub struct KafkaBroker {
    config: KafkaBrokerConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaBrokerConfig) -> Self {
        Self { config }
    }
}

#[cfg(not(feature = "kafka"))]
#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn subscribe(
        &self,
        selector: &TopicSelector,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        tracing::warn!(
            servers = %self.config.servers.join(","),
            %selector,
            "kafka client requested but the 'kafka' feature is not enabled"
        );
        Err(BrokerError::NotAvailable(
            "Kafka client requires the 'kafka' feature. Enable with: cargo build --features kafka"
                .to_string(),
        ))
    }
}

#[cfg(feature = "kafka")]
mod kafka_impl {
    use super::*;
    use crate::broker::BrokerRecord;
    use chrono::{DateTime, Utc};
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
    use rdkafka::message::Message;
    use rdkafka::{Offset, TopicPartitionList};
    use std::time::Duration;
    use tracing::{info, warn};

    const MAX_BATCH: usize = 64;
    const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

    #[async_trait]
    impl BrokerClient for KafkaBroker {
        async fn subscribe(
            &self,
            selector: &TopicSelector,
        ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
            let group_id = self
                .config
                .group_id
                .clone()
                .unwrap_or_else(|| "tributary-worker".to_string());

            let mut client_config = ClientConfig::new();
            client_config
                .set("bootstrap.servers", self.config.servers.join(","))
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", "earliest");

            for (k, v) in &self.config.properties {
                // Keys managed internally go through dedicated config fields.
                if k == "bootstrap.servers" || k == "group.id" {
                    continue;
                }
                client_config.set(k, v);
            }

            let consumer: StreamConsumer = client_config
                .create()
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

            // librdkafka treats topic names starting with '^' as regex
            // subscriptions.
            let topics: Vec<String> = match selector {
                TopicSelector::Topics(topics) => {
                    if topics.is_empty() {
                        return Err(BrokerError::SubscribeFailed(
                            "subscription covers no topics".to_string(),
                        ));
                    }
                    topics.clone()
                }
                TopicSelector::Pattern(re) => {
                    let pat = re.as_str();
                    if pat.starts_with('^') {
                        vec![pat.to_string()]
                    } else {
                        vec![format!("^{pat}")]
                    }
                }
            };
            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BrokerError::SubscribeFailed(e.to_string()))?;

            info!(%selector, group = %group_id, "kafka subscription established");

            Ok(Box::new(KafkaConsumerHandle { consumer }))
        }
    }

    struct KafkaConsumerHandle {
        consumer: StreamConsumer,
    }

    impl KafkaConsumerHandle {
        fn to_record(msg: &rdkafka::message::BorrowedMessage<'_>) -> BrokerRecord {
            let timestamp = msg
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis)
                .unwrap_or_else(Utc::now);
            BrokerRecord {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                timestamp,
                key: msg.key().map(<[u8]>::to_vec),
                value: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }
        }
    }

    #[async_trait]
    impl BrokerConsumer for KafkaConsumerHandle {
        async fn fetch(&mut self) -> Result<Vec<BrokerRecord>, BrokerError> {
            let first = self
                .consumer
                .recv()
                .await
                .map_err(|e| BrokerError::FetchFailed(e.to_string()))?;
            let mut batch = vec![Self::to_record(&first)];

            // Drain whatever is already buffered, bounded by batch size.
            while batch.len() < MAX_BATCH {
                match tokio::time::timeout(DRAIN_TIMEOUT, self.consumer.recv()).await {
                    Ok(Ok(msg)) => batch.push(Self::to_record(&msg)),
                    Ok(Err(e)) => {
                        warn!("kafka fetch error while draining batch: {e}");
                        break;
                    }
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
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;
            self.consumer
                .commit(&tpl, CommitMode::Async)
                .map_err(|e| BrokerError::CommitFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = KafkaBrokerConfig::new(["localhost:9092", "localhost:9093"])
            .with_group_id("analytics")
            .with_property("session.timeout.ms", "6000");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.group_id.as_deref(), Some("analytics"));
        assert_eq!(
            config.properties.get("session.timeout.ms").map(String::as_str),
            Some("6000")
        );
    }

    #[cfg(not(feature = "kafka"))]
    #[tokio::test]
    async fn test_stub_reports_not_available() {
        let broker = KafkaBroker::new(KafkaBrokerConfig::new(["localhost:9092"]));
        match broker.subscribe(&TopicSelector::topics(["orders"])).await {
            Err(BrokerError::NotAvailable(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("stub must not hand out a consumer"),
        }
    }
}
