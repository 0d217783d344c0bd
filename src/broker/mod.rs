//! Broker client contract
//!
//! The core never embeds wire-protocol detail; it consumes this narrow
//! contract: subscribe to a topic set or pattern, fetch the next batch of
//! records, commit offsets. Implementations: [`memory::MemoryBroker`] for
//! in-process use and tests, [`kafka::KafkaBroker`] behind the `kafka`
//! feature.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

pub use kafka::{KafkaBroker, KafkaBrokerConfig};
pub use memory::MemoryBroker;

/// Which topics a subscription covers: an explicit set or a name pattern,
/// never neither.
#[derive(Debug, Clone)]
pub enum TopicSelector {
    Topics(Vec<String>),
    Pattern(Regex),
}

impl TopicSelector {
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TopicSelector::Topics(topics.into_iter().map(Into::into).collect())
    }

    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(TopicSelector::Pattern(Regex::new(pattern)?))
    }

    /// True when no topic can ever match (empty set).
    pub fn is_empty(&self) -> bool {
        match self {
            TopicSelector::Topics(t) => t.is_empty(),
            TopicSelector::Pattern(_) => false,
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicSelector::Topics(topics) => topics.iter().any(|t| t == topic),
            TopicSelector::Pattern(re) => re.is_match(topic),
        }
    }
}

impl std::fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicSelector::Topics(t) => write!(f, "topics [{}]", t.join(", ")),
            TopicSelector::Pattern(re) => write!(f, "pattern /{}/", re.as_str()),
        }
    }
}

/// A raw record as fetched from the broker, before any codec runs.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// Errors surfaced by broker implementations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("offset commit failed: {0}")]
    CommitFailed(String),

    /// The broker or subscription has gone away; the consume loop ends.
    #[error("subscription closed")]
    Closed,

    /// Requested client is not compiled in (e.g. missing `kafka` feature).
    #[error("broker client not available: {0}")]
    NotAvailable(String),
}

/// Entry point to a broker: hands out consumers for a topic selection.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn subscribe(
        &self,
        selector: &TopicSelector,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}

/// One subscription's consuming side.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Fetch the next batch of records, waiting until at least one is
    /// available. Records within one partition arrive in offset order.
    async fn fetch(&mut self) -> Result<Vec<BrokerRecord>, BrokerError>;

    /// Mark `offset` as processed for a topic partition.
    async fn commit(&mut self, topic: &str, partition: i32, offset: i64)
        -> Result<(), BrokerError>;
}
