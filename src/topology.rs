//! Topology: the stage registry
//!
//! A [`Topology`] owns every processing stage of an application: sources,
//! tables and joins, in registration order. Stage names are either caller
//! supplied or generated from a per-kind counter; all registration funnels
//! through one path that rejects duplicate names. Starting the topology
//! binds the broker client to every source and starts the stages in
//! registration order.

use crate::broker::{BrokerClient, TopicSelector};
use crate::join::{Join, JoinSide, JoinSpec};
use crate::service::{Lifecycle, Service, ServiceError};
use crate::source::{Source, SourceOptions, Streamable};
use crate::table::{KeyExtractor, Reducer, Table, TableSpec};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("a stage named '{0}' is already registered")]
    NamingConflict(String),
    #[error("invalid stage definition: {0}")]
    InvalidStageDefinition(String),
    #[error("invalid topic pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// One registered stage. The variants share the [`Service`] surface through
/// [`StageEntry::service`].
enum StageEntry {
    Source(Source),
    Table(Table),
    Join(Join),
}

impl StageEntry {
    fn service(&self) -> Arc<dyn Service> {
        match self {
            StageEntry::Source(s) => Arc::new(s.clone()),
            StageEntry::Table(t) => Arc::new(t.clone()),
            StageEntry::Join(j) => Arc::new(j.clone()),
        }
    }
}

struct Registry {
    /// Stages in registration order. Order matters: it is the start order.
    stages: IndexMap<String, StageEntry>,
    counter: u64,
}

impl Registry {
    fn next_name(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}{:010}", self.counter);
        self.counter += 1;
        name
    }
}

struct TopologyInner {
    registry: StdMutex<Registry>,
    client: StdMutex<Option<Arc<dyn BrokerClient>>>,
    lifecycle: Lifecycle,
}

/// Application topology. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TopologyInner {
                registry: StdMutex::new(Registry {
                    stages: IndexMap::new(),
                    counter: 0,
                }),
                client: StdMutex::new(None),
                lifecycle: Lifecycle::new(),
            }),
        }
    }

    /// Stream from an explicit topic list, with a generated name.
    pub fn stream<I, S>(&self, topics: I) -> Result<Source, TopologyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stream_with(TopicSelector::topics(topics), SourceOptions::default())
    }

    /// Stream from every topic matching a regular expression.
    pub fn stream_from_pattern(&self, pattern: &str) -> Result<Source, TopologyError> {
        self.stream_with(TopicSelector::pattern(pattern)?, SourceOptions::default())
    }

    /// Stream from a selector with explicit codec options and a generated
    /// name.
    pub fn stream_with(
        &self,
        selector: TopicSelector,
        options: SourceOptions,
    ) -> Result<Source, TopologyError> {
        let name = self.next_name("source");
        self.stream_named(name, selector, options)
    }

    /// Stream registered under a caller-chosen name.
    pub fn stream_named(
        &self,
        name: impl Into<String>,
        selector: TopicSelector,
        options: SourceOptions,
    ) -> Result<Source, TopologyError> {
        if selector.is_empty() {
            return Err(TopologyError::InvalidStageDefinition(
                "a source needs at least one topic".to_string(),
            ));
        }
        let name = name.into();
        let source = Source::new(name.clone(), selector, options);
        self.add_stage(name, StageEntry::Source(source.clone()))?;
        Ok(source)
    }

    /// Register a windowed table over an upstream stage.
    pub fn table(
        &self,
        upstream: &dyn Streamable,
        key_fn: KeyExtractor,
        reducer: Box<dyn Reducer>,
        spec: TableSpec,
    ) -> Result<Table, TopologyError> {
        if !spec.window.is_valid() {
            return Err(TopologyError::InvalidStageDefinition(format!(
                "table over '{}' has an invalid window",
                upstream.stream_name()
            )));
        }
        if spec.retention_multiplier < 1 {
            return Err(TopologyError::InvalidStageDefinition(format!(
                "table over '{}' needs a retention multiplier of at least 1",
                upstream.stream_name()
            )));
        }
        let name = self.next_name("table");
        let table = Table::new(name.clone(), key_fn, reducer, spec);
        upstream.add_sink(table.sink());
        self.add_stage(name, StageEntry::Table(table.clone()))?;
        Ok(table)
    }

    /// Register a windowed join over two upstream stages.
    pub fn join(
        &self,
        left: &dyn Streamable,
        right: &dyn Streamable,
        left_key: KeyExtractor,
        right_key: KeyExtractor,
        spec: JoinSpec,
    ) -> Result<Join, TopologyError> {
        if spec.window <= chrono::Duration::zero() {
            return Err(TopologyError::InvalidStageDefinition(format!(
                "join of '{}' and '{}' needs a positive window",
                left.stream_name(),
                right.stream_name()
            )));
        }
        let name = self.next_name("join");
        let join = Join::new(name.clone(), left_key, right_key, spec);
        left.add_sink(join.side_sink(JoinSide::Left));
        right.add_sink(join.side_sink(JoinSide::Right));
        self.add_stage(name, StageEntry::Join(join.clone()))?;
        Ok(join)
    }

    /// Number of registered stages.
    pub fn stage_count(&self) -> usize {
        self.inner.registry.lock().expect("registry poisoned").stages.len()
    }

    /// Registered stage names in registration order.
    pub fn stage_names(&self) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .expect("registry poisoned")
            .stages
            .keys()
            .cloned()
            .collect()
    }

    /// Bind the broker client used by every source. Called by the worker
    /// before start.
    pub(crate) fn bind_client(&self, client: Arc<dyn BrokerClient>) {
        *self.inner.client.lock().expect("client slot poisoned") = Some(client);
    }

    fn next_name(&self, prefix: &str) -> String {
        self.inner
            .registry
            .lock()
            .expect("registry poisoned")
            .next_name(prefix)
    }

    /// Single registration path: every stage kind goes through here.
    fn add_stage(&self, name: String, entry: StageEntry) -> Result<(), TopologyError> {
        let mut registry = self.inner.registry.lock().expect("registry poisoned");
        if registry.stages.contains_key(&name) {
            return Err(TopologyError::NamingConflict(name));
        }
        registry.stages.insert(name, entry);
        Ok(())
    }
}

#[async_trait]
impl Service for Topology {
    fn service_name(&self) -> &str {
        "topology"
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    fn children(&self) -> Vec<Arc<dyn Service>> {
        self.inner
            .registry
            .lock()
            .expect("registry poisoned")
            .stages
            .values()
            .map(StageEntry::service)
            .collect()
    }

    async fn on_start(&self) -> Result<(), ServiceError> {
        let client = self
            .inner
            .client
            .lock()
            .expect("client slot poisoned")
            .clone()
            .ok_or_else(|| {
                ServiceError::Other("topology started without a broker client".to_string())
            })?;

        let registry = self.inner.registry.lock().expect("registry poisoned");
        for entry in registry.stages.values() {
            if let StageEntry::Source(source) = entry {
                source.bind_client(Arc::clone(&client));
            }
        }
        Ok(())
    }
}
