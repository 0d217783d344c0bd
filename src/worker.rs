//! Worker: the application entry point
//!
//! A [`Worker`] ties a [`Topology`] to a broker. Starting it resolves the
//! broker client (an injected one, or a Kafka client built from the server
//! list), hands it to the topology and then starts every stage. Stopping it
//! unwinds in the same child order the topology registered them in.

use crate::broker::kafka::{KafkaBroker, KafkaBrokerConfig};
use crate::broker::BrokerClient;
use crate::service::{Lifecycle, Service, ServiceError};
use crate::topology::Topology;
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::info;

/// Broker address used when no server list is given.
pub const DEFAULT_SERVER: &str = "localhost:9092";

struct WorkerInner {
    servers: String,
    topology: Topology,
    client: StdMutex<Option<Arc<dyn BrokerClient>>>,
    lifecycle: Lifecycle,
}

/// A running stream-processing application. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(topology: Topology) -> Self {
        Self::with_servers(topology, DEFAULT_SERVER)
    }

    pub fn with_servers(topology: Topology, servers: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                servers: servers.into(),
                topology,
                client: StdMutex::new(None),
                lifecycle: Lifecycle::new(),
            }),
        }
    }

    /// Use an explicit broker client instead of connecting to `servers`.
    /// In-memory brokers and test doubles come in through here.
    pub fn with_client(self, client: Arc<dyn BrokerClient>) -> Self {
        *self.inner.client.lock().expect("client slot poisoned") = Some(client);
        self
    }

    pub fn servers(&self) -> &str {
        &self.inner.servers
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }
}

#[async_trait]
impl Service for Worker {
    fn service_name(&self) -> &str {
        "worker"
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    fn children(&self) -> Vec<Arc<dyn Service>> {
        vec![Arc::new(self.inner.topology.clone())]
    }

    async fn on_start(&self) -> Result<(), ServiceError> {
        let client = {
            let mut slot = self.inner.client.lock().expect("client slot poisoned");
            match slot.as_ref() {
                Some(client) => Arc::clone(client),
                None => {
                    let config =
                        KafkaBrokerConfig::new(self.inner.servers.split(',').map(str::trim));
                    let client: Arc<dyn BrokerClient> = Arc::new(KafkaBroker::new(config));
                    *slot = Some(Arc::clone(&client));
                    client
                }
            }
        };
        self.inner.topology.bind_client(client);
        info!(servers = %self.inner.servers, "worker starting");
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), ServiceError> {
        info!("worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    #[test]
    fn test_default_servers() {
        let worker = Worker::new(Topology::new());
        assert_eq!(worker.servers(), DEFAULT_SERVER);
    }

    #[tokio::test]
    async fn test_start_and_stop_with_injected_client() {
        let broker = MemoryBroker::new();
        let topology = Topology::new();
        topology.stream(["orders"]).unwrap();

        let worker = Worker::new(topology).with_client(Arc::new(broker));
        worker.start().await.unwrap();
        assert!(worker.is_running());
        worker.stop().await.unwrap();
        assert!(!worker.is_running());
    }
}
