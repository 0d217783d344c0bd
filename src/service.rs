//! Supervised service lifecycle
//!
//! Every stage, the topology and the worker itself are services with an
//! explicit lifecycle. The default [`Service::start`] / [`Service::stop`]
//! drivers implement the composition rules: children start in registration
//! order before the parent reports running; a child failing to start unwinds
//! the children already started; children stop in registration order with
//! failures collected instead of aborting the shutdown.

use crate::broker::BrokerError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Lifecycle states. `Crashed` is entered when an `on_start`/`on_stop` hook
/// fails or a child fails to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Idle => "idle",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Crashed => "crashed",
        }
    }
}

/// Per-service lifecycle bookkeeping. Each implementor owns one and hands it
/// back through [`Service::lifecycle`].
pub struct Lifecycle {
    state: StdMutex<ServiceState>,
    /// Serializes start/stop transitions. A stop issued while a start is in
    /// flight waits here until the start settles.
    op_lock: Mutex<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(ServiceState::Idle),
            op_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().expect("lifecycle state poisoned")
    }

    fn set(&self, state: ServiceState) {
        *self.state.lock().expect("lifecycle state poisoned") = state;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Error raised by a service hook.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("{0}")]
    Other(String),
}

/// A stage failed its `on_start` hook (or a child failed to start). Fatal to
/// the whole start sequence: a half-started topology is not safe to run.
#[derive(Debug, thiserror::Error)]
#[error("stage '{stage}' failed to start: {source}")]
pub struct StartError {
    pub stage: String,
    #[source]
    pub source: ServiceError,
}

/// Stop failures. Unlike start, stop continues past failing stages and
/// reports everything that went wrong at the end.
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("stage '{stage}' failed to stop: {source}")]
    Stage {
        stage: String,
        #[source]
        source: ServiceError,
    },

    #[error("{} stage(s) failed to stop", .0.len())]
    Aggregate(Vec<StopError>),
}

/// A supervised unit of work.
///
/// Implementors provide a name, a [`Lifecycle`], optionally children and the
/// `on_start`/`on_stop` hooks; the default `start`/`stop` drivers supply the
/// state machine and child orchestration.
#[async_trait]
pub trait Service: Send + Sync {
    fn service_name(&self) -> &str;

    fn lifecycle(&self) -> &Lifecycle;

    /// Ordered child services, started before this service reports running.
    fn children(&self) -> Vec<Arc<dyn Service>> {
        Vec::new()
    }

    async fn on_start(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn state(&self) -> ServiceState {
        self.lifecycle().state()
    }

    /// A service is running only if it and every child report running.
    fn is_running(&self) -> bool {
        self.state() == ServiceState::Running && self.children().iter().all(|c| c.is_running())
    }

    /// Drive `idle → starting → running`. Idempotent: starting a running
    /// service is a no-op.
    async fn start(&self) -> Result<(), StartError> {
        let _op = self.lifecycle().op_lock.lock().await;
        if self.state() == ServiceState::Running {
            return Ok(());
        }

        self.lifecycle().set(ServiceState::Starting);
        info!(service = self.service_name(), "starting");

        if let Err(source) = self.on_start().await {
            self.lifecycle().set(ServiceState::Crashed);
            return Err(StartError {
                stage: self.service_name().to_string(),
                source,
            });
        }

        let mut started: Vec<Arc<dyn Service>> = Vec::new();
        for child in self.children() {
            match child.start().await {
                Ok(()) => started.push(child),
                Err(err) => {
                    warn!(
                        service = self.service_name(),
                        failed = err.stage.as_str(),
                        "child failed to start, unwinding"
                    );
                    // Best-effort reverse unwind of whatever already started.
                    for launched in started.iter().rev() {
                        if let Err(stop_err) = launched.stop().await {
                            warn!(
                                service = launched.service_name(),
                                "failed to unwind child: {stop_err}"
                            );
                        }
                    }
                    if let Err(hook_err) = self.on_stop().await {
                        warn!(
                            service = self.service_name(),
                            "on_stop during unwind failed: {hook_err}"
                        );
                    }
                    self.lifecycle().set(ServiceState::Crashed);
                    return Err(err);
                }
            }
        }

        self.lifecycle().set(ServiceState::Running);
        info!(service = self.service_name(), "running");
        Ok(())
    }

    /// Drive `running → stopping → stopped`. Idempotent: stopping a stopped
    /// (or never-started) service is a no-op, never an error. Children stop
    /// in registration order; failures are collected, not fatal.
    async fn stop(&self) -> Result<(), StopError> {
        let _op = self.lifecycle().op_lock.lock().await;
        match self.state() {
            ServiceState::Running | ServiceState::Crashed => {}
            // Idle, Starting (cannot happen under the op lock), Stopping,
            // Stopped: nothing to do.
            _ => return Ok(()),
        }

        self.lifecycle().set(ServiceState::Stopping);
        info!(service = self.service_name(), "stopping");

        let mut failures: Vec<StopError> = Vec::new();
        for child in self.children() {
            if let Err(err) = child.stop().await {
                warn!(
                    service = self.service_name(),
                    child = child.service_name(),
                    "child failed to stop: {err}"
                );
                failures.push(err);
            }
        }

        if let Err(source) = self.on_stop().await {
            failures.push(StopError::Stage {
                stage: self.service_name().to_string(),
                source,
            });
        }

        self.lifecycle().set(ServiceState::Stopped);
        info!(service = self.service_name(), "stopped");

        if failures.is_empty() {
            Ok(())
        } else if failures.len() == 1 {
            Err(failures.swap_remove(0))
        } else {
            Err(StopError::Aggregate(failures))
        }
    }
}
