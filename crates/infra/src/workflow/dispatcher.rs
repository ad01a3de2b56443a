//! Workflow dispatcher: hosts the engine and keeps every running root
//! instance moving.
//!
//! ## Lifecycle
//!
//! 1. `start` ensures the history schema exists
//! 2. the poll loop is spawned, bounded by `max_concurrent_orchestrations`
//! 3. a [`WorkflowClient`] is published through the readiness gate
//! 4. `DispatcherHandle::shutdown` stops polling, lets in-flight turns finish
//!    until `shutdown_timeout`, then cancels whatever is left (those instances
//!    stay `Running` and resume on the next start)

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use billrun_core::{Clock, InstanceId, StoreResult};
use billrun_workflow::{
    ActivityError, OrchestrationContext, Registry, WorkflowError, WorkflowResult, WorkflowStatus,
};

use crate::readiness::ReadinessGate;

use super::client::WorkflowClient;
use super::engine::{WorkflowEngine, panic_message};
use super::store::HistoryStore;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// How often to poll the store when not woken by a local create
    pub poll_interval: Duration,
    /// Instances advanced concurrently
    pub max_concurrent_orchestrations: usize,
    /// Activity attempts executing concurrently
    pub max_concurrent_activities: usize,
    /// How long in-flight turns may run after shutdown is requested
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "workflow-dispatcher".to_string(),
            poll_interval: Duration::from_millis(500),
            max_concurrent_orchestrations: 16,
            max_concurrent_activities: 32,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_orchestrations(mut self, max: usize) -> Self {
        self.max_concurrent_orchestrations = max;
        self
    }

    pub fn with_max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub instances_completed: u64,
    pub instances_failed: u64,
    pub activity_attempts: u64,
    pub activity_failures: u64,
    pub turns_abandoned: u64,
    pub current_running: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    instances_completed: AtomicU64,
    instances_failed: AtomicU64,
    activity_attempts: AtomicU64,
    activity_failures: AtomicU64,
    turns_abandoned: AtomicU64,
    current_running: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_instance_completed(&self) {
        self.instances_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_instance_failed(&self) {
        self.instances_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_activity_attempt(&self) {
        self.activity_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_activity_failure(&self) {
        self.activity_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, started: Instant) -> DispatcherStats {
        DispatcherStats {
            instances_completed: self.instances_completed.load(Ordering::Relaxed),
            instances_failed: self.instances_failed.load(Ordering::Relaxed),
            activity_attempts: self.activity_attempts.load(Ordering::Relaxed),
            activity_failures: self.activity_failures.load(Ordering::Relaxed),
            turns_abandoned: self.turns_abandoned.load(Ordering::Relaxed),
            current_running: self.current_running.load(Ordering::Relaxed),
            uptime_secs: started.elapsed().as_secs(),
        }
    }
}

/// Counts a turn in `current_running` while it holds its permit.
struct RunningTurn(Arc<StatsCounters>);

impl RunningTurn {
    fn enter(stats: Arc<StatsCounters>) -> Self {
        stats.current_running.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for RunningTurn {
    fn drop(&mut self) {
        self.0.current_running.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<StatsCounters>,
    started: Instant,
    client: WorkflowClient,
}

impl DispatcherHandle {
    /// Stop polling, drain in-flight turns, and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.join.await {
            error!(error = %err, "workflow dispatcher task failed");
        }
    }

    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        self.stats.snapshot(self.started)
    }

    pub fn client(&self) -> &WorkflowClient {
        &self.client
    }
}

/// Hosts orchestrators and activities for every running workflow instance.
pub struct WorkflowDispatcher {
    store: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
    registry: Registry,
}

impl WorkflowDispatcher {
    pub fn new(store: Arc<dyn HistoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            registry: Registry::new(),
        }
    }

    /// Replace the handler registry wholesale.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Register an activity handler for `type_tag`.
    pub fn register_activity<I, O, F, Fut>(&mut self, type_tag: impl Into<String>, handler: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        self.registry.register_activity(type_tag, handler);
        self
    }

    /// Register an orchestrator for `type_tag`.
    pub fn register_orchestrator<I, O, F, Fut>(&mut self, type_tag: impl Into<String>, orchestrator: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkflowResult<O>> + Send + 'static,
    {
        self.registry.register_orchestrator(type_tag, orchestrator);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start dispatching and publish a client through `ready`.
    ///
    /// Cancelling `token` has the same effect as [`DispatcherHandle::shutdown`].
    pub async fn start(
        self,
        config: DispatcherConfig,
        ready: ReadinessGate<WorkflowClient>,
        token: CancellationToken,
    ) -> StoreResult<DispatcherHandle> {
        self.store.ensure_schema().await?;

        info!(
            dispatcher = %config.name,
            orchestrators = ?self.registry.orchestrator_tags(),
            activities = ?self.registry.activity_tags(),
            max_concurrent_orchestrations = config.max_concurrent_orchestrations,
            max_concurrent_activities = config.max_concurrent_activities,
            "workflow dispatcher starting"
        );

        let stats = Arc::new(StatsCounters::default());
        let engine = WorkflowEngine::with_counters(
            self.store.clone(),
            self.registry,
            self.clock,
            config.max_concurrent_activities,
            stats.clone(),
        );
        let wake = Arc::new(Notify::new());
        let client = WorkflowClient::new(self.store.clone(), wake.clone());
        let shutdown = token.child_token();

        let poll_loop = PollLoop {
            store: self.store,
            engine,
            config,
            wake,
            stats: stats.clone(),
        };
        let join = tokio::spawn(poll_loop.run(shutdown.clone()));

        ready.signal_completion(client.clone());

        Ok(DispatcherHandle {
            shutdown,
            join,
            stats,
            started: Instant::now(),
            client,
        })
    }
}

struct PollLoop {
    store: Arc<dyn HistoryStore>,
    engine: WorkflowEngine,
    config: DispatcherConfig,
    wake: Arc<Notify>,
    stats: Arc<StatsCounters>,
}

impl PollLoop {
    async fn run(self, shutdown: CancellationToken) {
        let name = self.config.name.clone();
        let capacity = self.config.max_concurrent_orchestrations.max(1);
        let permits = Arc::new(Semaphore::new(capacity));
        // Cancelled only when draining exceeds the shutdown timeout.
        let work = CancellationToken::new();
        let mut turns: JoinSet<(InstanceId, WorkflowResult<WorkflowStatus>)> = JoinSet::new();
        let mut in_flight: HashSet<InstanceId> = HashSet::new();
        let mut cooldown: HashMap<InstanceId, tokio::time::Instant> = HashMap::new();

        info!(dispatcher = %name, "workflow dispatcher started");

        loop {
            let now = tokio::time::Instant::now();
            cooldown.retain(|_, until| *until > now);

            let available = permits.available_permits();
            if available > 0 {
                match self.store.list_runnable(in_flight.len() + cooldown.len() + available).await {
                    Ok(runnable) => {
                        for instance_id in runnable {
                            if in_flight.contains(&instance_id) || cooldown.contains_key(&instance_id) {
                                continue;
                            }
                            let Ok(permit) = permits.clone().try_acquire_owned() else {
                                break;
                            };

                            debug!(dispatcher = %name, instance_id = %instance_id, "dispatching workflow turn");
                            in_flight.insert(instance_id.clone());

                            let engine = self.engine.clone();
                            let work = work.clone();
                            let stats = self.stats.clone();
                            turns.spawn(async move {
                                let _permit = permit;
                                // Declared after the permit so the count drops first.
                                let _running = RunningTurn::enter(stats);
                                // Panics outside the orchestrator (e.g. in a store) still
                                // hand the id back so the instance is polled again.
                                let result = AssertUnwindSafe(engine.drive(&instance_id, &work))
                                    .catch_unwind()
                                    .await
                                    .unwrap_or_else(|panic| {
                                        Err(WorkflowError::orchestration(format!(
                                            "workflow turn panicked: {}",
                                            panic_message(panic.as_ref())
                                        )))
                                    });
                                (instance_id, result)
                            });
                        }
                    }
                    Err(err) => warn!(dispatcher = %name, error = %err, "failed to list runnable instances"),
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = turns.join_next(), if !turns.is_empty() => {
                    self.finish_turn(joined, &mut in_flight, &mut cooldown);
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(
            dispatcher = %name,
            in_flight = turns.len(),
            "workflow dispatcher draining"
        );
        let drain = async {
            while let Some(joined) = turns.join_next().await {
                self.finish_turn(joined, &mut in_flight, &mut cooldown);
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
            warn!(
                dispatcher = %name,
                remaining = turns.len(),
                "shutdown timeout reached; cancelling in-flight turns"
            );
            work.cancel();
            let grace = async {
                while let Some(joined) = turns.join_next().await {
                    self.finish_turn(joined, &mut in_flight, &mut cooldown);
                }
            };
            if tokio::time::timeout(Duration::from_secs(1), grace).await.is_err() {
                turns.abort_all();
            }
        }

        info!(dispatcher = %name, "workflow dispatcher stopped");
    }

    fn finish_turn(
        &self,
        joined: Result<(InstanceId, WorkflowResult<WorkflowStatus>), tokio::task::JoinError>,
        in_flight: &mut HashSet<InstanceId>,
        cooldown: &mut HashMap<InstanceId, tokio::time::Instant>,
    ) {
        match joined {
            Ok((instance_id, Ok(status))) => {
                debug!(instance_id = %instance_id, status = status.name(), "workflow turn finished");
                in_flight.remove(&instance_id);
            }
            Ok((instance_id, Err(err))) => {
                self.stats.turns_abandoned.fetch_add(1, Ordering::Relaxed);
                if !err.is_cancelled() {
                    debug!(instance_id = %instance_id, error = %err, "workflow turn abandoned; cooling down");
                    cooldown.insert(instance_id.clone(), tokio::time::Instant::now() + self.config.poll_interval);
                }
                in_flight.remove(&instance_id);
            }
            Err(err) => {
                // Only reachable for turns aborted at shutdown.
                error!(error = %err, "workflow turn task failed");
                self.stats.turns_abandoned.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
