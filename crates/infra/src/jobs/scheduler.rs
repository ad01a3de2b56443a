//! Lease-based recurring job scheduler.
//!
//! Each scheduled job runs its own loop:
//! `AwaitPrerequisites → CheckLease → {Sleep | Run} → CheckLease`, ending only
//! when the outer token is cancelled. The lease heartbeat is committed before
//! the body runs, so a crash mid-body skips that cycle instead of repeating it.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use billrun_core::{Cancelled, Clock, JobName, StoreError};

use crate::readiness::{Prerequisite, wait_all};

use super::store::LeaseStore;
use super::types::Cadence;

/// A recurring unit of work.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    fn name(&self) -> &JobName;

    fn cadence(&self) -> &Cadence;

    /// Run one cycle. `token` fires on shutdown or when the cycle's deadline passes.
    async fn run_once(&self, token: CancellationToken) -> anyhow::Result<()>;
}

/// [`ScheduledJob`] built from a closure.
pub struct FnJob<F> {
    name: JobName,
    cadence: Cadence,
    body: F,
}

impl<F, Fut> FnJob<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(name: impl Into<JobName>, cadence: Cadence, body: F) -> Self {
        Self {
            name: name.into(),
            cadence,
            body,
        }
    }
}

#[async_trait]
impl<F, Fut> ScheduledJob for FnJob<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &JobName {
        &self.name
    }

    fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    async fn run_once(&self, token: CancellationToken) -> anyhow::Result<()> {
        (self.body)(token).await
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Shortest sleep between lease checks
    pub min_poll_interval: Duration,
    /// Name of this process, for logging
    pub instance_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_poll_interval: Duration::from_secs(5 * 60),
            instance_name: "billrun".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }
}

/// Scheduler error.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SchedulerError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("lease store: {0}")]
    Store(#[from] StoreError),
}

/// Result of one scheduler iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The lease was taken and the body finished successfully.
    Ran { execution_count: u64 },
    /// The lease was taken but the body failed or overran its deadline.
    BodyFailed { execution_count: u64, error: String },
    /// Not eligible yet; check again after `sleep`.
    Skipped { sleep: Duration },
}

/// Runs named jobs at most once per cadence cycle across all processes
/// sharing the lease store.
#[derive(Clone)]
pub struct LeaseScheduler {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl LeaseScheduler {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawn the loop for `job` on its own task.
    ///
    /// The loop first waits for every prerequisite gate, then runs until
    /// `token` is cancelled.
    pub fn schedule_job(
        &self,
        job: impl ScheduledJob,
        prerequisites: Vec<Arc<dyn Prerequisite>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        let job: Arc<dyn ScheduledJob> = Arc::new(job);
        tokio::spawn(async move { scheduler.run(job, prerequisites, token).await })
    }

    /// Drive the loop for `job` on the current task until `token` is cancelled.
    pub async fn run(
        &self,
        job: Arc<dyn ScheduledJob>,
        prerequisites: Vec<Arc<dyn Prerequisite>>,
        token: CancellationToken,
    ) {
        let name = job.name().clone();
        info!(
            job = %name,
            cadence = %job.cadence(),
            instance = %self.config.instance_name,
            prerequisites = prerequisites.len(),
            "scheduled job starting"
        );

        if wait_all(&prerequisites, &token).await.is_err() {
            info!(job = %name, "scheduled job cancelled before prerequisites completed");
            return;
        }

        loop {
            let checked_at = self.clock.now();
            let sleep = match self.tick(job.as_ref(), &token).await {
                Ok(TickOutcome::Skipped { sleep }) => sleep,
                Ok(TickOutcome::Ran { .. } | TickOutcome::BodyFailed { .. }) => {
                    // Eligible again already: the cycle is shorter than the
                    // body, so back off instead of running it back to back.
                    match self.remaining_sleep(job.cadence(), Some(checked_at), self.clock.now()) {
                        Some(_) => continue,
                        None => self.config.min_poll_interval,
                    }
                }
                Err(SchedulerError::Cancelled(_)) => break,
                Err(SchedulerError::Store(err)) => {
                    warn!(job = %name, error = %err, "lease check failed; retrying later");
                    self.config.min_poll_interval
                }
            };

            debug!(job = %name, sleep_ms = sleep.as_millis() as u64, "not eligible; sleeping");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        info!(job = %name, "scheduled job stopped");
    }

    /// Run exactly one lease check and, if eligible, one execution of the body.
    pub async fn tick(
        &self,
        job: &dyn ScheduledJob,
        token: &CancellationToken,
    ) -> Result<TickOutcome, SchedulerError> {
        if token.is_cancelled() {
            return Err(Cancelled.into());
        }

        let name = job.name();
        let cadence = job.cadence();
        let lease = self.store.get_lease(name).await?;
        let now = self.clock.now();
        let last = lease.as_ref().map(|lease| lease.last_executed);

        if let Some(sleep) = self.remaining_sleep(cadence, last, now) {
            return Ok(TickOutcome::Skipped { sleep });
        }

        let execution_count = lease.map_or(0, |lease| lease.execution_count) + 1;
        match self.store.upsert_lease(name, now, execution_count).await {
            Ok(_) => {}
            Err(StoreError::Conflict(reason)) => {
                debug!(job = %name, reason = %reason, "lease taken by another instance");
                return Ok(TickOutcome::Skipped {
                    sleep: self.config.min_poll_interval,
                });
            }
            Err(err) => return Err(err.into()),
        }

        let deadline = cadence.period_after(now);
        info!(job = %name, execution_count, "running scheduled job");

        let cycle = token.child_token();
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = tokio::time::timeout(deadline, job.run_once(cycle.clone())) => Some(result),
        };
        cycle.cancel();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            None => {
                info!(job = %name, elapsed_ms, "scheduled job interrupted by shutdown");
                Err(Cancelled.into())
            }
            Some(Ok(Ok(()))) => {
                info!(job = %name, execution_count, elapsed_ms, "scheduled job completed");
                Ok(TickOutcome::Ran { execution_count })
            }
            Some(Ok(Err(_))) if token.is_cancelled() => {
                info!(job = %name, elapsed_ms, "scheduled job interrupted by shutdown");
                Err(Cancelled.into())
            }
            Some(Ok(Err(err))) => {
                let message = format!("{err:#}");
                error!(job = %name, execution_count, elapsed_ms, error = %message, "scheduled job failed");
                Ok(TickOutcome::BodyFailed {
                    execution_count,
                    error: message,
                })
            }
            Some(Err(_elapsed)) => {
                error!(job = %name, execution_count, deadline_ms = deadline.as_millis() as u64, "scheduled job exceeded its deadline");
                Ok(TickOutcome::BodyFailed {
                    execution_count,
                    error: format!("deadline of {deadline:?} exceeded"),
                })
            }
        }
    }

    /// `None` when eligible now, else how long to sleep before checking again.
    fn remaining_sleep(
        &self,
        cadence: &Cadence,
        last: Option<chrono::DateTime<chrono::Utc>>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<Duration> {
        let floor = self.config.min_poll_interval;
        match cadence.next_eligible(last) {
            Some(next) if next <= now => None,
            Some(next) => {
                let remaining = (next - now).to_std().unwrap_or(floor);
                Some(remaining.max(floor))
            }
            None => Some(floor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use billrun_core::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    use crate::jobs::InMemoryLeaseStore;
    use crate::readiness::ReadinessGate;

    const HOUR: Duration = Duration::from_secs(3600);

    fn manual_clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap())
    }

    fn counting_job(name: &str, interval: Duration, runs: Arc<AtomicU32>) -> impl ScheduledJob {
        FnJob::new(name, Cadence::every(interval), move |_token| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn scheduler(store: Arc<InMemoryLeaseStore>, clock: ManualClock) -> LeaseScheduler {
        LeaseScheduler::new(store, Arc::new(clock), SchedulerConfig::default())
    }

    #[tokio::test]
    async fn runs_when_eligible_then_skips_until_next_interval() {
        let store = InMemoryLeaseStore::arc();
        let clock = manual_clock();
        let scheduler = scheduler(store.clone(), clock.clone());
        let runs = Arc::new(AtomicU32::new(0));
        let job = counting_job("invoice-run", HOUR, runs.clone());
        let token = CancellationToken::new();

        assert_eq!(
            scheduler.tick(&job, &token).await,
            Ok(TickOutcome::Ran { execution_count: 1 })
        );

        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(
            scheduler.tick(&job, &token).await,
            Ok(TickOutcome::Skipped {
                sleep: Duration::from_secs(50 * 60)
            })
        );

        clock.advance(chrono::Duration::minutes(50) + chrono::Duration::seconds(1));
        assert_eq!(
            scheduler.tick(&job, &token).await,
            Ok(TickOutcome::Ran { execution_count: 2 })
        );
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let lease = store.get_lease(job.name()).await.unwrap().unwrap();
        assert_eq!(lease.execution_count, 2);
        assert_eq!(lease.last_executed, clock.now());
    }

    #[tokio::test]
    async fn sleep_never_drops_below_floor() {
        let store = InMemoryLeaseStore::arc();
        let clock = manual_clock();
        let scheduler = scheduler(store, clock.clone());
        let job = counting_job("tiny", Duration::from_secs(60), Arc::new(AtomicU32::new(0)));
        let token = CancellationToken::new();

        scheduler.tick(&job, &token).await.unwrap();
        clock.advance(chrono::Duration::seconds(30));

        assert_eq!(
            scheduler.tick(&job, &token).await,
            Ok(TickOutcome::Skipped {
                sleep: Duration::from_secs(5 * 60)
            })
        );
    }

    #[tokio::test]
    async fn crash_after_heartbeat_skips_the_cycle() {
        let store = InMemoryLeaseStore::arc();
        let clock = manual_clock();
        let runs = Arc::new(AtomicU32::new(0));

        // First process commits the heartbeat, then dies mid-body.
        let crashing = FnJob::new("invoice-run", Cadence::every(HOUR), |_token| async {
            std::future::pending::<anyhow::Result<()>>().await
        });
        let shutdown = CancellationToken::new();
        let first = scheduler(store.clone(), clock.clone());
        let tick = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { first.tick(&crashing, &shutdown).await }
        });
        while store.get_lease(&JobName::new("invoice-run")).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        assert_eq!(tick.await.unwrap(), Err(SchedulerError::Cancelled(Cancelled)));

        // A restarted process sees the cycle as already executed.
        let restarted = scheduler(store.clone(), clock.clone());
        let job = counting_job("invoice-run", HOUR, runs.clone());
        let token = CancellationToken::new();
        clock.advance(chrono::Duration::minutes(1));
        assert!(matches!(
            restarted.tick(&job, &token).await,
            Ok(TickOutcome::Skipped { .. })
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(
            restarted.tick(&job, &token).await,
            Ok(TickOutcome::Ran { execution_count: 2 })
        );
    }

    #[tokio::test]
    async fn body_failure_is_reported_and_lease_still_advances() {
        let store = InMemoryLeaseStore::arc();
        let clock = manual_clock();
        let scheduler = scheduler(store.clone(), clock.clone());
        let job = FnJob::new("flaky", Cadence::every(HOUR), |_token| async {
            Err::<(), _>(anyhow::anyhow!("upstream unavailable"))
        });
        let token = CancellationToken::new();

        let outcome = scheduler.tick(&job, &token).await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::BodyFailed {
                execution_count: 1,
                error: "upstream unavailable".to_string()
            }
        );

        clock.advance(chrono::Duration::minutes(1));
        assert!(matches!(
            scheduler.tick(&job, &token).await,
            Ok(TickOutcome::Skipped { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn body_is_bounded_by_one_interval() {
        let store = InMemoryLeaseStore::arc();
        let scheduler = scheduler(store, manual_clock());
        let job = FnJob::new("slow", Cadence::every(Duration::from_secs(60)), |token: CancellationToken| async move {
            token.cancelled().await;
            Err::<(), _>(anyhow::anyhow!("observed deadline"))
        });

        let outcome = scheduler.tick(&job, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::BodyFailed { error, .. } if error.contains("deadline")));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_loop_backs_off_between_runs() {
        let store = InMemoryLeaseStore::arc();
        let scheduler = scheduler(store, manual_clock());
        let runs = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let handle = scheduler.schedule_job(
            counting_job("busy", Duration::ZERO, runs.clone()),
            Vec::new(),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn loop_waits_for_prerequisites_and_stops_on_cancel() {
        let store = InMemoryLeaseStore::arc();
        let scheduler = LeaseScheduler::new(
            store.clone(),
            Arc::new(SystemClock),
            SchedulerConfig::default().with_instance_name("test"),
        );
        let gate: ReadinessGate = ReadinessGate::new("schema");
        let runs = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let handle = scheduler.schedule_job(
            counting_job("invoice-run", HOUR, runs.clone()),
            vec![Arc::new(gate.clone())],
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        gate.signal();
        for _ in 0..100 {
            if runs.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler loop should stop on cancel")
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
