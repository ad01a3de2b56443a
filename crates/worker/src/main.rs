use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use billrun_core::{Clock, SystemClock};
use billrun_infra::jobs::{InMemoryLeaseStore, LeaseScheduler, LeaseStore, PostgresLeaseStore};
use billrun_infra::workflow::{HistoryStore, InMemoryHistoryStore, PostgresHistoryStore, WorkflowClient, WorkflowDispatcher};
use billrun_infra::{Prerequisite, ReadinessGate, RuntimeConfig, db};
use billrun_workflow::Registry;
use billrun_worker::pipelines::{self, LoggingDocumentServices};

const MAX_DB_CONNECTIONS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env().context("invalid configuration")?;
    billrun_observability::init(config.log_format);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (leases, history): (Arc<dyn LeaseStore>, Arc<dyn HistoryStore>) = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url, MAX_DB_CONNECTIONS)
                .await
                .context("failed to connect to postgres")?;
            let leases: Arc<dyn LeaseStore> = Arc::new(PostgresLeaseStore::new(pool.clone()));
            let history: Arc<dyn HistoryStore> = Arc::new(PostgresHistoryStore::new(pool));
            (leases, history)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores (state is lost on exit)");
            let leases: Arc<dyn LeaseStore> = InMemoryLeaseStore::arc();
            let history: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::with_clock(clock.clone()));
            (leases, history)
        }
    };

    let shutdown = CancellationToken::new();

    // Scheduled jobs wait for the schema and for the dispatcher.
    let schema_ready: ReadinessGate = ReadinessGate::new("schema");
    let dispatcher_ready: ReadinessGate<WorkflowClient> = ReadinessGate::new("dispatcher");

    leases.ensure_schema().await.context("failed to create lease schema")?;
    history.ensure_schema().await.context("failed to create workflow schema")?;
    schema_ready.signal();

    let mut registry = Registry::new();
    pipelines::register(&mut registry, Arc::new(LoggingDocumentServices));
    let dispatcher = WorkflowDispatcher::new(history, clock.clone())
        .with_registry(registry)
        .start(config.dispatcher.clone(), dispatcher_ready.clone(), shutdown.clone())
        .await
        .context("failed to start workflow dispatcher")?;

    let scheduler = LeaseScheduler::new(leases, clock.clone(), config.scheduler.clone());
    let schema: Arc<dyn Prerequisite> = Arc::new(schema_ready);
    let dispatcher_started: Arc<dyn Prerequisite> = Arc::new(dispatcher_ready.clone());
    let invoice_run = scheduler.schedule_job(
        pipelines::invoice_run_job(config.invoice_run.clone(), dispatcher_ready, clock),
        vec![schema, dispatcher_started],
        shutdown.clone(),
    );

    info!(
        instance = %config.scheduler.instance_name,
        invoice_run = %config.invoice_run,
        "billrun worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    shutdown.cancel();
    if let Err(err) = invoice_run.await {
        warn!(error = %err, "invoice-run job task failed");
    }
    dispatcher.shutdown().await;

    info!("billrun worker stopped");
    Ok(())
}
