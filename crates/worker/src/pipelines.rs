//! Document pipelines hosted by the worker.
//!
//! - `document.generate_and_deliver`: render → convert → email for one document
//! - `document.ingest_and_generate`: load the rows of a batch, then one
//!   `generate_and_deliver` sub-orchestration per row
//! - `invoice-run`: lease-scheduled job that starts the day's ingest batch
//!
//! The collaborators that do the actual rendering and delivery sit behind
//! [`DocumentServices`]; [`LoggingDocumentServices`] is the stand-in used
//! when no real adapters are wired in.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use billrun_core::{Clock, InstanceId, RetryPolicy};
use billrun_infra::ReadinessGate;
use billrun_infra::jobs::{Cadence, FnJob, ScheduledJob};
use billrun_infra::workflow::WorkflowClient;
use billrun_workflow::{ActivityError, OrchestrationContext, Registry, WorkflowResult};

pub const GENERATE_AND_DELIVER: &str = "document.generate_and_deliver";
pub const INGEST_AND_GENERATE: &str = "document.ingest_and_generate";

pub const LOAD_ROWS: &str = "document.load_rows";
pub const RENDER: &str = "document.render";
pub const CONVERT: &str = "document.convert";
pub const EMAIL: &str = "document.email";

pub const INVOICE_RUN_JOB: &str = "invoice-run";

/// One document to produce and send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub template: String,
    pub recipient: String,
    pub data: JsonValue,
}

/// A batch of documents identified by its billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentBatch {
    /// e.g. `2026-10-17`
    pub period: String,
}

/// Converted document in blob storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub location: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertRequest {
    pub file_name: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRequest {
    pub recipient: String,
    pub subject: String,
    pub document: StoredDocument,
}

/// Result of `generate_and_deliver`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub recipient: String,
    pub message_id: String,
}

/// Result of `ingest_and_generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub period: String,
    pub deliveries: Vec<Delivery>,
}

/// External collaborators of the pipelines.
///
/// Errors are treated as transient and retried per step policy.
#[async_trait]
pub trait DocumentServices: Send + Sync + 'static {
    async fn load_rows(&self, batch: &DocumentBatch) -> anyhow::Result<Vec<DocumentRequest>>;

    async fn render(&self, request: &DocumentRequest) -> anyhow::Result<String>;

    async fn convert(&self, request: &ConvertRequest) -> anyhow::Result<StoredDocument>;

    /// Returns the provider's message id.
    async fn email(&self, request: &EmailRequest) -> anyhow::Result<String>;
}

/// Stand-in services that only log what they would do.
#[derive(Debug, Default, Clone)]
pub struct LoggingDocumentServices;

#[async_trait]
impl DocumentServices for LoggingDocumentServices {
    async fn load_rows(&self, batch: &DocumentBatch) -> anyhow::Result<Vec<DocumentRequest>> {
        info!(period = %batch.period, rows = 0, "loaded batch rows");
        Ok(Vec::new())
    }

    async fn render(&self, request: &DocumentRequest) -> anyhow::Result<String> {
        info!(template = %request.template, recipient = %request.recipient, "rendering document");
        Ok(format!("<html><body data-template=\"{}\">{}</body></html>", request.template, request.data))
    }

    async fn convert(&self, request: &ConvertRequest) -> anyhow::Result<StoredDocument> {
        info!(file_name = %request.file_name, "converting document");
        Ok(StoredDocument {
            location: format!("memory://{}", request.file_name),
            size_bytes: request.html.len() as u64,
        })
    }

    async fn email(&self, request: &EmailRequest) -> anyhow::Result<String> {
        info!(recipient = %request.recipient, location = %request.document.location, "sending email");
        Ok(format!("log-{}-{}", request.recipient, request.document.location))
    }
}

fn step_policy() -> RetryPolicy {
    RetryPolicy::default()
}

async fn generate_and_deliver(ctx: OrchestrationContext, request: DocumentRequest) -> WorkflowResult<Delivery> {
    let html: String = ctx.call_activity(RENDER, &request, step_policy()).await?;

    let file_name = format!("{}-{}.pdf", request.template, ctx.instance_id());
    let document: StoredDocument = ctx
        .call_activity(CONVERT, &ConvertRequest { file_name, html }, step_policy())
        .await?;

    let email = EmailRequest {
        recipient: request.recipient.clone(),
        subject: format!("Your {}", request.template),
        document,
    };
    let message_id: String = ctx.call_activity(EMAIL, &email, step_policy()).await?;

    Ok(Delivery {
        recipient: request.recipient,
        message_id,
    })
}

async fn ingest_and_generate(ctx: OrchestrationContext, batch: DocumentBatch) -> WorkflowResult<BatchSummary> {
    let rows: Vec<DocumentRequest> = ctx.call_activity(LOAD_ROWS, &batch, step_policy()).await?;

    let mut deliveries = Vec::with_capacity(rows.len());
    for row in &rows {
        // Steps inside the child carry their own retries.
        let delivery: Delivery = ctx
            .call_sub_orchestration(GENERATE_AND_DELIVER, row, RetryPolicy::no_retry())
            .await?;
        deliveries.push(delivery);
    }

    Ok(BatchSummary {
        period: batch.period,
        deliveries,
    })
}

/// Register both pipelines and their activities.
pub fn register(registry: &mut Registry, services: Arc<dyn DocumentServices>) {
    registry
        .register_orchestrator(GENERATE_AND_DELIVER, generate_and_deliver)
        .register_orchestrator(INGEST_AND_GENERATE, ingest_and_generate);

    let s = services.clone();
    registry.register_activity(LOAD_ROWS, move |batch: DocumentBatch| {
        let s = s.clone();
        async move { Ok::<_, ActivityError>(s.load_rows(&batch).await?) }
    });
    let s = services.clone();
    registry.register_activity(RENDER, move |request: DocumentRequest| {
        let s = s.clone();
        async move { Ok::<_, ActivityError>(s.render(&request).await?) }
    });
    let s = services.clone();
    registry.register_activity(CONVERT, move |request: ConvertRequest| {
        let s = s.clone();
        async move { Ok::<_, ActivityError>(s.convert(&request).await?) }
    });
    let s = services;
    registry.register_activity(EMAIL, move |request: EmailRequest| {
        let s = s.clone();
        async move { Ok::<_, ActivityError>(s.email(&request).await?) }
    });
}

/// The recurring invoice run: one ingest batch per day.
///
/// The instance id is derived from the batch, so a second run on the same
/// day (from any process) finds the existing instance instead of starting
/// another one.
pub fn invoice_run_job(
    cadence: Cadence,
    dispatcher: ReadinessGate<WorkflowClient>,
    clock: Arc<dyn Clock>,
) -> impl ScheduledJob {
    FnJob::new(INVOICE_RUN_JOB, cadence, move |token| {
        let dispatcher = dispatcher.clone();
        let clock = clock.clone();
        async move {
            let client = dispatcher.wait_for_completion(&token).await?;
            let batch = DocumentBatch {
                period: clock.now().format("%Y-%m-%d").to_string(),
            };
            let id = InstanceId::derive(INVOICE_RUN_JOB, &batch)?;
            let id = client
                .create_workflow_instance(id, INGEST_AND_GENERATE, &batch)
                .await?;
            info!(instance_id = %id, period = %batch.period, "invoice run scheduled");
            Ok::<_, anyhow::Error>(())
        }
    })
}
