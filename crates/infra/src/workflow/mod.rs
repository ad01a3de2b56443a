//! Durable workflow runtime.
//!
//! ## Components
//!
//! - `HistoryStore`: instances and their append-only step history (in-memory or Postgres)
//! - `WorkflowEngine`: drives one instance by replaying its orchestrator and executing new steps
//! - `WorkflowDispatcher`: polls running root instances and advances them concurrently
//! - `WorkflowClient`: idempotent instance creation for producers

pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod postgres;
pub mod store;

pub use client::WorkflowClient;
pub use dispatcher::{DispatcherConfig, DispatcherHandle, DispatcherStats, WorkflowDispatcher};
pub use engine::WorkflowEngine;
pub use postgres::PostgresHistoryStore;
pub use store::{HistoryStore, InMemoryHistoryStore};
